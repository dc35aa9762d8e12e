//! Shared test utilities for pipeline testing
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestMongo`: MongoDB container with automatic cleanup (feature: "mongo")
//! - `TestDataBuilder`: deterministic, per-test names for streams and keys
//!
//! # Usage
//!
//! Add the features you need to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis", "mongo"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestMongo, TestRedis};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_stream_test() {
//!     let redis = TestRedis::new().await;
//!     let conn = redis.connection_manager().await;
//!     let mongo = TestMongo::new().await;
//!     let db = mongo.database("ingest_test").await;
//! }
//! ```

#[cfg(feature = "mongo")]
mod mongo;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "mongo")]
pub use mongo::TestMongo;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic names
///
/// Tests sharing one container stay isolated by deriving their stream and
/// document names from the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_replay_pending");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Stream name unique to this test, e.g. `test:12345:users`
    pub fn stream(&self, name: &str) -> String {
        format!("test:{}:{}", self.seed, name)
    }

    /// Document key unique to this test
    pub fn key(&self, prefix: &str, n: usize) -> String {
        format!("{}-{}-{}", prefix, self.seed, n)
    }
}
