//! Users Domain
//!
//! The user event consumed from `users:ingest` and written to the `user`
//! collection.
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_users::{User, UserStream};
//! use ingest_pipeline::{DeriveValidator, MongoWriter, WorkerConfig};
//!
//! let config = WorkerConfig::from_stream_def::<UserStream>();
//! let validator = DeriveValidator::<User>::new();
//! let writer = MongoWriter::<User>::new(&db, "user");
//! ```

pub mod models;
pub mod streams;

pub use models::User;
pub use streams::UserStream;
