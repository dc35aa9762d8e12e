//! Connectors and health probes for the ingest service's backing stores.
//!
//! # Features
//!
//! - `redis` (default) - Redis `ConnectionManager` connectors, PING probe
//! - `mongodb` (default) - MongoDB client connectors, `ping` probe
//! - `config` - `core_config::FromEnv` for [`redis::RedisConfig`] and
//!   [`mongodb::MongoConfig`]
//!
//! ```ignore
//! use database::{common::ConnectRetry, mongodb, redis};
//!
//! let client = mongodb::connect_from_config_with_retry(&mongo_cfg, ConnectRetry::default()).await?;
//! let conn = redis::connect_with_retry(&redis_cfg.url, ConnectRetry::default()).await?;
//! ```

pub mod common;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "mongodb")]
pub mod mongodb;

pub use common::{ConnectRetry, DatabaseError, DatabaseResult};
