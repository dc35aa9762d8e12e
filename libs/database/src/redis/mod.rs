//! Redis connector and health probe

mod config;
mod connector;
mod health;

pub use config::RedisConfig;
pub use connector::{
    blocking_read_config, connect, connect_with_config, connect_with_config_and_retry,
    connect_with_retry,
};
pub use health::check_health;

pub use redis::aio::{ConnectionManager, ConnectionManagerConfig};
pub use redis::{AsyncCommands, Client, RedisResult};
