use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::time::Duration;
use tracing::info;

use crate::common::{ConnectRetry, DatabaseError, retry_with_backoff};

/// Open a [`ConnectionManager`] and verify it with `PING`.
///
/// The manager reconnects on its own after the initial handshake, so one
/// instance is cloned into every task that needs it.
pub async fn connect(url: &str) -> Result<ConnectionManager, DatabaseError> {
    connect_with_config(url, ConnectionManagerConfig::new()).await
}

/// [`connect`] with explicit reconnect and timeout settings
pub async fn connect_with_config(
    url: &str,
    config: ConnectionManagerConfig,
) -> Result<ConnectionManager, DatabaseError> {
    info!("Connecting to Redis");

    let client = Client::open(url)?;
    let mut manager = ConnectionManager::new_with_config(client, config).await?;
    let _: String = redis::cmd("PING").query_async(&mut manager).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// Settings for a connection that carries blocking reads (`XREADGROUP BLOCK`).
///
/// The default response timeout is shorter than a typical block, so every
/// idle read would fail as a timeout. The response timeout must outlast the
/// block by `margin`.
pub fn blocking_read_config(block: Duration, margin: Duration) -> ConnectionManagerConfig {
    ConnectionManagerConfig::new().set_response_timeout(Some(block + margin))
}

/// [`connect`] wrapped in the startup retry loop
pub async fn connect_with_retry(
    url: &str,
    retry: ConnectRetry,
) -> Result<ConnectionManager, DatabaseError> {
    retry_with_backoff("redis", &retry, || connect(url)).await
}

/// [`connect_with_config`] wrapped in the startup retry loop
pub async fn connect_with_config_and_retry(
    url: &str,
    config: ConnectionManagerConfig,
    retry: ConnectRetry,
) -> Result<ConnectionManager, DatabaseError> {
    retry_with_backoff("redis", &retry, || connect_with_config(url, config.clone())).await
}
