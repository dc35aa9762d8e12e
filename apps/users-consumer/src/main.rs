//! Users Consumer - Entry Point
//!
//! Ingests user events from a Redis stream into MongoDB.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    users_consumer::run().await
}
