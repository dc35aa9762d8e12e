use mongodb::{Client, bson::doc};

use crate::common::DatabaseError;

/// `ping` the admin database. Cheap and needs no privileges.
pub async fn check_health(client: &Client) -> Result<(), DatabaseError> {
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await
        .map(|_| ())
        .map_err(|e| DatabaseError::HealthCheckFailed(format!("MongoDB ping failed: {e}")))
}
