use ingest_pipeline::Payload;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// User as published by upstream services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct User {
    /// Upstream identifier, stored as the document `_id`
    #[validate(length(min = 1, max = 64))]
    pub id: String,
    #[validate(length(min = 1, max = 100))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 7, max = 20))]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, max = 150))]
    pub age: Option<i32>,
}

impl Payload for User {
    fn key(&self) -> String {
        self.id.clone()
    }
}
