use async_trait::async_trait;
use std::collections::HashMap;

use crate::AuthBackend;

/// In-memory credential store, used for the metrics scrape account.
pub struct InMemoryAuthBackend {
    users: HashMap<String, String>,
}

impl InMemoryAuthBackend {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn single(username: &str, password: &str) -> Self {
        Self::new(HashMap::from([(username.to_string(), password.to_string())]))
    }
}

#[async_trait]
impl AuthBackend for InMemoryAuthBackend {
    async fn validate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .map(|pw| constant_time_eq(pw.as_bytes(), password.as_bytes()))
            .unwrap_or(false)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
