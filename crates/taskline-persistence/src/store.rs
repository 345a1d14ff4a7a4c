use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Key-value store with per-key expiry, holding execution records.
///
/// Implementations must be safe to share between execution units.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite `key`; `ttl` of `None` keeps it until deleted
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool>;
}
