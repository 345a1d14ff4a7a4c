use crate::{Result, ResultStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use taskline_protocol::{ConnectionPool, DeleteRequest, GetRequest, Message, SetRequest};

/// Result store hosted by the broker service
pub struct RemoteResultStore {
    pool: Arc<ConnectionPool>,
}

impl RemoteResultStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        RemoteResultStore { pool }
    }
}

#[async_trait]
impl ResultStore for RemoteResultStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self
            .pool
            .request(Message::Get(GetRequest { key: key.to_string() }))
            .await?
        {
            Message::Value(value) => Ok(value),
            other => Err(StoreError::unexpected(&other)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let request = Message::Set(SetRequest {
            key: key.to_string(),
            value,
            ttl_ms: ttl.map(|ttl| ttl.as_millis().min(u64::MAX as u128) as u64),
        });
        match self.pool.request(request).await? {
            Message::Ok => Ok(()),
            other => Err(StoreError::unexpected(&other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self
            .pool
            .request(Message::Delete(DeleteRequest { key: key.to_string() }))
            .await?
        {
            Message::Deleted(existed) => Ok(existed),
            other => Err(StoreError::unexpected(&other)),
        }
    }
}
