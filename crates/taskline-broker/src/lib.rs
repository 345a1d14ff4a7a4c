pub mod broker;
pub mod config;
pub mod memory;
pub mod metrics;
mod queue;
pub mod remote;
pub mod server;

pub use broker::{Broker, BrokerError, Result};
pub use config::ServerConfig;
pub use memory::{BrokerStats, MemoryBroker};
pub use metrics::BrokerMetrics;
pub use remote::RemoteBroker;
pub use server::BrokerServer;

use std::sync::Arc;
use std::time::Duration;
use taskline_protocol::{ConnectionPool, ConnectionUrl, RetryConfig};

/// Open the broker named by `url`.
///
/// `memory://` yields a fresh in-process broker with the given visibility
/// timeout; for the broker service the timeout is the service's own.
pub fn connect(
    url: &str,
    visibility_timeout: Duration,
    retry: RetryConfig,
) -> Result<Arc<dyn Broker>> {
    let url = ConnectionUrl::parse(url)?;
    if url.is_memory() {
        return Ok(Arc::new(MemoryBroker::new(visibility_timeout)));
    }
    let pool = Arc::new(ConnectionPool::new(url, retry));
    Ok(Arc::new(RemoteBroker::new(pool)))
}
