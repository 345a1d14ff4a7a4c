use crate::{ConnectionUrl, HelloRequest, Message, MessageCodec, ProtocolError, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Connect retry budget
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// One framed connection that has completed the hello handshake
pub struct Connection {
    framed: Framed<TcpStream, MessageCodec>,
}

impl Connection {
    pub async fn open(url: &ConnectionUrl) -> Result<Self> {
        let stream = TcpStream::connect(url.address()).await?;
        stream.set_nodelay(true)?;
        let mut connection = Connection {
            framed: Framed::new(stream, MessageCodec),
        };

        match connection
            .call(Message::Hello(HelloRequest {
                vhost: url.vhost.clone(),
            }))
            .await?
        {
            Message::Ok => Ok(connection),
            other => Err(ProtocolError::Protocol(format!(
                "unexpected handshake response: {:?}",
                other.message_type()
            ))),
        }
    }

    /// Send one request and read its response
    pub async fn call(&mut self, request: Message) -> Result<Message> {
        self.framed.send(request).await?;
        match self.framed.next().await {
            Some(Ok(Message::Error(message))) => Err(ProtocolError::Server(message)),
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// Pool of connections to one broker service, safe to share between tasks.
///
/// Connections are checked out per request and returned on success; a
/// connection that failed mid-request is dropped.
pub struct ConnectionPool {
    url: ConnectionUrl,
    retry: RetryConfig,
    max_idle: usize,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    pub fn new(url: ConnectionUrl, retry: RetryConfig) -> Self {
        ConnectionPool {
            url,
            retry,
            max_idle: 16,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &ConnectionUrl {
        &self.url
    }

    /// Open a connection, retrying with exponential backoff until the budget is spent
    async fn connect(&self) -> Result<Connection> {
        let mut attempt = 0;
        loop {
            match Connection::open(&self.url).await {
                Ok(connection) => {
                    debug!("Connected to {}", self.url);
                    return Ok(connection);
                }
                Err(e) if attempt < self.retry.max_retries && e.is_transport() => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Connection to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        self.url,
                        attempt + 1,
                        self.retry.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ProtocolError::Unavailable {
                        attempts: attempt + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    /// Issue one request.
    ///
    /// A pooled connection may have gone stale while idle, so a transport
    /// failure on a reused connection is retried once on a fresh one.
    pub async fn request(&self, request: Message) -> Result<Message> {
        let pooled = self.idle.lock().pop();

        let (mut connection, reused) = match pooled {
            Some(connection) => (connection, true),
            None => (self.connect().await?, false),
        };

        let response = match connection.call(request.clone()).await {
            Err(e) if reused && e.is_transport() => {
                debug!("Pooled connection to {} failed ({}), reconnecting", self.url, e);
                connection = self.connect().await?;
                connection.call(request).await
            }
            other => other,
        };

        match response {
            Ok(response) => {
                self.release(connection);
                Ok(response)
            }
            // The server answered; the connection is still in sync.
            Err(ProtocolError::Server(message)) => {
                self.release(connection);
                Err(ProtocolError::Server(message))
            }
            Err(e) => Err(e),
        }
    }

    fn release(&self, connection: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(connection);
        }
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }
}
