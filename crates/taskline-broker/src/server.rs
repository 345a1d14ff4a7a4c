use crate::{Broker, BrokerMetrics, MemoryBroker, ServerConfig};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use taskline_persistence::{MemoryResultStore, ResultStore};
use taskline_protocol::{namespaced, Message, MessageCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest a single consume request may hold its connection
const MAX_CONSUME_WAIT: Duration = Duration::from_secs(30);

/// TCP service hosting a broker and a result store for remote clients
pub struct BrokerServer {
    config: ServerConfig,
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryResultStore>,
    metrics: Arc<BrokerMetrics>,
    connections: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl BrokerServer {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let broker = MemoryBroker::new(config.visibility_timeout());
        let metrics = BrokerMetrics::new()?;

        Ok(BrokerServer {
            connections: Arc::new(Semaphore::new(config.max_connections)),
            broker: Arc::new(broker),
            store: Arc::new(MemoryResultStore::new()),
            metrics: Arc::new(metrics),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Broker listening on {}", listener.local_addr()?);

        let server = self.clone();
        tokio::spawn(async move {
            server.background_tasks().await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let Ok(permit) = self.connections.clone().try_acquire_owned() else {
                                warn!("Connection limit reached, refusing {}", addr);
                                continue;
                            };
                            debug!("New connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.metrics.connections.inc();
                                if let Err(e) = server.handle_connection(stream).await {
                                    debug!("Connection from {} ended: {}", addr, e);
                                }
                                server.metrics.connections.dec();
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down broker");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let mut framed = Framed::new(stream, MessageCodec);

        let vhost = match framed.next().await {
            Some(Ok(Message::Hello(hello))) => {
                framed.send(Message::Ok).await?;
                hello.vhost
            }
            Some(Ok(other)) => {
                framed
                    .send(Message::Error(format!(
                        "expected Hello, got {:?}",
                        other.message_type()
                    )))
                    .await?;
                return Ok(());
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        };

        loop {
            let message = tokio::select! {
                next = framed.next() => next,
                _ = self.shutdown.cancelled() => break,
            };
            match message {
                Some(Ok(message)) => {
                    let response = self.handle_message(&vhost, message).await;
                    framed.send(response).await?;
                }
                Some(Err(e)) => {
                    warn!("Protocol error: {}", e);
                    break;
                }
                None => break,
            }
        }

        Ok(())
    }

    async fn handle_message(&self, vhost: &str, message: Message) -> Message {
        let (op, response) = match message {
            Message::Publish(req) => (
                "publish",
                self.broker
                    .publish(&namespaced(vhost, &req.queue), req.envelope)
                    .await
                    .map(|_| Message::Ok)
                    .map_err(|e| e.to_string()),
            ),
            Message::Consume(req) => {
                let wait = Duration::from_millis(req.wait_ms).min(MAX_CONSUME_WAIT);
                let queue = namespaced(vhost, &req.queue);
                let result = tokio::select! {
                    result = self.broker.consume(&queue, wait) => result,
                    _ = self.shutdown.cancelled() => Ok(None),
                };
                (
                    "consume",
                    result
                        .map(|delivery| {
                            // Clients see their own queue names
                            Message::Delivery(delivery.map(|mut d| {
                                d.queue = req.queue.clone();
                                d
                            }))
                        })
                        .map_err(|e| e.to_string()),
                )
            }
            Message::Ack(req) => (
                "ack",
                self.broker
                    .ack(req.tag)
                    .await
                    .map(|_| Message::Ok)
                    .map_err(|e| e.to_string()),
            ),
            Message::Nack(req) => (
                "nack",
                self.broker
                    .nack(req.tag, req.requeue)
                    .await
                    .map(|_| Message::Ok)
                    .map_err(|e| e.to_string()),
            ),
            Message::Touch(req) => (
                "touch",
                self.broker
                    .touch(req.tag)
                    .await
                    .map(|_| Message::Ok)
                    .map_err(|e| e.to_string()),
            ),
            Message::Get(req) => (
                "get",
                self.store
                    .get(&namespaced(vhost, &req.key))
                    .await
                    .map(Message::Value)
                    .map_err(|e| e.to_string()),
            ),
            Message::Set(req) => (
                "set",
                self.store
                    .set(
                        &namespaced(vhost, &req.key),
                        req.value,
                        req.ttl_ms.map(Duration::from_millis),
                    )
                    .await
                    .map(|_| Message::Ok)
                    .map_err(|e| e.to_string()),
            ),
            Message::Delete(req) => (
                "delete",
                self.store
                    .delete(&namespaced(vhost, &req.key))
                    .await
                    .map(Message::Deleted)
                    .map_err(|e| e.to_string()),
            ),
            other => (
                "invalid",
                Err(format!("unexpected message {:?}", other.message_type())),
            ),
        };

        self.metrics.inc_request(op, response.is_ok());
        response.unwrap_or_else(|e| {
            debug!("{} failed: {}", op, e);
            Message::Error(e)
        })
    }

    /// Periodic sweep of expired results and overdue deliveries
    async fn background_tasks(&self) {
        let mut interval = tokio::time::interval(self.config.purge_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.store.purge_expired();
                    self.broker.reclaim_expired();
                    self.metrics.update(
                        &self.broker.stats(),
                        &self.broker.queue_depths(),
                        self.store.len(),
                    );
                }
                _ = self.shutdown.cancelled() => {
                    break;
                }
            }
        }
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }

    pub fn store(&self) -> Arc<MemoryResultStore> {
        self.store.clone()
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.metrics.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
