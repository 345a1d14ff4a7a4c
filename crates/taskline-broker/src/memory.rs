use crate::broker::{Broker, BrokerError, Result};
use crate::queue::{QueueState, StoredMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use taskline_core::{Delivery, DeliveryTag, Envelope, Requeue};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound on one consumer sleep, so reclaimed deliveries are noticed
const MAX_POLL: Duration = Duration::from_secs(1);
const MAX_DEAD_LETTERS: usize = 1024;

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<DeliveryTag, Unacked>,
    dead_letters: VecDeque<(String, Envelope)>,
    next_tag: u64,
    redelivered: u64,
    closed: bool,
}

impl State {
    /// Return deliveries whose consumer went quiet to the head of their queue
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in &expired {
            if let Some(unacked) = self.unacked.remove(tag) {
                warn!(
                    "Delivery {} on {} exceeded its visibility timeout, redelivering",
                    tag, unacked.queue
                );
                self.queues
                    .entry(unacked.queue)
                    .or_default()
                    .push_front(unacked.message);
                self.redelivered += 1;
            }
        }
        expired.len()
    }

    fn next_wake(&self, queue: &str) -> Option<Instant> {
        let delayed = self.queues.get(queue).and_then(QueueState::next_ready_at);
        let visibility = self.unacked.values().map(|u| u.deadline).min();
        match (delayed, visibility) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dead_letter(&mut self, queue: String, envelope: Envelope) {
        if self.dead_letters.len() >= MAX_DEAD_LETTERS {
            self.dead_letters.pop_front();
        }
        self.dead_letters.push_back((queue, envelope));
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub ready: usize,
    pub delayed: usize,
    pub unacked: usize,
    pub dead_lettered: usize,
    pub redelivered: u64,
}

/// In-process broker.
///
/// Serves as the `memory://` transport and as the storage behind the
/// broker service. Delivery tags are unique across all queues.
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        MemoryBroker {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Redeliver expired checkouts now instead of waiting for a consumer
    pub fn reclaim_expired(&self) -> usize {
        let reclaimed = self.state.lock().reclaim_expired(Instant::now());
        if reclaimed > 0 {
            self.notify.notify_waiters();
        }
        reclaimed
    }

    /// Ready plus delayed messages on `queue`, excluding checked-out ones
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(QueueState::len)
            .unwrap_or(0)
    }

    pub fn unacked_len(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Messages dropped by `nack` without requeue, oldest first
    pub fn dead_letters(&self) -> Vec<(String, Envelope)> {
        self.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        BrokerStats {
            ready: state.queues.values().map(QueueState::ready_len).sum(),
            delayed: state.queues.values().map(QueueState::delayed_len).sum(),
            unacked: state.unacked.len(),
            dead_lettered: state.dead_letters.len(),
            redelivered: state.redelivered,
        }
    }

    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        let state = self.state.lock();
        let mut depths: Vec<(String, usize)> = state
            .queues
            .iter()
            .map(|(name, q)| (name.clone(), q.len()))
            .collect();
        depths.sort();
        depths
    }

    /// Refuse every call until [`MemoryBroker::reopen`]; checked-out
    /// messages stay checked out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn reopen(&self) {
        self.state.lock().closed = false;
        self.notify.notify_waiters();
    }

    fn try_take(&self, queue: &str) -> Result<std::result::Result<Delivery, Option<Instant>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Unavailable("broker closed".to_string()));
        }

        let now = Instant::now();
        state.reclaim_expired(now);

        let message = state.queues.get_mut(queue).and_then(|q| q.pop(now));
        let Some(mut message) = message else {
            return Ok(Err(state.next_wake(queue)));
        };

        message.delivery_count += 1;
        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            envelope: message.envelope.clone(),
            delivery_count: message.delivery_count,
            requeue_count: message.requeue_count,
        };
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                message,
                deadline: now + self.visibility_timeout,
            },
        );
        Ok(Ok(delivery))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::Unavailable("broker closed".to_string()));
            }

            let now = Instant::now();
            let ready_at = envelope.eta.map(|eta| {
                now + (eta - chrono::Utc::now()).to_std().unwrap_or_default()
            });
            state.queues.entry(queue.to_string()).or_default().push(
                StoredMessage {
                    envelope,
                    delivery_count: 0,
                    requeue_count: 0,
                },
                ready_at,
                now,
            );
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking, so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = match self.try_take(queue)? {
                Ok(delivery) => {
                    debug!("Delivered {} from {}", delivery.tag, queue);
                    return Ok(Some(delivery));
                }
                Err(next_wake) => next_wake,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = next_wake
                .map(|at| at.min(deadline))
                .unwrap_or(deadline)
                .min(now + MAX_POLL);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Unavailable("broker closed".to_string()));
        }
        state
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(tag))
    }

    async fn touch(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Unavailable("broker closed".to_string()));
        }
        let unacked = state
            .unacked
            .get_mut(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        unacked.deadline = Instant::now() + self.visibility_timeout;
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: Requeue) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::Unavailable("broker closed".to_string()));
            }
            let Unacked { queue, mut message, .. } = state
                .unacked
                .remove(&tag)
                .ok_or(BrokerError::UnknownDelivery(tag))?;

            let now = Instant::now();
            match requeue {
                Requeue::No => {
                    debug!("Dead-lettering {} from {}", tag, queue);
                    state.dead_letter(queue, message.envelope);
                    return Ok(());
                }
                Requeue::Now => {
                    message.requeue_count += 1;
                    state
                        .queues
                        .entry(queue)
                        .or_default()
                        .push(message, None, now);
                }
                Requeue::AfterMs(ms) => {
                    message.requeue_count += 1;
                    let ready_at = now + Duration::from_millis(ms);
                    state
                        .queues
                        .entry(queue)
                        .or_default()
                        .push(message, Some(ready_at), now);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
