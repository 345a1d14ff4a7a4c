use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use taskline_core::Envelope;
use tokio::time::Instant;

/// A message held by the broker, between deliveries
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub envelope: Envelope,
    pub delivery_count: u32,
    pub requeue_count: u32,
}

/// A message that may not be delivered before `ready_at`
#[derive(Debug)]
struct DelayedMessage {
    ready_at: Instant,
    seq: u64,
    message: StoredMessage,
}

impl PartialEq for DelayedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for DelayedMessage {}

impl PartialOrd for DelayedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest first on a max-heap; insertion order breaks ties
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One named queue: ready messages in FIFO order plus delayed ones
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    ready: VecDeque<StoredMessage>,
    delayed: BinaryHeap<DelayedMessage>,
    seq: u64,
}

impl QueueState {
    pub fn push(&mut self, message: StoredMessage, ready_at: Option<Instant>, now: Instant) {
        match ready_at {
            Some(at) if at > now => {
                self.seq += 1;
                self.delayed.push(DelayedMessage {
                    ready_at: at,
                    seq: self.seq,
                    message,
                });
            }
            _ => self.ready.push_back(message),
        }
    }

    /// Put a message back at the head, for redelivery after a lost consumer
    pub fn push_front(&mut self, message: StoredMessage) {
        self.ready.push_front(message);
    }

    /// Next deliverable message, promoting delayed ones that came due
    pub fn pop(&mut self, now: Instant) -> Option<StoredMessage> {
        while self
            .delayed
            .peek()
            .map(|d| d.ready_at <= now)
            .unwrap_or(false)
        {
            if let Some(delayed) = self.delayed.pop() {
                self.ready.push_back(delayed.message);
            }
        }
        self.ready.pop_front()
    }

    /// When the earliest delayed message becomes deliverable
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.ready_at)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}
