use crate::memory::BrokerStats;
use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Prometheus metrics for the broker service
pub struct BrokerMetrics {
    pub registry: Registry,

    /// Requests by operation and outcome
    pub requests_total: IntCounterVec,

    pub queue_depth: IntGaugeVec,
    pub unacked: IntGauge,
    pub redelivered: IntGauge,
    pub dead_lettered: IntGauge,

    pub connections: IntGauge,
    pub stored_results: IntGauge,
}

impl BrokerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("taskline_broker_requests_total", "Broker requests by operation and outcome"),
            &["op", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("taskline_broker_queue_depth", "Messages waiting per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let unacked = IntGauge::new("taskline_broker_unacked", "Deliveries awaiting ack")?;
        registry.register(Box::new(unacked.clone()))?;

        let redelivered = IntGauge::new(
            "taskline_broker_redelivered",
            "Deliveries returned after their visibility timeout",
        )?;
        registry.register(Box::new(redelivered.clone()))?;

        let dead_lettered =
            IntGauge::new("taskline_broker_dead_lettered", "Dead-lettered messages")?;
        registry.register(Box::new(dead_lettered.clone()))?;

        let connections = IntGauge::new("taskline_broker_connections", "Open client connections")?;
        registry.register(Box::new(connections.clone()))?;

        let stored_results =
            IntGauge::new("taskline_broker_stored_results", "Keys in the result store")?;
        registry.register(Box::new(stored_results.clone()))?;

        Ok(BrokerMetrics {
            registry,
            requests_total,
            queue_depth,
            unacked,
            redelivered,
            dead_lettered,
            connections,
            stored_results,
        })
    }

    pub fn inc_request(&self, op: &str, ok: bool) {
        self.requests_total
            .with_label_values(&[op, if ok { "ok" } else { "error" }])
            .inc();
    }

    pub fn update(&self, stats: &BrokerStats, depths: &[(String, usize)], stored_results: usize) {
        for (queue, depth) in depths {
            self.queue_depth.with_label_values(&[queue]).set(*depth as i64);
        }
        self.unacked.set(stats.unacked as i64);
        self.redelivered.set(stats.redelivered as i64);
        self.dead_lettered.set(stats.dead_lettered as i64);
        self.stored_results.set(stored_results as i64);
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
