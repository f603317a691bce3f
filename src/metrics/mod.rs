//! Prometheus metrics for mqrelay
//!
//! Relay statistics: what came in, what went out, and why anything was
//! dropped. Exposed at the /metrics endpoint when enabled.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All mqrelay metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Message flow, labelled by relay flow (forward / reverse)
    pub messages_received: IntCounterVec,
    pub messages_forwarded: IntCounterVec,
    pub messages_unmatched: IntCounterVec,

    // Drops
    pub rewrite_failures: IntCounterVec,
    pub duplicate_copies: IntCounterVec,
    pub messages_filtered: IntCounterVec,
    pub backpressure_drops: IntCounterVec,
    pub loop_drops: IntCounter,
    pub publish_failures: IntCounterVec,

    // Sessions
    pub session_reconnects: IntCounterVec,
    pub sessions_connected: IntGauge,

    // Performance metrics
    pub publish_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = IntCounterVec::new(
            Opts::new(
                "mqrelay_messages_received_total",
                "PUBLISH messages received from a source session",
            ),
            &["flow"],
        )
        .unwrap();

        let messages_forwarded = IntCounterVec::new(
            Opts::new(
                "mqrelay_messages_forwarded_total",
                "Messages acknowledged by the destination broker",
            ),
            &["flow"],
        )
        .unwrap();

        let messages_unmatched = IntCounterVec::new(
            Opts::new(
                "mqrelay_messages_unmatched_total",
                "Messages that matched no rule",
            ),
            &["flow"],
        )
        .unwrap();

        let rewrite_failures = IntCounterVec::new(
            Opts::new(
                "mqrelay_rewrite_failures_total",
                "Messages whose rule could not produce an outbound topic",
            ),
            &["flow"],
        )
        .unwrap();

        let duplicate_copies = IntCounterVec::new(
            Opts::new(
                "mqrelay_duplicate_copies_total",
                "Extra copies delivered for overlapping subscriptions",
            ),
            &["flow"],
        )
        .unwrap();

        let messages_filtered = IntCounterVec::new(
            Opts::new(
                "mqrelay_messages_filtered_total",
                "Messages dropped by a rule filter",
            ),
            &["reason"],
        )
        .unwrap();

        let backpressure_drops = IntCounterVec::new(
            Opts::new(
                "mqrelay_backpressure_drops_total",
                "Queued messages dropped because the outbound queue stayed full",
            ),
            &["flow"],
        )
        .unwrap();

        let loop_drops = IntCounter::with_opts(Opts::new(
            "mqrelay_loop_drops_total",
            "Inbound messages dropped because this relay published them",
        ))
        .unwrap();

        let publish_failures = IntCounterVec::new(
            Opts::new(
                "mqrelay_publish_failures_total",
                "Messages lost to a write or acknowledgement failure",
            ),
            &["flow"],
        )
        .unwrap();

        let session_reconnects = IntCounterVec::new(
            Opts::new(
                "mqrelay_session_reconnects_total",
                "Reconnect attempts after a session failed",
            ),
            &["session"],
        )
        .unwrap();

        let sessions_connected = IntGauge::with_opts(Opts::new(
            "mqrelay_sessions_connected",
            "Broker sessions currently connected",
        ))
        .unwrap();

        let publish_latency = Histogram::with_opts(
            HistogramOpts::new(
                "mqrelay_publish_latency_seconds",
                "Time from PUBLISH to final acknowledgement",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_forwarded.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_unmatched.clone()))
            .unwrap();
        registry
            .register(Box::new(rewrite_failures.clone()))
            .unwrap();
        registry
            .register(Box::new(duplicate_copies.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_filtered.clone()))
            .unwrap();
        registry
            .register(Box::new(backpressure_drops.clone()))
            .unwrap();
        registry.register(Box::new(loop_drops.clone())).unwrap();
        registry
            .register(Box::new(publish_failures.clone()))
            .unwrap();
        registry
            .register(Box::new(session_reconnects.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_connected.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_latency.clone()))
            .unwrap();

        Self {
            registry,
            messages_received,
            messages_forwarded,
            messages_unmatched,
            rewrite_failures,
            duplicate_copies,
            messages_filtered,
            backpressure_drops,
            loop_drops,
            publish_failures,
            session_reconnects,
            sessions_connected,
            publish_latency,
        }
    }

    // Helper methods

    pub fn message_received(&self, flow: &str) {
        self.messages_received.with_label_values(&[flow]).inc();
    }

    pub fn message_forwarded(&self, flow: &str, latency_secs: f64) {
        self.messages_forwarded.with_label_values(&[flow]).inc();
        self.publish_latency.observe(latency_secs);
    }

    pub fn message_unmatched(&self, flow: &str) {
        self.messages_unmatched.with_label_values(&[flow]).inc();
    }

    pub fn rewrite_failed(&self, flow: &str) {
        self.rewrite_failures.with_label_values(&[flow]).inc();
    }

    pub fn duplicate_dropped(&self, flow: &str) {
        self.duplicate_copies.with_label_values(&[flow]).inc();
    }

    pub fn message_filtered(&self, reason: &str) {
        self.messages_filtered.with_label_values(&[reason]).inc();
    }

    pub fn backpressure_drop(&self, flow: &str) {
        self.backpressure_drops.with_label_values(&[flow]).inc();
    }

    pub fn loop_dropped(&self) {
        self.loop_drops.inc();
    }

    pub fn publish_failed(&self, flow: &str) {
        self.publish_failures.with_label_values(&[flow]).inc();
    }

    pub fn session_reconnect(&self, session: &str) {
        self.session_reconnects.with_label_values(&[session]).inc();
    }

    pub fn session_connected(&self) {
        self.sessions_connected.inc();
    }

    pub fn session_disconnected(&self) {
        self.sessions_connected.dec();
    }

    /// Total messages relayed across both flows
    pub fn relayed_total(&self) -> u64 {
        ["forward", "reverse"]
            .iter()
            .map(|flow| self.messages_forwarded.with_label_values(&[flow]).get())
            .sum()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
