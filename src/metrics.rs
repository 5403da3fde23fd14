//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `offchain_envelopes_total` - Inbound envelopes processed
//! - `offchain_replays_total` - Cached responses replayed for duplicate request ids
//! - `offchain_merge_conflicts_total` - Store version races resolved locally
//! - `offchain_commands_settled_total` - Commands archived after settlement
//! - `offchain_commands_stalled_total` - Commands whose retry budget ran out
//! - `offchain_settlement_duration_seconds` - Submission-to-confirmation latency

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Inbound envelopes processed
    pub envelopes_total: IntCounter,

    /// Cached responses replayed
    pub replays_total: IntCounter,

    /// Store version races resolved locally
    pub merge_conflicts_total: IntCounter,

    /// Commands archived after settlement
    pub commands_settled_total: IntCounter,

    /// Commands marked stalled
    pub commands_stalled_total: IntCounter,

    /// Submission-to-confirmation latency
    pub settlement_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let envelopes_total = IntCounter::with_opts(Opts::new(
            "offchain_envelopes_total",
            "Inbound envelopes processed",
        ))?;
        registry.register(Box::new(envelopes_total.clone()))?;

        let replays_total = IntCounter::with_opts(Opts::new(
            "offchain_replays_total",
            "Cached responses replayed for duplicate request ids",
        ))?;
        registry.register(Box::new(replays_total.clone()))?;

        let merge_conflicts_total = IntCounter::with_opts(Opts::new(
            "offchain_merge_conflicts_total",
            "Store version races resolved locally",
        ))?;
        registry.register(Box::new(merge_conflicts_total.clone()))?;

        let commands_settled_total = IntCounter::with_opts(Opts::new(
            "offchain_commands_settled_total",
            "Commands archived after settlement",
        ))?;
        registry.register(Box::new(commands_settled_total.clone()))?;

        let commands_stalled_total = IntCounter::with_opts(Opts::new(
            "offchain_commands_stalled_total",
            "Commands whose retry budget ran out",
        ))?;
        registry.register(Box::new(commands_stalled_total.clone()))?;

        let settlement_duration = Histogram::with_opts(
            HistogramOpts::new(
                "offchain_settlement_duration_seconds",
                "Submission-to-confirmation latency",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(settlement_duration.clone()))?;

        Ok(Self {
            envelopes_total,
            replays_total,
            merge_conflicts_total,
            commands_settled_total,
            commands_stalled_total,
            settlement_duration,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
