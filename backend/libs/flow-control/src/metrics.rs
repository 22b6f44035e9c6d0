use prometheus::{IntCounter, IntCounterVec, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct FlowControlMetrics {
    pub rate_limit_decisions: IntCounterVec,
    pub coalesce_results: IntCounterVec,
    pub coalesce_flushed_entries: IntCounter,
}

impl FlowControlMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let rate_limit_decisions = IntCounterVec::new(
            Opts::new(
                "rate_limit_decisions_total",
                "Rate limit checks by decision (allowed, rejected)",
            )
            .const_label("service", service.to_string()),
            &["decision"],
        )
        .expect("valid metric opts for rate_limit_decisions_total");

        let coalesce_results = IntCounterVec::new(
            Opts::new(
                "coalesce_results_total",
                "Coalesce calls by result status (queued, duplicate)",
            )
            .const_label("service", service.to_string()),
            &["status"],
        )
        .expect("valid metric opts for coalesce_results_total");

        let coalesce_flushed_entries = IntCounter::with_opts(
            Opts::new(
                "coalesce_flushed_entries_total",
                "Total number of entries returned by batch flushes",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for coalesce_flushed_entries_total");

        for metric in [
            Box::new(rate_limit_decisions.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(coalesce_results.clone()),
            Box::new(coalesce_flushed_entries.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register flow-control metric: {}", e);
            }
        }

        Self {
            rate_limit_decisions,
            coalesce_results,
            coalesce_flushed_entries,
        }
    }
}
