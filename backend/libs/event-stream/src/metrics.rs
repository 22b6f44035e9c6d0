use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct ConsumerMetrics {
    pub messages: IntCounterVec,
    pub handler_failures: IntCounterVec,
    pub dispatch_duration_seconds: HistogramVec,
    pub pending_entries: IntGauge,
}

impl ConsumerMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let messages = IntCounterVec::new(
            Opts::new(
                "event_stream_messages_total",
                "Stream entries processed, by outcome",
            )
            .const_label("service", service.to_string()),
            &["outcome"],
        )
        .expect("valid metric opts for event_stream_messages_total");

        let handler_failures = IntCounterVec::new(
            Opts::new(
                "event_stream_handler_failures_total",
                "Dispatches that failed and left the entry pending",
            )
            .const_label("service", service.to_string()),
            &["event_type"],
        )
        .expect("valid metric opts for event_stream_handler_failures_total");

        let dispatch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "event_stream_dispatch_duration_seconds",
                "Time spent dispatching one event to all of its handlers",
            )
            .const_label("service", service.to_string()),
            &["event_type"],
        )
        .expect("valid metric opts for event_stream_dispatch_duration_seconds");

        let pending_entries = IntGauge::with_opts(
            Opts::new(
                "event_stream_pending_entries",
                "Entries delivered to the consumer group but not yet acknowledged",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for event_stream_pending_entries");

        for metric in [
            Box::new(messages.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(handler_failures.clone()),
            Box::new(dispatch_duration_seconds.clone()),
            Box::new(pending_entries.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register event stream metric: {}", e);
            }
        }

        Self {
            messages,
            handler_failures,
            dispatch_duration_seconds,
            pending_entries,
        }
    }
}
