//! Metrics sink (§6): an outbound trait the core pushes measurement and
//! utilization updates into. Serialization and transport are the observer's
//! concern; a no-op default is provided so the core has something to call
//! without an embedder. Grounded on the trait-object observer pattern named
//! explicitly in §9 ("narrow capability set ... as a trait object rather
//! than inheritance").

use fbforward_protocol::{Protocol, SmoothedMetrics};

/// One upstream's scoring/utilization snapshot, pushed after every
/// `UpstreamManager::ingest_measurement` call.
#[derive(Debug, Clone)]
pub struct UpstreamMetricsUpdate {
    pub tag: String,
    pub protocol: Protocol,
    pub metrics: SmoothedMetrics,
    pub s_tcp: f64,
    pub s_udp: f64,
    pub s_overall: f64,
    pub utilization_up: f64,
    pub utilization_down: f64,
    pub reachable: bool,
    pub usable: bool,
    pub is_primary: bool,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub active_flow_count: u64,
}

pub trait MetricsSink: Send + Sync {
    fn record_upstream(&self, update: UpstreamMetricsUpdate);
}

/// Default sink when no embedder supplies one.
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_upstream(&self, _update: UpstreamMetricsUpdate) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);
    impl MetricsSink for CountingSink {
        fn record_upstream(&self, _update: UpstreamMetricsUpdate) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sink_receives_pushed_updates() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink(count.clone());
        sink.record_upstream(UpstreamMetricsUpdate {
            tag: "a".into(),
            protocol: Protocol::Tcp,
            metrics: SmoothedMetrics::default(),
            s_tcp: 50.0,
            s_udp: 0.0,
            s_overall: 50.0,
            utilization_up: 0.1,
            utilization_down: 0.1,
            reachable: true,
            usable: true,
            is_primary: true,
            bytes_up: 0,
            bytes_down: 0,
            active_flow_count: 0,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_sink_accepts_updates_without_side_effects() {
        let sink = NoopMetricsSink;
        sink.record_upstream(UpstreamMetricsUpdate {
            tag: "a".into(),
            protocol: Protocol::Udp,
            metrics: SmoothedMetrics::default(),
            s_tcp: 0.0,
            s_udp: 40.0,
            s_overall: 40.0,
            utilization_up: 0.0,
            utilization_down: 0.0,
            reachable: true,
            usable: true,
            is_primary: false,
            bytes_up: 0,
            bytes_down: 0,
            active_flow_count: 0,
        });
    }
}
