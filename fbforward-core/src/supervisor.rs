//! Supervisor (§2, §9): owns every long-lived component as plain fields of
//! one `Runtime` struct, never behind a process-wide singleton. A restart
//! builds a fresh `Runtime` and the caller swaps its one reference; nothing
//! else reaches across instances. Shutdown is a single broadcast fired once,
//! observed by listeners first, then copy loops and probes (§5).

use crate::config::Config;
use crate::control::{ControlPlane, PrimaryMode, ScheduleStatus};
use crate::metrics_sink::{MetricsSink, NoopMetricsSink};
use crate::model::{Flow, Upstream};
use crate::prober::{send_echo, ReachabilityWindow};
use crate::scheduler::{ScheduleDecision, UpstreamSchedule};
use crate::status_sink::{FlowEvent, MeasurementCompletionEvent, MeasurementDirection, StatusEvent, StatusSink};
use crate::tcp_forwarder::{ForwardObserver, TcpForwarder};
use crate::udp_forwarder::UdpForwarder;
use crate::upstream_manager::{UpstreamManager, UpstreamSnapshot};
use fbforward_measure::MeasurementClientConfig;
use fbforward_protocol::{Protocol, RawMeasurement};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Everything the running process owns. Constructed fresh on startup and on
/// every restart; never stored in a `static` or `OnceCell` (§9 "no
/// process-wide singleton").
pub struct Runtime {
    config: Config,
    manager: Arc<UpstreamManager>,
    shutdown_tx: broadcast::Sender<()>,
    metrics_sink: Arc<dyn MetricsSink>,
    status_sink: StatusSink,
    status_rx: tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<StatusEvent>>>,
    icmp_sequence: AtomicU16,
    /// Live forwarders, kept around after spawning only so `push_metrics` can
    /// read real per-upstream flow counts (§6 "active flow counts").
    forwarders: tokio::sync::Mutex<Vec<ForwarderHandle>>,
}

/// Narrows a running forwarder down to the one thing the supervisor needs
/// back from it post-spawn.
enum ForwarderHandle {
    Tcp(Arc<TcpForwarder>),
    Udp(Arc<UdpForwarder>),
}

impl ForwarderHandle {
    async fn active_flow_count(&self, tag: &str) -> usize {
        match self {
            ForwarderHandle::Tcp(f) => f.active_flow_count(tag).await,
            ForwarderHandle::Udp(f) => f.active_flow_count(tag).await,
        }
    }
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let stale_threshold = Duration::from_millis(config.measurement.stale_threshold_ms);
        let warmup = Duration::from_millis(config.measurement.fast_start.warmup_duration_ms);

        let upstreams: Vec<Upstream> = config
            .upstreams
            .iter()
            .map(|u| {
                let endpoint: SocketAddr = u
                    .measurement_endpoint
                    .parse()
                    .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
                let mut upstream = Upstream::new(u.tag.clone(), u.host.clone(), endpoint);
                upstream.priority = u.priority;
                upstream.bias = u.bias;
                upstream
            })
            .collect();

        let manager = Arc::new(UpstreamManager::new(
            upstreams,
            config.scoring,
            config.switching,
            stale_threshold,
            warmup,
        ));

        let (shutdown_tx, _) = broadcast::channel(16);
        let (status_sink, status_rx) = StatusSink::new();

        Self {
            config,
            manager,
            shutdown_tx,
            metrics_sink: Arc::new(NoopMetricsSink),
            status_sink,
            status_rx: tokio::sync::Mutex::new(Some(status_rx)),
            icmp_sequence: AtomicU16::new(0),
            forwarders: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    /// Hands the flow/measurement event receiver to an embedder. Returns
    /// `None` if already taken; the core keeps publishing regardless (events
    /// are dropped under backpressure once nobody is receiving).
    pub async fn take_status_receiver(&self) -> Option<tokio::sync::mpsc::Receiver<StatusEvent>> {
        self.status_rx.lock().await.take()
    }

    /// Resolves each upstream's `host` field to its initial active IP.
    /// Re-resolution on failure is out of scope; a host that fails to
    /// resolve at startup simply starts out unreachable.
    async fn resolve_upstreams(&self) {
        for tag in self.manager.upstream_tags().await {
            let host = self
                .config
                .upstreams
                .iter()
                .find(|u| u.tag == tag)
                .map(|u| u.host.clone());
            let Some(host) = host else { continue };
            if let Ok(ip) = host.parse() {
                self.set_active_ip(&tag, ip).await;
            } else if let Ok(mut addrs) = tokio::net::lookup_host((host.as_str(), 0)).await {
                if let Some(addr) = addrs.next() {
                    self.set_active_ip(&tag, addr.ip()).await;
                }
            }
        }
    }

    async fn set_active_ip(&self, tag: &str, ip: std::net::IpAddr) {
        // UpstreamManager has no direct mutator for active_ip besides the
        // constructor; record it through the manager's internal table via
        // the same lock discipline as dial-failure/reachability updates.
        self.manager.set_active_ip(tag, ip).await;
    }

    /// Runs the reachability prober loop for every upstream (§4.8).
    async fn run_probers(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_millis(self.config.reachability.probe_interval_ms);
        let window_size = self.config.reachability.window_size;
        let mut windows: HashMap<String, ReachabilityWindow> = self
            .manager
            .upstream_tags()
            .await
            .into_iter()
            .map(|tag| (tag, ReachabilityWindow::new(window_size)))
            .collect();
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tick.tick() => {
                    for tag in self.manager.upstream_tags().await {
                        let Some(ip) = self.manager.active_ip(&tag).await else { continue };
                        let seq = self.icmp_sequence.fetch_add(1, Ordering::Relaxed);
                        let success = tokio::task::spawn_blocking(move || {
                            send_echo(ip, 0xFB01, seq, Duration::from_millis(800))
                        })
                        .await
                        .ok()
                        .and_then(|r| r.ok())
                        .flatten()
                        .is_some();
                        if let Some(window) = windows.get_mut(&tag) {
                            window.record(success);
                            self.manager.set_reachable(&tag, window.is_reachable()).await;
                        }
                    }
                }
            }
        }
    }

    /// Runs the staggered measurement scheduler for every upstream (§4.7).
    async fn run_schedulers(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let schedule_cfg = self.config.measurement.schedule.clone();
        let gap = schedule_cfg.upstream_gap_ms;
        let tags = self.manager.upstream_tags().await;
        let mut tasks = Vec::new();
        for (i, tag) in tags.into_iter().enumerate() {
            let this = self.clone();
            let schedule = UpstreamSchedule::new(schedule_cfg.clone());
            let mut task_shutdown = shutdown.resubscribe();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(crate::scheduler::stagger_delay(i, gap)).await;
                loop {
                    tokio::select! {
                        _ = task_shutdown.recv() => return,
                        _ = schedule.wait_next() => {
                            let utilization = this.current_utilization(&tag).await;
                            if schedule.decide(utilization) == ScheduleDecision::Run {
                                this.run_measurement_cycle(&tag).await;
                            }
                        }
                    }
                }
            }));
        }
        let _ = shutdown.recv().await;
        for task in tasks {
            task.abort();
        }
    }

    /// One measurement cycle against one upstream: TCP then UDP, ingested
    /// into the upstream manager (§4.3/§4.6).
    async fn run_measurement_cycle(&self, tag: &str) {
        let Some(endpoint) = self.endpoint_for(tag).await else { return };

        let client_cfg = MeasurementClientConfig {
            tcp: self.config.measurement.tcp,
            udp: self.config.measurement.udp,
            sample_wait_ms: 200,
        };

        match fbforward_measure::client::run(endpoint, &client_cfg).await {
            Ok((tcp_result, udp_result)) => {
                let tcp_loss = retransmit_rate(&tcp_result);
                self.manager
                    .ingest_measurement(
                        tag,
                        Protocol::Tcp,
                        RawMeasurement {
                            upload_bps: tcp_result.throughput.achieved_bps,
                            download_bps: tcp_result.throughput.achieved_bps,
                            rtt_ms: tcp_result.rtt.mean_ms,
                            jitter_ms: tcp_result.rtt.jitter_ms,
                            loss_or_retrans_rate: tcp_loss,
                        },
                    )
                    .await;
                let udp_loss = loss_rate(&udp_result);
                self.manager
                    .ingest_measurement(
                        tag,
                        Protocol::Udp,
                        RawMeasurement {
                            upload_bps: udp_result.throughput.achieved_bps,
                            download_bps: udp_result.throughput.achieved_bps,
                            rtt_ms: udp_result.rtt.mean_ms,
                            jitter_ms: udp_result.rtt.jitter_ms,
                            loss_or_retrans_rate: udp_loss,
                        },
                    )
                    .await;
                self.status_sink.publish_measurement(MeasurementCompletionEvent {
                    upstream_tag: tag.to_string(),
                    protocol: Protocol::Tcp,
                    direction: MeasurementDirection::Download,
                    duration: tcp_result.duration,
                    success: true,
                    bandwidth_bps: tcp_result.throughput.achieved_bps,
                    rtt_ms: tcp_result.rtt.mean_ms,
                    jitter_ms: tcp_result.rtt.jitter_ms,
                    loss_or_retrans_rate: tcp_loss,
                    error: None,
                });
                self.status_sink.publish_measurement(MeasurementCompletionEvent {
                    upstream_tag: tag.to_string(),
                    protocol: Protocol::Udp,
                    direction: MeasurementDirection::Download,
                    duration: udp_result.duration,
                    success: true,
                    bandwidth_bps: udp_result.throughput.achieved_bps,
                    rtt_ms: udp_result.rtt.mean_ms,
                    jitter_ms: udp_result.rtt.jitter_ms,
                    loss_or_retrans_rate: udp_loss,
                    error: None,
                });
                self.push_metrics(tag).await;
            }
            Err(e) => {
                tracing::warn!(upstream = %tag, error = %e, "measurement cycle failed");
                self.status_sink.publish_measurement(MeasurementCompletionEvent {
                    upstream_tag: tag.to_string(),
                    protocol: Protocol::Tcp,
                    direction: MeasurementDirection::Download,
                    duration: Duration::ZERO,
                    success: false,
                    bandwidth_bps: 0.0,
                    rtt_ms: 0.0,
                    jitter_ms: 0.0,
                    loss_or_retrans_rate: 1.0,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    /// Aggregate utilization for one upstream, fed to the scheduler's
    /// headroom check (§4.7). The higher of the two directions, matching the
    /// way the scoring engine folds utilization into a single penalty.
    async fn current_utilization(&self, tag: &str) -> f64 {
        self.manager
            .snapshot()
            .await
            .into_iter()
            .find(|s| s.tag == tag)
            .map(|s| s.utilization_up.max(s.utilization_down))
            .unwrap_or(0.0)
    }

    /// Pushes the freshly recomputed snapshot for one upstream into the
    /// metrics sink (§6 "the core pushes ... per-protocol scores,
    /// utilization, active/reachable/usable bits, cumulative byte counters").
    async fn push_metrics(&self, tag: &str) {
        let Some(snap) = self.manager.snapshot().await.into_iter().find(|s| s.tag == tag) else {
            return;
        };
        let mut active_flow_count: u64 = 0;
        for forwarder in self.forwarders.lock().await.iter() {
            active_flow_count += forwarder.active_flow_count(tag).await as u64;
        }
        for (protocol, metrics) in [(Protocol::Tcp, snap.tcp_metrics), (Protocol::Udp, snap.udp_metrics)] {
            self.metrics_sink.record_upstream(crate::metrics_sink::UpstreamMetricsUpdate {
                tag: snap.tag.clone(),
                protocol,
                metrics,
                s_tcp: snap.score,
                s_udp: snap.score,
                s_overall: snap.score,
                utilization_up: snap.utilization_up,
                utilization_down: snap.utilization_down,
                reachable: snap.reachable,
                usable: snap.usable,
                is_primary: snap.is_primary,
                bytes_up: snap.bytes_up,
                bytes_down: snap.bytes_down,
                active_flow_count,
            });
        }
    }

    async fn endpoint_for(&self, tag: &str) -> Option<SocketAddr> {
        self.config
            .upstreams
            .iter()
            .find(|u| u.tag == tag)
            .and_then(|u| u.measurement_endpoint.parse().ok())
    }

    pub fn manager(&self) -> Arc<UpstreamManager> {
        self.manager.clone()
    }

    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Starts listeners, probers, schedulers; returns once all of them have
    /// observed the shutdown signal.
    pub async fn run(self: Arc<Self>) -> crate::error::Result<()> {
        self.resolve_upstreams().await;

        let observer: Arc<dyn ForwardObserver> = Arc::new(SinkObserver {
            status: self.status_sink.clone(),
            manager: self.manager.clone(),
        });
        let mut handles = Vec::new();

        for listener in &self.config.listeners {
            let addr: SocketAddr = format!("{}:{}", listener.addr, listener.port)
                .parse()
                .map_err(|e| crate::error::ForwardError::Configuration(format!("invalid listener address: {e}")))?;
            let manager = self.manager.clone();
            let observer = observer.clone();
            let limits = self.config.limits;
            let idle = self.config.idle_timeouts;
            let shutdown_rx = self.shutdown_tx.subscribe();

            match listener.protocol {
                crate::config::ListenerProtocol::Tcp => {
                    let forwarder = Arc::new(TcpForwarder::new(addr, manager, observer, limits, idle));
                    self.forwarders.lock().await.push(ForwarderHandle::Tcp(forwarder.clone()));
                    handles.push(tokio::spawn(async move { forwarder.run(shutdown_rx).await }));
                }
                crate::config::ListenerProtocol::Udp => {
                    let forwarder = Arc::new(UdpForwarder::new(addr, manager, observer, limits, idle));
                    self.forwarders.lock().await.push(ForwarderHandle::Udp(forwarder.clone()));
                    handles.push(tokio::spawn(async move { forwarder.run(shutdown_rx).await }));
                }
            }
        }

        let this_probers = self.clone();
        let prober_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move { this_probers.run_probers(prober_shutdown).await });

        let this_schedulers = self.clone();
        let scheduler_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move { this_schedulers.run_schedulers(scheduler_shutdown).await });

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Bridges the forwarder's narrow observer callback onto the status sink
/// (§6 "status sink receives flow-lifecycle events").
struct SinkObserver {
    status: StatusSink,
    manager: Arc<UpstreamManager>,
}

impl ForwardObserver for SinkObserver {
    fn flow_opened(&self, flow: &Flow) {
        self.status.publish_flow(FlowEvent::Added {
            id: flow.id.clone(),
            protocol: flow.protocol,
            client_addr: flow.client_addr,
            upstream_tag: flow.upstream_tag.clone(),
        });
    }

    fn flow_closed(&self, flow: &Flow) {
        self.status.publish_flow(FlowEvent::Removed { id: flow.id.clone() });
    }

    fn bytes_transferred(&self, upstream_tag: &str, up: u64, down: u64) {
        // `record_traffic` is async and this callback isn't; hand it off to
        // the upstream manager's own task rather than blocking the copy loop.
        let manager = self.manager.clone();
        let tag = upstream_tag.to_string();
        tokio::spawn(async move {
            manager.record_traffic(&tag, up, down).await;
        });
    }
}

fn retransmit_rate(result: &fbforward_measure::RunResult) -> f64 {
    if result.segments_retransmitted == 0 {
        0.0
    } else {
        (result.segments_retransmitted as f64 / result.samples_planned.max(1) as f64).min(1.0)
    }
}

fn loss_rate(result: &fbforward_measure::RunResult) -> f64 {
    if result.packets_lost == 0 {
        0.0
    } else {
        (result.packets_lost as f64 / result.samples_planned.max(1) as f64).min(1.0)
    }
}

#[async_trait::async_trait]
impl ControlPlane for Runtime {
    async fn set_primary(&self, mode: PrimaryMode, tag: Option<String>) -> crate::error::Result<()> {
        match mode {
            PrimaryMode::Auto => {
                self.manager.set_auto().await;
                Ok(())
            }
            PrimaryMode::Manual => {
                let tag = tag.ok_or_else(|| crate::error::ForwardError::Configuration("manual mode requires a tag".into()))?;
                self.manager.set_manual(tag).await
            }
        }
    }

    async fn trigger_restart(&self) -> crate::error::Result<()> {
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    async fn run_measurement(&self, tag: String, _protocol: Protocol) -> crate::error::Result<()> {
        self.run_measurement_cycle(&tag).await;
        Ok(())
    }

    async fn get_snapshot(&self) -> Vec<UpstreamSnapshot> {
        self.manager.snapshot().await
    }

    async fn get_schedule_status(&self) -> Vec<ScheduleStatus> {
        self.manager
            .upstream_tags()
            .await
            .into_iter()
            .map(|tag| ScheduleStatus {
                upstream_tag: tag,
                next_run_in: Duration::from_secs(0),
                last_decision: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runtime_builds_manager_from_configured_upstreams() {
        let mut config = Config::default();
        config.upstreams.push(crate::config::UpstreamConfig {
            tag: "a".into(),
            host: "127.0.0.1".into(),
            measurement_endpoint: "127.0.0.1:5501".into(),
            priority: 0.0,
            bias: 0.0,
        });
        let runtime = Runtime::new(config);
        assert_eq!(runtime.manager().upstream_tags().await, vec!["a".to_string()]);
    }
}
