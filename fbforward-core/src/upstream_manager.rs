//! Upstream manager (§4.6): the switching state machine, exclusive owner of
//! all upstream records. Mutation is serialized behind one `RwLock`; readers
//! take a shared lock and return a snapshot (§5 Shared-resource policy, §9
//! "no process-wide singleton" — this is the owned piece of the supervisor's
//! runtime graph, never a global).

use crate::config::{ScoringConfig, SwitchingConfig};
use crate::model::Upstream;
use crate::scoring::{bootstrap_score, score_upstream};
use fbforward_protocol::{Protocol, RawMeasurement};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
enum SwitchState {
    Primary,
    Confirming { candidate: String, since: Instant },
}

/// Read-only view of one upstream for external observers (§6 metrics/status
/// sinks, §9 "narrow capability set" — snapshots never hand back a live
/// reference into the manager).
#[derive(Debug, Clone)]
pub struct UpstreamSnapshot {
    pub tag: String,
    pub is_primary: bool,
    pub usable: bool,
    pub reachable: bool,
    pub score: f64,
    pub tcp_metrics: fbforward_protocol::SmoothedMetrics,
    pub udp_metrics: fbforward_protocol::SmoothedMetrics,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub utilization_up: f64,
    pub utilization_down: f64,
}

struct ManagerState {
    upstreams: HashMap<String, Upstream>,
    order: Vec<String>,
    primary: Option<String>,
    manual_pin: Option<String>,
    switch_state: SwitchState,
    last_switch: Option<Instant>,
    started_at: Instant,
    warmed_up: bool,
}

pub struct UpstreamManager {
    state: RwLock<ManagerState>,
    scoring: ScoringConfig,
    switching: SwitchingConfig,
    stale_threshold: Duration,
    warmup_duration: Duration,
}

impl UpstreamManager {
    pub fn new(
        upstreams: Vec<Upstream>,
        scoring: ScoringConfig,
        switching: SwitchingConfig,
        stale_threshold: Duration,
        warmup_duration: Duration,
    ) -> Self {
        let order: Vec<String> = upstreams.iter().map(|u| u.tag.clone()).collect();
        let map = upstreams.into_iter().map(|u| (u.tag.clone(), u)).collect();
        Self {
            state: RwLock::new(ManagerState {
                upstreams: map,
                order,
                primary: None,
                manual_pin: None,
                switch_state: SwitchState::Primary,
                last_switch: None,
                started_at: Instant::now(),
                warmed_up: false,
            }),
            scoring,
            switching,
            stale_threshold,
            warmup_duration,
        }
    }

    fn now_unix_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn is_usable_locked(state: &ManagerState, tag: &str, max_dial_failures: u32) -> bool {
        state
            .upstreams
            .get(tag)
            .map(|u| u.is_usable(max_dial_failures))
            .unwrap_or(false)
    }

    /// Fraction of the configured bandwidth actually used in the trailing
    /// utilization window, per direction (§4.5 `U`). Shared by `score_locked`
    /// (feeds the utilization penalty `M`) and `snapshot` (reported to
    /// external observers).
    fn utilization_locked(&self, u: &Upstream) -> (f64, f64) {
        let window = Duration::from_millis(self.scoring.utilization_penalty.window_duration_ms);
        let mut up_window = u.utilization_up.clone();
        let mut down_window = u.utilization_down.clone();
        let util_up_bits = up_window.bytes_in_window(window) as f64 * 8.0;
        let util_down_bits = down_window.bytes_in_window(window) as f64 * 8.0;
        let window_secs = window.as_secs_f64().max(1e-9);
        let utilization_up = if u.tcp_metrics.upload_bps > 0.0 {
            util_up_bits / (u.tcp_metrics.upload_bps * window_secs)
        } else {
            0.0
        };
        let utilization_down = if u.tcp_metrics.download_bps > 0.0 {
            util_down_bits / (u.tcp_metrics.download_bps * window_secs)
        } else {
            0.0
        };
        (utilization_up, utilization_down)
    }

    fn score_locked(&self, u: &Upstream, now_unix_ms: u64) -> f64 {
        let (utilization_up, utilization_down) = self.utilization_locked(u);
        let has_tcp = u.tcp_metrics.last_measurement_unix_ms != 0;
        let has_udp = u.udp_metrics.last_measurement_unix_ms != 0;
        score_upstream(
            &u.tcp_metrics,
            &u.udp_metrics,
            utilization_up,
            utilization_down,
            u.priority,
            u.bias,
            has_udp,
            has_tcp,
            &self.scoring,
            self.stale_threshold,
            now_unix_ms,
        )
        .reported_score
    }

    /// Returns the current primary or an error if none is usable (§4.6).
    pub async fn select_primary(&self) -> Result<String, crate::error::ForwardError> {
        let state = self.state.read().await;
        match &state.primary {
            Some(tag) if Self::is_usable_locked(&state, tag, self.switching.max_dial_failures) => {
                Ok(tag.clone())
            }
            _ => Err(crate::error::ForwardError::ResourceExhausted(
                "no usable primary upstream".into(),
            )),
        }
    }

    pub async fn snapshot(&self) -> Vec<UpstreamSnapshot> {
        let state = self.state.read().await;
        let now = Self::now_unix_ms();
        state
            .order
            .iter()
            .filter_map(|tag| state.upstreams.get(tag))
            .map(|u| {
                let (utilization_up, utilization_down) = self.utilization_locked(u);
                UpstreamSnapshot {
                    tag: u.tag.clone(),
                    is_primary: state.primary.as_deref() == Some(u.tag.as_str()),
                    usable: u.is_usable(self.switching.max_dial_failures),
                    reachable: u.reachable,
                    score: self.score_locked(u, now),
                    tcp_metrics: u.tcp_metrics,
                    udp_metrics: u.udp_metrics,
                    bytes_up: u.bytes_up,
                    bytes_down: u.bytes_down,
                    utilization_up,
                    utilization_down,
                }
            })
            .collect()
    }

    /// Bootstraps the primary from reachability probe RTTs alone, before any
    /// bandwidth measurement lands (§4.6 Warmup).
    pub async fn bootstrap(&self, probe_rtts_ms: &HashMap<String, f64>) {
        let mut state = self.state.write().await;
        if state.primary.is_some() {
            return;
        }
        let r0 = 20.0;
        let mut best: Option<(String, f64)> = None;
        for tag in state.order.clone() {
            let Some(u) = state.upstreams.get(&tag) else { continue };
            let rtt = probe_rtts_ms.get(&tag).copied().unwrap_or(f64::INFINITY);
            let score = bootstrap_score(u.reachable, rtt, r0, u.priority);
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((tag, score));
            }
        }
        if let Some((tag, _)) = best {
            tracing::info!(upstream = %tag, "fast-start bootstrap primary selected");
            state.primary = Some(tag);
            state.last_switch = Some(Instant::now());
        }
    }

    pub async fn set_manual(&self, tag: String) -> Result<(), crate::error::ForwardError> {
        let mut state = self.state.write().await;
        if !Self::is_usable_locked(&state, &tag, self.switching.max_dial_failures) {
            return Err(crate::error::ForwardError::ResourceExhausted(format!(
                "upstream {tag} is not usable"
            )));
        }
        state.manual_pin = Some(tag.clone());
        state.primary = Some(tag);
        Ok(())
    }

    pub async fn set_auto(&self) {
        self.state.write().await.manual_pin = None;
    }

    /// Applies one measurement result and re-evaluates the switching state
    /// machine (§4.6 `IngestMeasurement`), failing over immediately instead
    /// of going through hysteresis if the fresh sample on the current primary
    /// breaches the configured loss/retransmit threshold.
    pub async fn ingest_measurement(&self, tag: &str, protocol: Protocol, result: RawMeasurement) {
        let mut state = self.state.write().await;
        let now = Self::now_unix_ms();
        let breaches_failover_threshold = {
            let Some(u) = state.upstreams.get_mut(tag) else { return };
            let metrics = match protocol {
                Protocol::Tcp => &mut u.tcp_metrics,
                Protocol::Udp => &mut u.udp_metrics,
            };
            metrics.ingest(self.scoring.ema_alpha, &result, now);
            u.last_score = 0.0; // recomputed lazily in score_locked
            let threshold = match protocol {
                Protocol::Tcp => self.switching.retransmit_failover_threshold,
                Protocol::Udp => self.switching.loss_failover_threshold,
            };
            result.loss_or_retrans_rate >= threshold
        };

        if state.manual_pin.is_some() {
            return; // manual mode: ingestion continues, primary doesn't move
        }

        if breaches_failover_threshold && state.primary.as_deref() == Some(tag) {
            self.failover_locked(&mut state, tag, now);
        } else {
            self.evaluate_switching(&mut state, now);
        }
    }

    /// Immediate failover bypassing hysteresis (§4.6 Failover trigger),
    /// invoked when a sample shows loss/retransmit above the configured
    /// thresholds on the current primary.
    pub async fn trigger_failover(&self, failed_tag: &str) {
        let mut state = self.state.write().await;
        let now = Self::now_unix_ms();
        self.failover_locked(&mut state, failed_tag, now);
    }

    fn failover_locked(&self, state: &mut ManagerState, failed_tag: &str, now_unix_ms: u64) {
        if state.primary.as_deref() != Some(failed_tag) {
            return;
        }
        if let Some(best) = self.best_usable_excluding(state, now_unix_ms, Some(failed_tag)) {
            tracing::warn!(from = %failed_tag, to = %best, "fast failover");
            state.primary = Some(best);
            state.last_switch = Some(Instant::now());
            state.switch_state = SwitchState::Primary;
        }
    }

    fn best_usable(&self, state: &ManagerState, now_unix_ms: u64) -> Option<String> {
        self.best_usable_excluding(state, now_unix_ms, None)
    }

    /// Best-scoring usable upstream, optionally excluding one tag (used by
    /// `trigger_failover` so a failing primary can't out-score its way back
    /// in on stale measurements).
    fn best_usable_excluding(&self, state: &ManagerState, now_unix_ms: u64, exclude: Option<&str>) -> Option<String> {
        state
            .order
            .iter()
            .filter(|tag| exclude != Some(tag.as_str()))
            .filter(|tag| Self::is_usable_locked(state, tag, self.switching.max_dial_failures))
            .filter_map(|tag| state.upstreams.get(tag).map(|u| (tag.clone(), self.score_locked(u, now_unix_ms))))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .map(|(tag, _)| tag)
    }

    fn evaluate_switching(&self, state: &mut ManagerState, now_unix_ms: u64) {
        let Some(primary_tag) = state.primary.clone() else {
            if let Some(best) = self.best_usable(state, now_unix_ms) {
                state.primary = Some(best);
                state.last_switch = Some(Instant::now());
            }
            return;
        };

        let in_warmup = !state.warmed_up && state.started_at.elapsed() < self.warmup_duration;
        if !in_warmup && state.warmed_up == false {
            state.warmed_up = true;
        }
        let delta_threshold = if in_warmup {
            self.switching.score_delta_threshold / 2.0
        } else {
            self.switching.score_delta_threshold
        };
        let hold_time = if in_warmup {
            Duration::ZERO
        } else {
            Duration::from_millis(self.switching.min_hold_time_ms)
        };

        let primary_score = state
            .upstreams
            .get(&primary_tag)
            .map(|u| self.score_locked(u, now_unix_ms))
            .unwrap_or(f64::NEG_INFINITY);

        let Some(challenger) = self.best_usable(state, now_unix_ms) else {
            return;
        };
        if challenger == primary_tag {
            state.switch_state = SwitchState::Primary;
            return;
        }
        let challenger_score = state
            .upstreams
            .get(&challenger)
            .map(|u| self.score_locked(u, now_unix_ms))
            .unwrap_or(f64::NEG_INFINITY);

        if challenger_score - primary_score <= delta_threshold {
            state.switch_state = SwitchState::Primary;
            return;
        }

        match &state.switch_state {
            SwitchState::Confirming { candidate, since } if candidate == &challenger => {
                let held_long_enough = since.elapsed() >= Duration::from_millis(self.switching.confirm_duration_ms);
                let past_hold = state.last_switch.map(|t| t.elapsed() >= hold_time).unwrap_or(true);
                if held_long_enough && past_hold {
                    tracing::info!(from = %primary_tag, to = %challenger, "primary switch committed");
                    state.primary = Some(challenger);
                    state.last_switch = Some(Instant::now());
                    state.switch_state = SwitchState::Primary;
                }
            }
            _ => {
                state.switch_state = SwitchState::Confirming {
                    candidate: challenger,
                    since: Instant::now(),
                };
            }
        }
    }

    /// Records a failed dial attempt and, if it pushed the upstream past
    /// `max_dial_failures` while it's the current primary, fails over
    /// immediately rather than waiting for the next measurement cycle.
    pub async fn record_dial_failure(&self, tag: &str) {
        let mut state = self.state.write().await;
        let now = Self::now_unix_ms();
        let exceeded = if let Some(u) = state.upstreams.get_mut(tag) {
            u.record_dial_failure();
            u.dial_failures >= self.switching.max_dial_failures
        } else {
            false
        };
        if exceeded {
            self.failover_locked(&mut state, tag, now);
        }
    }

    pub async fn set_reachable(&self, tag: &str, reachable: bool) {
        let mut state = self.state.write().await;
        if let Some(u) = state.upstreams.get_mut(tag) {
            u.reachable = reachable;
        }
    }

    pub async fn record_traffic(&self, tag: &str, bytes_up: u64, bytes_down: u64) {
        let mut state = self.state.write().await;
        if let Some(u) = state.upstreams.get_mut(tag) {
            u.bytes_up += bytes_up;
            u.bytes_down += bytes_down;
            if bytes_up > 0 {
                u.utilization_up.record(bytes_up);
            }
            if bytes_down > 0 {
                u.utilization_down.record(bytes_down);
            }
        }
    }

    pub async fn upstream_tags(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    pub async fn active_ip(&self, tag: &str) -> Option<std::net::IpAddr> {
        self.state.read().await.upstreams.get(tag).and_then(|u| u.active_ip)
    }

    pub async fn set_active_ip(&self, tag: &str, ip: std::net::IpAddr) {
        let mut state = self.state.write().await;
        if let Some(u) = state.upstreams.get_mut(tag) {
            u.active_ip = Some(ip);
            if !u.resolved_ips.contains(&ip) {
                u.resolved_ips.push(ip);
            }
        }
    }
}

pub type SharedUpstreamManager = Arc<UpstreamManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Upstream;

    fn upstream(tag: &str, reachable: bool) -> Upstream {
        let mut u = Upstream::new(tag, "10.0.0.1", "10.0.0.1:5501".parse().unwrap());
        u.reachable = reachable;
        u
    }

    fn manager(upstreams: Vec<Upstream>) -> UpstreamManager {
        UpstreamManager::new(
            upstreams,
            ScoringConfig::default(),
            SwitchingConfig::default(),
            Duration::from_secs(3600),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn at_most_one_primary_and_usable_implies_one() {
        let mgr = manager(vec![upstream("a", true), upstream("b", true)]);
        mgr.ingest_measurement(
            "a",
            Protocol::Tcp,
            RawMeasurement {
                upload_bps: 10_000_000.0,
                download_bps: 10_000_000.0,
                rtt_ms: 10.0,
                jitter_ms: 1.0,
                loss_or_retrans_rate: 0.0,
            },
        )
        .await;
        let primary = mgr.select_primary().await;
        assert!(primary.is_ok());
    }

    #[tokio::test]
    async fn hysteresis_blocks_switch_below_delta_threshold() {
        let mgr = manager(vec![upstream("a", true), upstream("b", true)]);
        let good = RawMeasurement {
            upload_bps: 10_000_000.0,
            download_bps: 10_000_000.0,
            rtt_ms: 20.0,
            jitter_ms: 2.0,
            loss_or_retrans_rate: 0.0,
        };
        mgr.ingest_measurement("a", Protocol::Tcp, good).await;
        let primary_after_a = mgr.select_primary().await.unwrap();

        // A small RTT edge for b, not enough to cross delta_threshold=5.
        let slightly_better = RawMeasurement {
            rtt_ms: 19.0,
            ..good
        };
        mgr.ingest_measurement("b", Protocol::Tcp, slightly_better).await;
        let primary_after_b = mgr.select_primary().await.unwrap();
        assert_eq!(primary_after_a, primary_after_b);
    }

    #[tokio::test]
    async fn manual_mode_ignores_new_measurements() {
        let mgr = manager(vec![upstream("a", true), upstream("b", true)]);
        mgr.set_manual("a".to_string()).await.unwrap();
        let great = RawMeasurement {
            upload_bps: 100_000_000.0,
            download_bps: 100_000_000.0,
            rtt_ms: 1.0,
            jitter_ms: 0.1,
            loss_or_retrans_rate: 0.0,
        };
        mgr.ingest_measurement("b", Protocol::Tcp, great).await;
        assert_eq!(mgr.select_primary().await.unwrap(), "a");
    }

    #[tokio::test]
    async fn manual_mode_rejects_unusable_pin() {
        let mgr = manager(vec![upstream("a", true), upstream("b", false)]);
        let err = mgr.set_manual("b".to_string()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn failover_switches_immediately_to_best_alternative() {
        let mgr = manager(vec![upstream("a", true), upstream("b", true)]);
        mgr.ingest_measurement(
            "a",
            Protocol::Tcp,
            RawMeasurement {
                upload_bps: 10_000_000.0,
                download_bps: 10_000_000.0,
                rtt_ms: 10.0,
                jitter_ms: 1.0,
                loss_or_retrans_rate: 0.0,
            },
        )
        .await;
        mgr.ingest_measurement(
            "b",
            Protocol::Tcp,
            RawMeasurement {
                upload_bps: 5_000_000.0,
                download_bps: 5_000_000.0,
                rtt_ms: 30.0,
                jitter_ms: 2.0,
                loss_or_retrans_rate: 0.0,
            },
        )
        .await;
        assert_eq!(mgr.select_primary().await.unwrap(), "a");
        mgr.trigger_failover("a").await;
        assert_eq!(mgr.select_primary().await.unwrap(), "b");
    }
}
