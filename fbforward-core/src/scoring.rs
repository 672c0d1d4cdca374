//! Scoring engine (§4.5): a pure function from smoothed metrics, reference
//! values, weights, utilization and bias to a scalar score. Grounded on the
//! windowed-statistics style of `server/src/measurements.rs::calculate_metrics`
//! (bounded sub-computations combined into one report), generalized to the
//! multiplicative sub-score model this spec defines.

use crate::config::{BiasTransformConfig, ProtocolWeights, ReferenceValues, ScoringConfig, UtilizationPenaltyConfig};
use fbforward_protocol::SmoothedMetrics;
use std::time::Duration;

const EPSILON: f64 = 0.001;

fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Higher-is-better sub-score: `max(1 - exp(-x / ref), eps)`.
fn higher_is_better(value: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return EPSILON;
    }
    (1.0 - (-value / reference).exp()).max(EPSILON)
}

/// Lower-is-better sub-score: `max(exp(-x / ref), eps)`.
fn lower_is_better(value: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return EPSILON;
    }
    (-value / reference).exp().max(EPSILON)
}

/// Substitutes degraded values for a metric older than `stale_threshold`
/// (§4.5 staleness handling). Always applied before scoring, never merely
/// logged.
fn staleness_adjusted(metrics: &SmoothedMetrics, reference: &ReferenceValues, stale_threshold: Duration, now_unix_ms: u64) -> (f64, f64, f64, f64, f64) {
    let age_ms = now_unix_ms.saturating_sub(metrics.last_measurement_unix_ms);
    let stale = metrics.last_measurement_unix_ms == 0 || age_ms as u128 > stale_threshold.as_millis();
    if stale {
        (
            0.5 * reference.bandwidth_up,
            0.5 * reference.bandwidth_down,
            2.0 * reference.rtt,
            2.0 * reference.jitter,
            2.0 * reference.loss_rate.max(reference.retransmit_rate),
        )
    } else {
        (
            metrics.upload_bps,
            metrics.download_bps,
            metrics.rtt_ms,
            metrics.jitter_ms,
            metrics.loss_or_retrans_rate,
        )
    }
}

/// Per-protocol quality score `Q` (§4.5), before utilization/bias multipliers.
pub fn quality_score(
    metrics: &SmoothedMetrics,
    reference: &ReferenceValues,
    weights: &ProtocolWeights,
    stale_threshold: Duration,
    now_unix_ms: u64,
) -> f64 {
    let (up, down, rtt, jitter, loss_or_retrans) =
        staleness_adjusted(metrics, reference, stale_threshold, now_unix_ms);

    let s_up = higher_is_better(up, reference.bandwidth_up);
    let s_down = higher_is_better(down, reference.bandwidth_down);
    let s_rtt = lower_is_better(rtt, reference.rtt);
    let s_jitter = lower_is_better(jitter, reference.jitter);
    let s_loss = lower_is_better(loss_or_retrans, reference.loss_rate.max(reference.retransmit_rate));

    100.0
        * s_up.powf(weights.bandwidth_up)
        * s_down.powf(weights.bandwidth_down)
        * s_rtt.powf(weights.rtt)
        * s_jitter.powf(weights.jitter)
        * s_loss.powf(weights.loss_or_retransmit)
}

/// Utilization penalty `M` (§4.5): `m_min + (1 - m_min) * exp(-(u/u0)^p)`.
pub fn utilization_penalty(utilization_up: f64, utilization_down: f64, cfg: &UtilizationPenaltyConfig) -> f64 {
    let u = utilization_up.max(utilization_down).max(0.0);
    if cfg.threshold <= 0.0 {
        return cfg.min_multiplier;
    }
    cfg.min_multiplier + (1.0 - cfg.min_multiplier) * (-(u / cfg.threshold).powf(cfg.exponent)).exp()
}

/// Bias multiplier `M_β = clamp(exp(kappa * beta), 0.67, 1.5)` (§4.5).
pub fn bias_multiplier(bias: f64, cfg: &BiasTransformConfig) -> f64 {
    clamp((cfg.kappa * bias).exp(), 0.67, 1.5)
}

/// Final scoring result for one upstream at one instant.
#[derive(Debug, Clone, Copy)]
pub struct ScoreResult {
    pub s_tcp: f64,
    pub s_udp: f64,
    pub s_overall: f64,
    /// `S_overall + priority`, what the switching state machine compares.
    pub reported_score: f64,
}

/// Computes the full scoring pipeline for one upstream (§4.5 end to end).
/// `has_udp_sample` handles the tie-break rule for a protocol never measured:
/// its weight becomes zero and the overall reduces to the other protocol.
pub fn score_upstream(
    tcp_metrics: &SmoothedMetrics,
    udp_metrics: &SmoothedMetrics,
    utilization_up: f64,
    utilization_down: f64,
    priority: f64,
    bias: f64,
    has_udp_sample: bool,
    has_tcp_sample: bool,
    cfg: &ScoringConfig,
    stale_threshold: Duration,
    now_unix_ms: u64,
) -> ScoreResult {
    let m = utilization_penalty(utilization_up, utilization_down, &cfg.utilization_penalty);
    let m_beta = bias_multiplier(bias, &cfg.bias_transform);

    let q_tcp = quality_score(tcp_metrics, &cfg.reference_tcp, &cfg.weights.tcp, stale_threshold, now_unix_ms);
    let q_udp = quality_score(udp_metrics, &cfg.reference_udp, &cfg.weights.udp, stale_threshold, now_unix_ms);

    let s_tcp = clamp(q_tcp * m * m_beta, 0.0, 100.0);
    let s_udp = clamp(q_udp * m * m_beta, 0.0, 100.0);

    let (omega_tcp, omega_udp) = match (has_tcp_sample, has_udp_sample) {
        (true, true) => (cfg.weights.protocol_blend, 1.0 - cfg.weights.protocol_blend),
        (true, false) => (1.0, 0.0),
        (false, true) => (0.0, 1.0),
        (false, false) => (cfg.weights.protocol_blend, 1.0 - cfg.weights.protocol_blend),
    };

    let s_overall = omega_tcp * s_tcp + omega_udp * s_udp;

    ScoreResult {
        s_tcp,
        s_udp,
        s_overall,
        reported_score: s_overall + priority,
    }
}

/// Bootstrap score for fast-start (§4.6 Warmup): `1{reachable} * (100 /
/// (1 + R_probe/R_0) + priority)`.
pub fn bootstrap_score(reachable: bool, probe_rtt_ms: f64, r0_ms: f64, priority: f64) -> f64 {
    if !reachable {
        return 0.0;
    }
    100.0 / (1.0 + probe_rtt_ms / r0_ms) + priority
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;

    fn fresh_metrics(up: f64, down: f64, rtt: f64, jitter: f64, loss: f64) -> SmoothedMetrics {
        SmoothedMetrics {
            upload_bps: up,
            download_bps: down,
            rtt_ms: rtt,
            jitter_ms: jitter,
            loss_or_retrans_rate: loss,
            last_measurement_unix_ms: 1_000,
        }
    }

    #[test]
    fn identical_upstreams_score_identically() {
        let cfg = ScoringConfig::default();
        let metrics = fresh_metrics(10_000_000.0, 10_000_000.0, 20.0, 2.0, 0.001);
        let a = score_upstream(&metrics, &metrics, 0.1, 0.1, 0.0, 0.0, true, true, &cfg, Duration::from_secs(3600), 1_500);
        let b = score_upstream(&metrics, &metrics, 0.1, 0.1, 0.0, 0.0, true, true, &cfg, Duration::from_secs(3600), 1_500);
        assert!((a.s_overall - b.s_overall).abs() < 1e-9);
    }

    #[test]
    fn staleness_never_increases_score() {
        let cfg = ScoringConfig::default();
        let good_metrics = fresh_metrics(10_000_000.0, 10_000_000.0, 20.0, 2.0, 0.001);
        let fresh = score_upstream(&good_metrics, &good_metrics, 0.1, 0.1, 0.0, 0.0, true, true, &cfg, Duration::from_secs(3600), 1_500);

        let mut stale_metrics = good_metrics;
        stale_metrics.last_measurement_unix_ms = 0; // never measured, always stale
        let stale = score_upstream(&stale_metrics, &stale_metrics, 0.1, 0.1, 0.0, 0.0, true, true, &cfg, Duration::from_secs(3600), 1_500);

        assert!(stale.s_overall <= fresh.s_overall);
    }

    #[test]
    fn missing_udp_sample_reduces_to_tcp_alone() {
        let cfg = ScoringConfig::default();
        let tcp_metrics = fresh_metrics(10_000_000.0, 10_000_000.0, 20.0, 2.0, 0.01);
        let udp_metrics = SmoothedMetrics::default();
        let result = score_upstream(&tcp_metrics, &udp_metrics, 0.1, 0.1, 0.0, 0.0, false, true, &cfg, Duration::from_secs(3600), 1_500);
        assert!((result.s_overall - result.s_tcp).abs() < 1e-9);
    }

    #[test]
    fn utilization_penalty_degrades_toward_min_multiplier_as_usage_climbs() {
        let cfg = UtilizationPenaltyConfig::default();
        let low = utilization_penalty(0.0, 0.0, &cfg);
        let high = utilization_penalty(5.0, 5.0, &cfg);
        assert!(low > high);
        assert!(high >= cfg.min_multiplier - 1e-9);
    }

    #[test]
    fn bias_multiplier_is_clamped() {
        let cfg = BiasTransformConfig::default();
        assert!((bias_multiplier(10.0, &cfg) - 1.5).abs() < 1e-9);
        assert!((bias_multiplier(-10.0, &cfg) - 0.67).abs() < 1e-9);
    }

    #[test]
    fn bootstrap_score_is_zero_when_unreachable() {
        assert_eq!(bootstrap_score(false, 20.0, 20.0, 0.0), 0.0);
        assert!(bootstrap_score(true, 20.0, 20.0, 0.0) > 0.0);
    }
}
