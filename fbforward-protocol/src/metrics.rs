use serde::{Deserialize, Serialize};

/// Transport the metrics below were measured over. Bandwidth, RTT, jitter and
/// loss/retransmit are tracked independently per protocol (§3 Upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Exponentially-smoothed per-protocol metrics for one upstream.
///
/// `last_measurement_unix_ms` of `0` means no observation has ever landed;
/// the scoring engine treats that as maximally stale rather than age-zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SmoothedMetrics {
    pub upload_bps: f64,
    pub download_bps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Retransmit rate for TCP, packet loss rate for UDP, both in `[0, 1]`.
    pub loss_or_retrans_rate: f64,
    pub last_measurement_unix_ms: u64,
}

impl Default for SmoothedMetrics {
    fn default() -> Self {
        Self {
            upload_bps: 0.0,
            download_bps: 0.0,
            rtt_ms: 0.0,
            jitter_ms: 0.0,
            loss_or_retrans_rate: 0.0,
            last_measurement_unix_ms: 0,
        }
    }
}

impl SmoothedMetrics {
    /// Apply one exponential-smoothing step in place. The first observation
    /// (detected via `last_measurement_unix_ms == 0`) replaces the value
    /// outright rather than blending with the zeroed default.
    pub fn ingest(&mut self, alpha: f64, observed: &RawMeasurement, now_unix_ms: u64) {
        let first = self.last_measurement_unix_ms == 0;
        self.upload_bps = ema(self.upload_bps, observed.upload_bps, alpha, first);
        self.download_bps = ema(self.download_bps, observed.download_bps, alpha, first);
        self.rtt_ms = ema(self.rtt_ms, observed.rtt_ms, alpha, first);
        self.jitter_ms = ema(self.jitter_ms, observed.jitter_ms, alpha, first);
        self.loss_or_retrans_rate = ema(
            self.loss_or_retrans_rate,
            observed.loss_or_retrans_rate,
            alpha,
            first,
        );
        self.last_measurement_unix_ms = now_unix_ms;
    }
}

fn ema(previous: f64, observed: f64, alpha: f64, first: bool) -> f64 {
    if first {
        observed
    } else {
        alpha * observed + (1.0 - alpha) * previous
    }
}

/// One fresh, un-smoothed measurement result ready to be folded into
/// [`SmoothedMetrics`] via [`SmoothedMetrics::ingest`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMeasurement {
    pub upload_bps: f64,
    pub download_bps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_or_retrans_rate: f64,
}

/// Per-upstream cumulative traffic counters used for utilization scoring.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_replaces_rather_than_blends() {
        let mut m = SmoothedMetrics::default();
        m.ingest(
            0.2,
            &RawMeasurement {
                upload_bps: 100.0,
                ..Default::default()
            },
            1,
        );
        assert_eq!(m.upload_bps, 100.0);
    }

    #[test]
    fn subsequent_observations_blend_with_alpha() {
        let mut m = SmoothedMetrics::default();
        m.ingest(
            0.2,
            &RawMeasurement {
                upload_bps: 100.0,
                ..Default::default()
            },
            1,
        );
        m.ingest(
            0.2,
            &RawMeasurement {
                upload_bps: 200.0,
                ..Default::default()
            },
            2,
        );
        assert!((m.upload_bps - (0.2 * 200.0 + 0.8 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn serde_round_trip() {
        let metrics = SmoothedMetrics {
            upload_bps: 1000.0,
            ..Default::default()
        };
        let json = serde_json::to_string(&metrics).unwrap();
        let back: SmoothedMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.upload_bps, metrics.upload_bps);
    }
}
