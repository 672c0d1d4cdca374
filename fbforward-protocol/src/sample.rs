use serde::{Deserialize, Serialize};

/// Fixed wall-clock width of one server-side byte-accounting bucket.
pub const INTERVAL_MS: u64 = 100;

/// Number of consecutive intervals in a one-second sustained-peak window.
pub const SUSTAINED_PEAK_WINDOW: usize = 10;

/// Byte count (and bookkeeping) for a single 100 ms interval, as produced by
/// the measurement server's per-sample bucketing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntervalSample {
    pub bytes: u64,
    pub duration_ms: u64,
    pub out_of_order: u64,
}

impl IntervalSample {
    pub fn bits_per_second(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / (self.duration_ms as f64 / 1000.0)
    }
}

/// Protocol-specific counters attached to a sample report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProtocolCounters {
    /// TCP: segments sent and retransmitted during the sample.
    pub tcp_segments_sent: u64,
    pub tcp_retransmits: u64,
    /// UDP: packets received and the derived loss count
    /// (`max_seq + 1 - received`).
    pub udp_packets_received: u64,
    pub udp_packets_lost: u64,
}

/// One completed sample's full report, returned by the measurement server in
/// response to `sample.stop` (§4.2, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleReport {
    pub sample_id: u32,
    pub total_bytes: u64,
    pub total_duration_ms: u64,
    pub intervals: Vec<IntervalSample>,
    pub first_byte_unix_ms: u64,
    pub last_byte_unix_ms: u64,
    pub counters: ProtocolCounters,
}

impl SampleReport {
    pub fn average_bps(&self) -> f64 {
        if self.total_duration_ms == 0 {
            return 0.0;
        }
        (self.total_bytes as f64 * 8.0) / (self.total_duration_ms as f64 / 1000.0)
    }
}

/// Throughput statistics aggregated across every interval of every sample in
/// a measurement run (§4.3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub target_bps: f64,
    pub achieved_bps: f64,
    pub utilization: f64,
    pub sustained_peak_1s_bps: f64,
    pub p90_bps: f64,
    pub p80_bps: f64,
}

/// Mean of interval rates after dropping the top and bottom 10%.
pub fn trimmed_mean(rates: &[f64]) -> f64 {
    if rates.is_empty() {
        return 0.0;
    }
    let mut sorted = rates.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let drop = sorted.len() / 10;
    let lo = drop;
    let hi = sorted.len() - drop;
    let slice = if lo < hi { &sorted[lo..hi] } else { &sorted[..] };
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Max over all windows of `W` consecutive intervals, where the window rate
/// is the mean of the intervals it contains.
pub fn sustained_peak(rates: &[f64], window: usize) -> f64 {
    if rates.is_empty() || window == 0 {
        return 0.0;
    }
    if rates.len() < window {
        return rates.iter().sum::<f64>() / rates.len() as f64;
    }
    let mut best = f64::MIN;
    for w in rates.windows(window) {
        let mean = w.iter().sum::<f64>() / window as f64;
        if mean > best {
            best = mean;
        }
    }
    best
}

/// Percentile (`p` in `[0, 100]`) of a rate distribution via nearest-rank on
/// the sorted sample set.
pub fn percentile(rates: &[f64], p: f64) -> f64 {
    if rates.is_empty() {
        return 0.0;
    }
    let mut sorted = rates.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Build [`ThroughputStats`] from every interval of every sample in a run.
pub fn aggregate_throughput(target_bps: f64, samples: &[SampleReport]) -> ThroughputStats {
    let rates: Vec<f64> = samples
        .iter()
        .flat_map(|s| s.intervals.iter().map(|i| i.bits_per_second()))
        .collect();
    let achieved = trimmed_mean(&rates);
    ThroughputStats {
        target_bps,
        achieved_bps: achieved,
        utilization: if target_bps > 0.0 {
            achieved / target_bps
        } else {
            0.0
        },
        sustained_peak_1s_bps: sustained_peak(&rates, SUSTAINED_PEAK_WINDOW),
        p90_bps: percentile(&rates, 90.0),
        p80_bps: percentile(&rates, 80.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with_rates(rates_bps: &[f64]) -> SampleReport {
        let intervals = rates_bps
            .iter()
            .map(|bps| IntervalSample {
                bytes: (bps * 0.1 / 8.0) as u64,
                duration_ms: 100,
                out_of_order: 0,
            })
            .collect();
        SampleReport {
            sample_id: 0,
            total_bytes: 0,
            total_duration_ms: rates_bps.len() as u64 * 100,
            intervals,
            first_byte_unix_ms: 0,
            last_byte_unix_ms: 0,
            counters: ProtocolCounters::default(),
        }
    }

    #[test]
    fn trimmed_mean_drops_top_and_bottom_decile() {
        let rates: Vec<f64> = (1..=10).map(|i| i as f64 * 10.0).collect();
        // sorted 10..100 step 10; drop 1 from each end -> mean of 20..90 step 10
        let mean = trimmed_mean(&rates);
        assert!((mean - 55.0).abs() < 1e-6);
    }

    #[test]
    fn sustained_peak_picks_best_consecutive_window() {
        let mut rates = vec![1.0; 20];
        for r in rates.iter_mut().skip(5).take(10) {
            *r = 100.0;
        }
        assert!((sustained_peak(&rates, 10) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn percentiles_match_sorted_rank() {
        let rates: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert!((percentile(&rates, 90.0) - 90.0).abs() < 2.0);
        assert!((percentile(&rates, 80.0) - 80.0).abs() < 2.0);
    }

    #[test]
    fn aggregate_throughput_reports_utilization_against_target() {
        let reports = vec![report_with_rates(&[1_000_000.0; 10])];
        let stats = aggregate_throughput(1_000_000.0, &reports);
        assert!((stats.utilization - 1.0).abs() < 0.05);
    }
}
