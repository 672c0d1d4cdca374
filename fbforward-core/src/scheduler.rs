//! Measurement scheduler (§4.7): staggers per-upstream measurement runs so
//! at most one upstream is ever being measured at a time, with randomized
//! reschedule intervals to avoid thundering-herd synchronization across
//! upstreams. Grounded on the sleep-until-next-tick loop style of
//! `iperf3-server/src/session.rs::run_sender`, generalized from one fixed
//! interval to a per-upstream random `[interval_min, interval_max]` draw.

use crate::config::ScheduleConfig;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// One scheduling decision for a run loop (§4.7).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleDecision {
    Run,
    /// Link utilization is already above `max_link_utilization`; this round
    /// is skipped rather than deferred indefinitely.
    SkippedHeadroom,
}

/// Drives the repeating measure/wait loop for one upstream. Owned by the
/// supervisor's per-upstream task, never shared.
pub struct UpstreamSchedule {
    cfg: ScheduleConfig,
}

impl UpstreamSchedule {
    pub fn new(cfg: ScheduleConfig) -> Self {
        Self { cfg }
    }

    /// Picks the next wait duration uniformly from `[interval_min, interval_max]`.
    pub fn next_interval(&self) -> Duration {
        let (lo, hi) = (self.cfg.interval_min_ms, self.cfg.interval_max_ms.max(self.cfg.interval_min_ms + 1));
        let ms = rand::thread_rng().gen_range(lo..hi);
        Duration::from_millis(ms)
    }

    /// Decides whether to run this round given the upstream's current link
    /// utilization estimate (§4.7 headroom check).
    pub fn decide(&self, current_utilization: f64) -> ScheduleDecision {
        if current_utilization >= self.cfg.max_link_utilization {
            ScheduleDecision::SkippedHeadroom
        } else {
            ScheduleDecision::Run
        }
    }

    pub async fn wait_next(&self) {
        sleep(self.next_interval()).await;
    }
}

/// Staggers the start of each upstream's schedule loop by `upstream_gap *
/// index`, so N upstreams never all probe in the same instant (§4.7).
pub fn stagger_delay(index: usize, upstream_gap_ms: u64) -> Duration {
    Duration::from_millis(index as u64 * upstream_gap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_interval_stays_within_configured_bounds() {
        let cfg = ScheduleConfig {
            interval_min_ms: 1_000,
            interval_max_ms: 2_000,
            upstream_gap_ms: 100,
            max_link_utilization: 0.7,
        };
        let schedule = UpstreamSchedule::new(cfg);
        for _ in 0..50 {
            let d = schedule.next_interval();
            assert!(d >= Duration::from_millis(1_000));
            assert!(d < Duration::from_millis(2_000));
        }
    }

    #[test]
    fn decide_skips_above_headroom_threshold() {
        let cfg = ScheduleConfig {
            interval_min_ms: 30_000,
            interval_max_ms: 60_000,
            upstream_gap_ms: 2_000,
            max_link_utilization: 0.7,
        };
        let schedule = UpstreamSchedule::new(cfg);
        assert_eq!(schedule.decide(0.5), ScheduleDecision::Run);
        assert_eq!(schedule.decide(0.7), ScheduleDecision::SkippedHeadroom);
        assert_eq!(schedule.decide(0.9), ScheduleDecision::SkippedHeadroom);
    }

    #[test]
    fn stagger_delay_scales_with_index() {
        assert_eq!(stagger_delay(0, 2_000), Duration::from_millis(0));
        assert_eq!(stagger_delay(3, 2_000), Duration::from_millis(6_000));
    }
}
