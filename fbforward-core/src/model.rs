//! Upstream and flow data model (§3). The upstream manager owns `Upstream`
//! records exclusively; forwarders own flow-table entries and reference an
//! upstream only by its `tag` value, never the record itself (§9 flow table
//! ownership cycles).

use fbforward_protocol::{Protocol, SmoothedMetrics};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Per-protocol traffic accounting used for the utilization penalty (§4.5).
#[derive(Debug, Clone, Default)]
pub struct UtilizationWindow {
    /// `(timestamp, bytes)` samples within the rolling window.
    samples: VecDeque<(Instant, u64)>,
}

impl UtilizationWindow {
    pub fn record(&mut self, bytes: u64) {
        self.samples.push_back((Instant::now(), bytes));
    }

    /// Bytes observed within `window` of now, oldest entries dropped.
    pub fn bytes_in_window(&mut self, window: std::time::Duration) -> u64 {
        let cutoff = Instant::now() - window;
        while matches!(self.samples.front(), Some((t, _)) if *t < cutoff) {
            self.samples.pop_front();
        }
        self.samples.iter().map(|(_, b)| b).sum()
    }
}

/// One configured backend (§3).
#[derive(Debug, Clone)]
pub struct Upstream {
    pub tag: String,
    pub host: String,
    pub resolved_ips: Vec<IpAddr>,
    pub active_ip: Option<IpAddr>,
    pub measurement_endpoint: SocketAddr,
    pub priority: f64,
    pub bias: f64,

    pub tcp_metrics: SmoothedMetrics,
    pub udp_metrics: SmoothedMetrics,

    pub bytes_up: u64,
    pub bytes_down: u64,
    pub utilization_up: UtilizationWindow,
    pub utilization_down: UtilizationWindow,

    pub dial_failures: u32,
    pub last_dial_failure: Option<Instant>,

    pub reachable: bool,
    pub last_score: f64,
}

impl Upstream {
    pub fn new(tag: impl Into<String>, host: impl Into<String>, measurement_endpoint: SocketAddr) -> Self {
        Self {
            tag: tag.into(),
            host: host.into(),
            resolved_ips: Vec::new(),
            active_ip: None,
            measurement_endpoint,
            priority: 0.0,
            bias: 0.0,
            tcp_metrics: SmoothedMetrics::default(),
            udp_metrics: SmoothedMetrics::default(),
            bytes_up: 0,
            bytes_down: 0,
            utilization_up: UtilizationWindow::default(),
            utilization_down: UtilizationWindow::default(),
            dial_failures: 0,
            last_dial_failure: None,
            reachable: false,
            last_score: 0.0,
        }
    }

    /// Usable iff reachable, dial failures are below the configured
    /// threshold, and loss/retransmit hasn't pinned at 100% (§3 Usability).
    pub fn is_usable(&self, max_dial_failures: u32) -> bool {
        if !self.reachable {
            return false;
        }
        if self.dial_failures >= max_dial_failures {
            return false;
        }
        if self.tcp_metrics.loss_or_retrans_rate >= 1.0 && self.udp_metrics.loss_or_retrans_rate >= 1.0 {
            return false;
        }
        true
    }

    pub fn record_dial_failure(&mut self) {
        self.dial_failures += 1;
        self.last_dial_failure = Some(Instant::now());
    }

    pub fn decay_dial_failures(&mut self, cooldown: std::time::Duration) {
        if let Some(last) = self.last_dial_failure {
            if last.elapsed() >= cooldown && self.dial_failures > 0 {
                self.dial_failures -= 1;
                self.last_dial_failure = Some(Instant::now());
            }
        }
    }

    pub fn smoothed_metrics(&self, protocol: Protocol) -> &SmoothedMetrics {
        match protocol {
            Protocol::Tcp => &self.tcp_metrics,
            Protocol::Udp => &self.udp_metrics,
        }
    }
}

/// A TCP connection or UDP 5-tuple mapping (§3). Holds only the upstream
/// `tag`, never a reference to the `Upstream` record — the tag never changes
/// once assigned.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: String,
    pub protocol: Protocol,
    pub client_addr: SocketAddr,
    pub listener_addr: SocketAddr,
    pub upstream_tag: String,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl Flow {
    pub fn new(
        id: impl Into<String>,
        protocol: Protocol,
        client_addr: SocketAddr,
        listener_addr: SocketAddr,
        upstream_tag: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            protocol,
            client_addr,
            listener_addr,
            upstream_tag: upstream_tag.into(),
            created_at: now,
            last_activity: now,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_unreachable_is_never_usable() {
        let mut u = Upstream::new("a", "10.0.0.1", "10.0.0.1:5501".parse().unwrap());
        u.reachable = false;
        assert!(!u.is_usable(5));
        u.reachable = true;
        assert!(u.is_usable(5));
    }

    #[test]
    fn upstream_past_dial_failure_threshold_is_unusable() {
        let mut u = Upstream::new("a", "10.0.0.1", "10.0.0.1:5501".parse().unwrap());
        u.reachable = true;
        u.dial_failures = 5;
        assert!(!u.is_usable(5));
    }

    #[test]
    fn flow_tag_is_fixed_at_construction() {
        let flow = Flow::new(
            "f1",
            Protocol::Tcp,
            "1.2.3.4:1000".parse().unwrap(),
            "0.0.0.0:8080".parse().unwrap(),
            "upstream-a",
        );
        assert_eq!(flow.upstream_tag, "upstream-a");
    }
}
