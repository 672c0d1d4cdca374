//! Configuration for the measurement client/server (§6 `measurement.*`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long the server waits for in-flight bytes after `sample.stop`.
    #[serde(default = "default_recv_wait_ms")]
    pub recv_wait_ms: u64,
    /// Idle timeout before the session reaper closes a session.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5501
}
fn default_recv_wait_ms() -> u64 {
    100
}
fn default_session_idle_secs() -> u64 {
    30
}

impl Default for MeasurementServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            recv_wait_ms: default_recv_wait_ms(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

/// Per-protocol measurement parameters (§6 `measurement.protocols.tcp/udp`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProtocolMeasurementConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_target_bandwidth")]
    pub target_bandwidth_up_bps: f64,
    #[serde(default = "default_target_bandwidth")]
    pub target_bandwidth_down_bps: f64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_sample_size_bytes")]
    pub sample_size_bytes: u64,
    #[serde(default = "default_sample_count")]
    pub sample_count: u32,
    #[serde(default = "default_timeout_per_sample_ms")]
    pub timeout_per_sample_ms: u64,
    #[serde(default = "default_timeout_per_cycle_ms")]
    pub timeout_per_cycle_ms: u64,
    /// RTT sampling rate during a sample, in Hz.
    #[serde(default = "default_rtt_hz")]
    pub rtt_sample_hz: u32,
}

fn default_true() -> bool {
    true
}
fn default_target_bandwidth() -> f64 {
    10_000_000.0
}
fn default_chunk_size() -> u32 {
    1200
}
fn default_sample_size_bytes() -> u64 {
    1_000_000
}
fn default_sample_count() -> u32 {
    5
}
fn default_timeout_per_sample_ms() -> u64 {
    5_000
}
fn default_timeout_per_cycle_ms() -> u64 {
    60_000
}
fn default_rtt_hz() -> u32 {
    10
}

impl Default for ProtocolMeasurementConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            target_bandwidth_up_bps: default_target_bandwidth(),
            target_bandwidth_down_bps: default_target_bandwidth(),
            chunk_size: default_chunk_size(),
            sample_size_bytes: default_sample_size_bytes(),
            sample_count: default_sample_count(),
            timeout_per_sample_ms: default_timeout_per_sample_ms(),
            timeout_per_cycle_ms: default_timeout_per_cycle_ms(),
            rtt_sample_hz: default_rtt_hz(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementClientConfig {
    #[serde(default)]
    pub tcp: ProtocolMeasurementConfig,
    #[serde(default)]
    pub udp: ProtocolMeasurementConfig,
    /// Delay between samples within one cycle.
    #[serde(default = "default_sample_wait_ms")]
    pub sample_wait_ms: u64,
}

fn default_sample_wait_ms() -> u64 {
    200
}

impl Default for MeasurementClientConfig {
    fn default() -> Self {
        Self {
            tcp: ProtocolMeasurementConfig::default(),
            udp: ProtocolMeasurementConfig::default(),
            sample_wait_ms: default_sample_wait_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_config_defaults_match_spec() {
        let cfg = ProtocolMeasurementConfig::default();
        assert_eq!(cfg.chunk_size, 1200);
        assert_eq!(cfg.sample_count, 5);
    }
}
