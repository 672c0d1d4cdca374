//! Configuration schema (§6). Every section is a plain, `Default`-bearing,
//! `serde`-deserializable struct accepted pre-built (tests construct these
//! directly); `Config::load` is a thin file+environment loader on top.

use fbforward_measure::ProtocolMeasurementConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub addr: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub tag: String,
    pub host: String,
    pub measurement_endpoint: String,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub bias: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    1_000
}
fn default_window_size() -> usize {
    5
}
fn default_startup_delay_ms() -> u64 {
    0
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            window_size: default_window_size(),
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_min_ms")]
    pub interval_min_ms: u64,
    #[serde(default = "default_interval_max_ms")]
    pub interval_max_ms: u64,
    #[serde(default = "default_upstream_gap_ms")]
    pub upstream_gap_ms: u64,
    #[serde(default = "default_max_link_utilization")]
    pub max_link_utilization: f64,
}

fn default_interval_min_ms() -> u64 {
    30_000
}
fn default_interval_max_ms() -> u64 {
    60_000
}
fn default_upstream_gap_ms() -> u64 {
    2_000
}
fn default_max_link_utilization() -> f64 {
    0.7
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_min_ms: default_interval_min_ms(),
            interval_max_ms: default_interval_max_ms(),
            upstream_gap_ms: default_upstream_gap_ms(),
            max_link_utilization: default_max_link_utilization(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastStartConfig {
    #[serde(default = "default_fast_start_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_warmup_duration_ms")]
    pub warmup_duration_ms: u64,
}

fn default_fast_start_timeout_ms() -> u64 {
    500
}
fn default_warmup_duration_ms() -> u64 {
    15_000
}

impl Default for FastStartConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fast_start_timeout_ms(),
            warmup_duration_ms: default_warmup_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    #[serde(default)]
    pub fast_start: FastStartConfig,
    #[serde(default)]
    pub tcp: ProtocolMeasurementConfig,
    #[serde(default)]
    pub udp: ProtocolMeasurementConfig,
}

fn default_stale_threshold_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            startup_delay_ms: default_startup_delay_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            fast_start: FastStartConfig::default(),
            tcp: ProtocolMeasurementConfig::default(),
            udp: ProtocolMeasurementConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceValues {
    #[serde(default = "default_ref_bandwidth")]
    pub bandwidth_up: f64,
    #[serde(default = "default_ref_bandwidth")]
    pub bandwidth_down: f64,
    #[serde(default = "default_ref_rtt")]
    pub rtt: f64,
    #[serde(default = "default_ref_jitter")]
    pub jitter: f64,
    #[serde(default = "default_ref_retransmit_rate")]
    pub retransmit_rate: f64,
    #[serde(default = "default_ref_loss_rate")]
    pub loss_rate: f64,
}

fn default_ref_bandwidth() -> f64 {
    10_000_000.0
}
fn default_ref_rtt() -> f64 {
    50.0
}
fn default_ref_jitter() -> f64 {
    10.0
}
fn default_ref_retransmit_rate() -> f64 {
    0.02
}
fn default_ref_loss_rate() -> f64 {
    0.02
}

impl Default for ReferenceValues {
    fn default() -> Self {
        Self {
            bandwidth_up: default_ref_bandwidth(),
            bandwidth_down: default_ref_bandwidth(),
            rtt: default_ref_rtt(),
            jitter: default_ref_jitter(),
            retransmit_rate: default_ref_retransmit_rate(),
            loss_rate: default_ref_loss_rate(),
        }
    }
}

/// Sub-score weights for one protocol (§4.5 `Q`); must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProtocolWeights {
    pub bandwidth_up: f64,
    pub bandwidth_down: f64,
    pub rtt: f64,
    pub jitter: f64,
    pub loss_or_retransmit: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub tcp: ProtocolWeights,
    pub udp: ProtocolWeights,
    /// `ω_tcp`; `ω_udp = 1 - ω_tcp` (default 0.5/0.5, §4.5 Overall).
    #[serde(default = "default_protocol_blend")]
    pub protocol_blend: f64,
}

fn default_protocol_blend() -> f64 {
    0.5
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            // TCP favors RTT + retransmit.
            tcp: ProtocolWeights {
                bandwidth_up: 0.15,
                bandwidth_down: 0.15,
                rtt: 0.3,
                jitter: 0.1,
                loss_or_retransmit: 0.3,
            },
            // UDP favors jitter + download.
            udp: ProtocolWeights {
                bandwidth_up: 0.15,
                bandwidth_down: 0.3,
                rtt: 0.15,
                jitter: 0.25,
                loss_or_retransmit: 0.15,
            },
            protocol_blend: default_protocol_blend(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UtilizationPenaltyConfig {
    #[serde(default = "default_min_multiplier")]
    pub min_multiplier: f64,
    #[serde(default = "default_u_threshold")]
    pub threshold: f64,
    #[serde(default = "default_exponent")]
    pub exponent: f64,
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,
}

fn default_min_multiplier() -> f64 {
    0.3
}
fn default_u_threshold() -> f64 {
    0.7
}
fn default_exponent() -> f64 {
    2.0
}
fn default_window_duration_ms() -> u64 {
    5_000
}

impl Default for UtilizationPenaltyConfig {
    fn default() -> Self {
        Self {
            min_multiplier: default_min_multiplier(),
            threshold: default_u_threshold(),
            exponent: default_exponent(),
            window_duration_ms: default_window_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BiasTransformConfig {
    /// `κ`, default `ln 2`.
    #[serde(default = "default_kappa")]
    pub kappa: f64,
}

fn default_kappa() -> f64 {
    std::f64::consts::LN_2
}

impl Default for BiasTransformConfig {
    fn default() -> Self {
        Self {
            kappa: default_kappa(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    #[serde(default)]
    pub reference_tcp: ReferenceValues,
    #[serde(default)]
    pub reference_udp: ReferenceValues,
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub utilization_penalty: UtilizationPenaltyConfig,
    #[serde(default)]
    pub bias_transform: BiasTransformConfig,
}

fn default_ema_alpha() -> f64 {
    0.2
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            reference_tcp: ReferenceValues::default(),
            reference_udp: ReferenceValues::default(),
            weights: ScoringWeights::default(),
            utilization_penalty: UtilizationPenaltyConfig::default(),
            bias_transform: BiasTransformConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SwitchingConfig {
    #[serde(default = "default_score_delta_threshold")]
    pub score_delta_threshold: f64,
    #[serde(default = "default_confirm_duration_ms")]
    pub confirm_duration_ms: u64,
    #[serde(default = "default_min_hold_time_ms")]
    pub min_hold_time_ms: u64,
    #[serde(default = "default_loss_failover_threshold")]
    pub loss_failover_threshold: f64,
    #[serde(default = "default_retransmit_failover_threshold")]
    pub retransmit_failover_threshold: f64,
    #[serde(default)]
    pub close_flows_on_failover: bool,
    #[serde(default = "default_max_dial_failures")]
    pub max_dial_failures: u32,
}

fn default_score_delta_threshold() -> f64 {
    5.0
}
fn default_confirm_duration_ms() -> u64 {
    15_000
}
fn default_min_hold_time_ms() -> u64 {
    30_000
}
fn default_loss_failover_threshold() -> f64 {
    0.2
}
fn default_retransmit_failover_threshold() -> f64 {
    0.2
}
fn default_max_dial_failures() -> u32 {
    5
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            score_delta_threshold: default_score_delta_threshold(),
            confirm_duration_ms: default_confirm_duration_ms(),
            min_hold_time_ms: default_min_hold_time_ms(),
            loss_failover_threshold: default_loss_failover_threshold(),
            retransmit_failover_threshold: default_retransmit_failover_threshold(),
            close_flows_on_failover: false,
            max_dial_failures: default_max_dial_failures(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_tcp_connections")]
    pub max_tcp_connections: usize,
    #[serde(default = "default_max_udp_mappings")]
    pub max_udp_mappings: usize,
}

fn default_max_tcp_connections() -> usize {
    1_000
}
fn default_max_udp_mappings() -> usize {
    4_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tcp_connections: default_max_tcp_connections(),
            max_udp_mappings: default_max_udp_mappings(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IdleTimeoutsConfig {
    #[serde(default = "default_tcp_idle_seconds")]
    pub tcp_seconds: u64,
    #[serde(default = "default_udp_idle_seconds")]
    pub udp_seconds: u64,
}

fn default_tcp_idle_seconds() -> u64 {
    300
}
fn default_udp_idle_seconds() -> u64 {
    60
}

impl Default for IdleTimeoutsConfig {
    fn default() -> Self {
        Self {
            tcp_seconds: default_tcp_idle_seconds(),
            udp_seconds: default_udp_idle_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub switching: SwitchingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub idle_timeouts: IdleTimeoutsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads `fbforward.toml` (if present) overlaid with `FBFORWARD__*`
    /// environment variables; parsing/validation failures are not bound by
    /// any invariant in this document, only the resulting struct shape is.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("fbforward").required(false))
            .add_source(config::Environment::with_prefix("FBFORWARD").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config file, using defaults");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoring_weights_sum_to_one_per_protocol() {
        let w = ScoringWeights::default();
        let tcp_sum = w.tcp.bandwidth_up
            + w.tcp.bandwidth_down
            + w.tcp.rtt
            + w.tcp.jitter
            + w.tcp.loss_or_retransmit;
        let udp_sum = w.udp.bandwidth_up
            + w.udp.bandwidth_down
            + w.udp.rtt
            + w.udp.jitter
            + w.udp.loss_or_retransmit;
        assert!((tcp_sum - 1.0).abs() < 1e-9);
        assert!((udp_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn config_default_is_empty_but_well_formed() {
        let cfg = Config::default();
        assert!(cfg.listeners.is_empty());
        assert_eq!(cfg.switching.score_delta_threshold, 5.0);
    }
}
