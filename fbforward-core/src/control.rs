//! Control operations (§6): the handle a control plane (out of scope) uses
//! to drive the supervisor. The core only honors the contract; an embedder
//! owns the transport (HTTP, gRPC, whatever). Grounded on the trait-handle
//! pattern named in §9 for the narrow capability sets the scheduler/scoring
//! engine consume upstreams through, applied here to the supervisor-facing
//! side instead.

use crate::upstream_manager::UpstreamSnapshot;
use fbforward_protocol::Protocol;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone)]
pub struct ScheduleStatus {
    pub upstream_tag: String,
    pub next_run_in: Duration,
    pub last_decision: Option<String>,
}

#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    async fn set_primary(&self, mode: PrimaryMode, tag: Option<String>) -> Result<(), crate::error::ForwardError>;
    async fn trigger_restart(&self) -> Result<(), crate::error::ForwardError>;
    async fn run_measurement(&self, tag: String, protocol: Protocol) -> Result<(), crate::error::ForwardError>;
    async fn get_snapshot(&self) -> Vec<UpstreamSnapshot>;
    async fn get_schedule_status(&self) -> Vec<ScheduleStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_mode_variants_are_distinguishable() {
        assert_ne!(PrimaryMode::Auto, PrimaryMode::Manual);
    }
}
