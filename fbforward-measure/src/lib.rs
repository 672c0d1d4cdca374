//! # fbforward-measure
//!
//! Pacing sender, measurement session state, measurement server and client,
//! all speaking the length-prefixed JSON-RPC framing defined in
//! `fbforward-protocol`.
//!
//! Async/await based on Tokio, matching the surrounding workspace.

pub mod client;
pub mod config;
pub mod error;
pub mod pacing;
pub mod server;
pub mod session;
pub mod tcp_info;

pub use client::{MeasurementClient, RunResult, RttStats};
pub use config::{MeasurementClientConfig, MeasurementServerConfig, ProtocolMeasurementConfig};
pub use error::{MeasureError, Result};
pub use server::MeasurementServer;
pub use session::{ActiveSample, MeasurementSession};
