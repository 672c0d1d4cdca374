pub mod frame;
pub mod metrics;
pub mod rpc;
pub mod sample;

pub use frame::*;
pub use metrics::*;
pub use rpc::*;
pub use sample::*;
