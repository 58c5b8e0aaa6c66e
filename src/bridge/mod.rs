//! Bridge orchestration
//!
//! - [`state`] - Atomic configuration snapshot and generation counter
//! - [`subscription`] - Per-filter message tasks
//! - [`controller`] - Activation, reconfiguration and shutdown

pub mod controller;
pub mod state;
pub mod subscription;

pub use controller::{BridgeController, BridgeProbe, BridgeState, ConnectionStatus};
pub use state::{ActiveConfiguration, ConfigurationState};
pub use subscription::{MessageDisposition, SubscriptionTask};
