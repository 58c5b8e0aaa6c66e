//! Errors returned by bridge controller operations

use crate::config::ConfigError;
use crate::transport::BrokerError;
use thiserror::Error;

/// Failure of a configuration request or lifecycle operation
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Rejected configuration; the previous configuration stays active
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broker unreachable or subscription refused for this activation attempt
    #[error("Connection error: {0}")]
    Connection(#[from] BrokerError),

    /// Overtaken by a newer request before it could be applied
    #[error("Configuration {generation} superseded by {by} before it was applied")]
    Superseded { generation: u64, by: u64 },

    #[error("Bridge has been terminated")]
    Terminated,
}

impl BridgeError {
    /// Short machine-readable category
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config",
            BridgeError::Connection(_) => "connection",
            BridgeError::Superseded { .. } => "superseded",
            BridgeError::Terminated => "terminated",
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
