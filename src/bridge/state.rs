//! Active configuration snapshot shared with every message task
//!
//! The whole record is swapped in one atomic store, so a reader sees either
//! the complete old configuration or the complete new one. Generations are
//! reserved before a request waits for the controller, which lets an older
//! request notice it has been superseded.

use crate::config::{ConfigError, ForwardingConfig};
use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Immutable configuration as seen by the message pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveConfiguration {
    generation: u64,
    #[serde(flatten)]
    forwarding: ForwardingConfig,
    gateway_id_base64: String,
    applied_at: DateTime<Utc>,
}

impl ActiveConfiguration {
    /// Validate the record and precompute the base64 identity
    pub fn new(generation: u64, forwarding: ForwardingConfig) -> Result<Self, ConfigError> {
        forwarding.validate()?;
        let identity = hex::decode(&forwarding.gateway_id)
            .map_err(|e| ConfigError::InvalidGatewayId(format!("'{}': {e}", forwarding.gateway_id)))?;

        Ok(Self {
            generation,
            gateway_id_base64: STANDARD.encode(identity),
            forwarding,
            applied_at: Utc::now(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn forwarding(&self) -> &ForwardingConfig {
        &self.forwarding
    }

    /// Identity as written into `gatewayID` fields
    pub fn gateway_id_base64(&self) -> &str {
        &self.gateway_id_base64
    }

    pub fn applied_at(&self) -> DateTime<Utc> {
        self.applied_at
    }
}

/// Copy-on-write holder of the active configuration
#[derive(Debug, Default)]
pub struct ConfigurationState {
    current: ArcSwapOption<ActiveConfiguration>,
    reserved: AtomicU64,
}

impl ConfigurationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next generation number (starts at 1)
    pub fn reserve_generation(&self) -> u64 {
        self.reserved.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest generation handed out so far
    pub fn latest_reserved(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }

    /// True once a newer request has reserved a generation
    pub fn is_superseded(&self, generation: u64) -> bool {
        self.latest_reserved() > generation
    }

    /// Load the whole record once; callers keep the Arc for the duration of a message
    pub fn snapshot(&self) -> Option<Arc<ActiveConfiguration>> {
        self.current.load_full()
    }

    pub fn current_generation(&self) -> Option<u64> {
        let current = self.current.load();
        Option::as_ref(&*current).map(|config| config.generation())
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == Some(generation)
    }

    /// Publish a new record, returning the one it replaced
    pub fn install(&self, config: ActiveConfiguration) -> Option<Arc<ActiveConfiguration>> {
        self.current.swap(Some(Arc::new(config)))
    }

    /// Put back a record returned by [`install`](Self::install)
    pub fn restore(&self, previous: Option<Arc<ActiveConfiguration>>) {
        self.current.store(previous);
    }

    pub fn clear(&self) -> Option<Arc<ActiveConfiguration>> {
        self.current.swap(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarding(gateway_id: &str, namespace: &str) -> ForwardingConfig {
        ForwardingConfig {
            source_broker: "tcp://source:1883".to_string(),
            target_broker: "tcp://target:1883".to_string(),
            gateway_id: gateway_id.to_string(),
            topic_namespace: namespace.to_string(),
        }
    }

    #[test]
    fn test_identity_is_reencoded_as_base64() {
        let config = ActiveConfiguration::new(1, forwarding("48656c6c6f", "GW1")).unwrap();
        assert_eq!(config.gateway_id_base64(), "SGVsbG8=");
        assert_eq!(config.generation(), 1);
        assert_eq!(config.forwarding().topic_namespace, "GW1");

        let upper = ActiveConfiguration::new(2, forwarding("0102ABCD", "GW1")).unwrap();
        assert_eq!(upper.gateway_id_base64(), "AQKrzQ==");
    }

    #[test]
    fn test_invalid_records_are_rejected() {
        assert!(matches!(
            ActiveConfiguration::new(1, forwarding("zz", "GW1")),
            Err(ConfigError::InvalidGatewayId(_))
        ));
        assert!(matches!(
            ActiveConfiguration::new(1, forwarding("0102", "")),
            Err(ConfigError::MissingField("topic_namespace"))
        ));
    }

    #[test]
    fn test_generations_increase() {
        let state = ConfigurationState::new();
        assert_eq!(state.latest_reserved(), 0);
        assert_eq!(state.reserve_generation(), 1);
        assert_eq!(state.reserve_generation(), 2);
        assert!(state.is_superseded(1));
        assert!(!state.is_superseded(2));
    }

    #[test]
    fn test_install_swaps_whole_record() {
        let state = ConfigurationState::new();
        assert!(state.snapshot().is_none());
        assert_eq!(state.current_generation(), None);

        let first = ActiveConfiguration::new(1, forwarding("0102", "A")).unwrap();
        assert!(state.install(first).is_none());
        let held = state.snapshot().unwrap();

        let second = ActiveConfiguration::new(2, forwarding("0304", "B")).unwrap();
        let previous = state.install(second).unwrap();
        assert_eq!(previous.generation(), 1);

        // A reader holding the old snapshot still sees a consistent record
        assert_eq!(held.forwarding().topic_namespace, "A");
        assert_eq!(held.gateway_id_base64(), "AQI=");
        assert!(state.is_current(2));
        assert!(!state.is_current(1));
    }

    #[test]
    fn test_restore_and_clear() {
        let state = ConfigurationState::new();
        state.install(ActiveConfiguration::new(1, forwarding("0102", "A")).unwrap());
        let previous = state.install(ActiveConfiguration::new(2, forwarding("0102", "B")).unwrap());

        state.restore(previous);
        assert!(state.is_current(1));

        assert_eq!(state.clear().map(|c| c.generation()), Some(1));
        assert!(state.snapshot().is_none());
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let config = ActiveConfiguration::new(7, forwarding("48656c6c6f", "GW1")).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["generation"], 7);
        assert_eq!(json["source_broker"], "tcp://source:1883");
        assert_eq!(json["gateway_id_base64"], "SGVsbG8=");
        assert!(json["applied_at"].is_string());
    }
}
