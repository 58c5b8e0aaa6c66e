//! Pass/drop decision for gateway messages
//!
//! Uplinks whose DevAddr belongs to the home network must not be forwarded
//! back out; everything else passes.

use super::topic::MessageType;
use crate::lorawan::{extract_device_address, net_id_of, NetworkIdentifier, FOREIGN_NET_ID};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Key holding the base64 PHY payload in uplink events
pub const PHY_PAYLOAD_KEY: &str = "phyPayload";

/// Why a message was forwarded or dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionReason {
    /// Message type is never filtered (`stats`, `conn`)
    NotFiltered,
    /// Message type outside the subscribed set
    UnknownType(String),
    /// Uplink without a `phyPayload` key
    NoPhyPayload,
    /// `phyPayload` present but not a base64 string
    PhyPayloadUndecodable(String),
    /// PHY payload too short to carry a DevAddr
    MalformedPacket { len: usize },
    /// DevAddr NetID is the foreign-network sentinel
    ForeignNetwork(NetworkIdentifier),
    /// DevAddr NetID belongs to the home network
    HomeNetwork(NetworkIdentifier),
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::NotFiltered => write!(f, "message type not filtered"),
            DecisionReason::UnknownType(kind) => write!(f, "unknown message type '{kind}'"),
            DecisionReason::NoPhyPayload => write!(f, "no phyPayload to inspect"),
            DecisionReason::PhyPayloadUndecodable(e) => {
                write!(f, "phyPayload could not be decoded: {e}")
            }
            DecisionReason::MalformedPacket { len } => {
                write!(f, "PHY payload too short ({len} bytes)")
            }
            DecisionReason::ForeignNetwork(net_id) => write!(f, "foreign NetID {net_id}"),
            DecisionReason::HomeNetwork(net_id) => write!(f, "home network NetID {net_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardDecision {
    pub forward: bool,
    pub reason: DecisionReason,
}

impl ForwardDecision {
    fn forward(reason: DecisionReason) -> Self {
        Self {
            forward: true,
            reason,
        }
    }

    fn drop(reason: DecisionReason) -> Self {
        Self {
            forward: false,
            reason,
        }
    }
}

/// Decide whether a decoded message should be published to the target broker
pub fn should_forward(message_type: &MessageType, payload: &Value) -> ForwardDecision {
    match message_type {
        MessageType::Up => decide_uplink(payload),
        MessageType::Stats | MessageType::Conn => {
            ForwardDecision::forward(DecisionReason::NotFiltered)
        }
        MessageType::Unknown(kind) => {
            warn!(message_type = %kind, "Unknown topic type, forwarding unfiltered");
            ForwardDecision::forward(DecisionReason::UnknownType(kind.clone()))
        }
    }
}

fn decide_uplink(payload: &Value) -> ForwardDecision {
    let Some(phy_payload) = payload.get(PHY_PAYLOAD_KEY) else {
        return ForwardDecision::forward(DecisionReason::NoPhyPayload);
    };

    let raw = match decode_phy_payload(phy_payload) {
        Ok(raw) => raw,
        Err(e) => {
            // Forwarding on decode failure is the deployed behaviour; see DESIGN.md
            warn!(error = %e, "Failed to decode phyPayload, forwarding unfiltered");
            return ForwardDecision::forward(DecisionReason::PhyPayloadUndecodable(e));
        }
    };

    let address = match extract_device_address(&raw) {
        Ok(address) => address,
        Err(e) => {
            debug!(error = %e, "Dropping uplink with malformed PHY payload");
            return ForwardDecision::drop(DecisionReason::MalformedPacket { len: raw.len() });
        }
    };

    let net_id = net_id_of(&address);
    debug!(dev_addr = %address, net_id = %net_id, "Resolved uplink NetID");

    if net_id == FOREIGN_NET_ID {
        ForwardDecision::forward(DecisionReason::ForeignNetwork(net_id))
    } else {
        ForwardDecision::drop(DecisionReason::HomeNetwork(net_id))
    }
}

fn decode_phy_payload(value: &Value) -> Result<Vec<u8>, String> {
    let encoded = value
        .as_str()
        .ok_or_else(|| format!("expected a base64 string, found {value}"))?;
    STANDARD.decode(encoded).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn uplink_with(phy: &[u8]) -> Value {
        json!({"gatewayID": "AQIDBAUGBwg=", "phyPayload": STANDARD.encode(phy)})
    }

    #[test]
    fn test_foreign_net_id_is_forwarded() {
        // DevAddr LE bytes 00 00 00 02 -> BE 02 00 00 00 -> NetID 0x01
        let payload = uplink_with(&[0x40, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01]);
        let decision = should_forward(&MessageType::Up, &payload);
        assert!(decision.forward);
        assert_eq!(
            decision.reason,
            DecisionReason::ForeignNetwork(NetworkIdentifier(0x01))
        );
    }

    #[test]
    fn test_home_net_id_is_dropped() {
        let payload = uplink_with(&[0x40, 0x11, 0x22, 0x33, 0x00, 0x00]);
        let decision = should_forward(&MessageType::Up, &payload);
        assert!(!decision.forward);
        assert_eq!(
            decision.reason,
            DecisionReason::HomeNetwork(NetworkIdentifier(0x00))
        );
    }

    #[test]
    fn test_other_net_ids_are_dropped() {
        // First BE byte 0x26 -> NetID 0x13
        let payload = uplink_with(&[0x40, 0x04, 0x03, 0x02, 0x26]);
        let decision = should_forward(&MessageType::Up, &payload);
        assert!(!decision.forward);
        assert_eq!(
            decision.reason,
            DecisionReason::HomeNetwork(NetworkIdentifier(0x13))
        );
    }

    #[test]
    fn test_uplink_without_phy_payload_is_forwarded() {
        let decision = should_forward(&MessageType::Up, &json!({"gatewayID": "x"}));
        assert!(decision.forward);
        assert_eq!(decision.reason, DecisionReason::NoPhyPayload);
    }

    #[test]
    fn test_nested_phy_payload_is_not_inspected() {
        let payload = json!({"uplink": {"phyPayload": STANDARD.encode([0x40, 0, 0, 0, 0])}});
        let decision = should_forward(&MessageType::Up, &payload);
        assert_eq!(decision.reason, DecisionReason::NoPhyPayload);
    }

    #[test]
    fn test_undecodable_phy_payload_is_forwarded() {
        let decision = should_forward(&MessageType::Up, &json!({"phyPayload": "!!not base64!!"}));
        assert!(decision.forward);
        assert!(matches!(
            decision.reason,
            DecisionReason::PhyPayloadUndecodable(_)
        ));

        let decision = should_forward(&MessageType::Up, &json!({"phyPayload": 42}));
        assert!(decision.forward);
        assert!(matches!(
            decision.reason,
            DecisionReason::PhyPayloadUndecodable(_)
        ));
    }

    #[test]
    fn test_short_phy_payload_is_dropped() {
        let payload = uplink_with(&[0x40, 0x01, 0x02]);
        let decision = should_forward(&MessageType::Up, &payload);
        assert!(!decision.forward);
        assert_eq!(decision.reason, DecisionReason::MalformedPacket { len: 3 });
    }

    #[test]
    fn test_stats_and_conn_always_forward() {
        let payload = uplink_with(&[0x40, 0x11, 0x22, 0x33, 0x00]);
        for kind in [MessageType::Stats, MessageType::Conn] {
            let decision = should_forward(&kind, &payload);
            assert!(decision.forward);
            assert_eq!(decision.reason, DecisionReason::NotFiltered);
        }
    }

    #[test]
    fn test_unknown_type_forwards_with_annotation() {
        let decision = should_forward(&MessageType::Unknown("ack".to_string()), &json!({}));
        assert!(decision.forward);
        assert_eq!(decision.reason, DecisionReason::UnknownType("ack".to_string()));
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            DecisionReason::HomeNetwork(NetworkIdentifier(0)).to_string(),
            "home network NetID 00"
        );
        assert_eq!(
            DecisionReason::MalformedPacket { len: 2 }.to_string(),
            "PHY payload too short (2 bytes)"
        );
    }
}
