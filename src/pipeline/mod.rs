//! Per-message transform pipeline
//!
//! decode → rewrite `gatewayID` → translate topic → forwarding decision → encode.
//! Every step is pure; the pipeline never touches a broker. Errors are scoped
//! to the single message being processed.

pub mod forwarding;
pub mod rewriter;
pub mod topic;

pub use forwarding::{should_forward, DecisionReason, ForwardDecision, PHY_PAYLOAD_KEY};
pub use rewriter::{rewrite, GATEWAY_ID_KEY};
pub use topic::{
    LiteralTopicTranslator, MessageType, ParsedTopic, StructuralTopicTranslator, TopicError,
    TopicTranslator, SUBSCRIPTION_FILTERS,
};

use crate::bridge::state::ActiveConfiguration;
use crate::transport::InboundMessage;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Per-message failures; the message is dropped and processing continues
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Payload is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Payload is JSON but not an object")]
    NotAnObject,
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("Failed to encode rewritten payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Message ready for the target broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub message_type: MessageType,
    pub reason: DecisionReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Forward(OutboundMessage),
    Drop {
        message_type: MessageType,
        reason: DecisionReason,
    },
}

/// Stateless pipeline; the active configuration is passed per call
#[derive(Clone)]
pub struct MessagePipeline {
    translator: Arc<dyn TopicTranslator>,
}

impl MessagePipeline {
    pub fn new(translator: Arc<dyn TopicTranslator>) -> Self {
        Self { translator }
    }

    /// Pipeline using the legacy first-substring namespace rule
    pub fn literal() -> Self {
        Self::new(Arc::new(LiteralTopicTranslator))
    }

    /// Pipeline replacing exactly the namespace segment
    pub fn structural() -> Self {
        Self::new(Arc::new(StructuralTopicTranslator))
    }

    pub fn process(
        &self,
        config: &ActiveConfiguration,
        message: &InboundMessage,
    ) -> Result<PipelineOutcome, MessageError> {
        let mut payload: Value =
            serde_json::from_slice(&message.payload).map_err(MessageError::Decode)?;
        if !payload.is_object() {
            return Err(MessageError::NotAnObject);
        }

        let replaced = rewrite(&mut payload, GATEWAY_ID_KEY, config.gateway_id_base64());
        debug!(topic = %message.topic, replaced, "Rewrote gateway identity");

        let parsed = ParsedTopic::parse(&message.topic)?;
        let target_topic = self
            .translator
            .translate(&message.topic, &config.forwarding().topic_namespace)?;

        let decision = should_forward(&parsed.message_type, &payload);
        if !decision.forward {
            return Ok(PipelineOutcome::Drop {
                message_type: parsed.message_type,
                reason: decision.reason,
            });
        }

        let encoded = serde_json::to_vec(&payload).map_err(MessageError::Encode)?;
        Ok(PipelineOutcome::Forward(OutboundMessage {
            topic: target_topic,
            payload: encoded,
            message_type: parsed.message_type,
            reason: decision.reason,
        }))
    }
}

impl Default for MessagePipeline {
    fn default() -> Self {
        Self::literal()
    }
}
