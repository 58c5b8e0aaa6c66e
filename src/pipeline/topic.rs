//! Topic parsing and namespace translation for gateway event topics
//!
//! Gateway topics look like `gateway/<namespace>/event/up`. Segment 1 is the
//! namespace that gets rewritten for the target broker; the last segment is
//! the message type.

use std::fmt;
use thiserror::Error;

/// Fixed source-broker subscriptions
pub const SUBSCRIPTION_FILTERS: [&str; 3] = [
    "gateway/+/event/up",
    "gateway/+/event/stats",
    "gateway/+/state/conn",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Malformed topic '{0}': expected at least 2 '/'-separated segments")]
    MalformedTopic(String),
}

/// Gateway message type taken from the last topic segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Up,
    Stats,
    Conn,
    Unknown(String),
}

impl MessageType {
    pub fn parse(segment: &str) -> Self {
        match segment {
            "up" => MessageType::Up,
            "stats" => MessageType::Stats,
            "conn" => MessageType::Conn,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Up => "up",
            MessageType::Stats => "stats",
            MessageType::Conn => "conn",
            MessageType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrowed view of a parsed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic<'a> {
    pub raw: &'a str,
    pub namespace: &'a str,
    pub message_type: MessageType,
}

impl<'a> ParsedTopic<'a> {
    pub fn parse(topic: &'a str) -> Result<Self, TopicError> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < 2 {
            return Err(TopicError::MalformedTopic(topic.to_string()));
        }

        let namespace = segments[1];
        let message_type = MessageType::parse(segments[segments.len() - 1]);
        Ok(Self {
            raw: topic,
            namespace,
            message_type,
        })
    }
}

/// Produces the target-broker topic for a source topic
pub trait TopicTranslator: Send + Sync {
    fn translate(&self, topic: &str, new_namespace: &str) -> Result<String, TopicError>;
}

/// Replaces the first occurrence of the namespace text anywhere in the topic.
///
/// Matches the deployed gateway bridges byte for byte, including the case
/// where the namespace text also appears in segment 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiteralTopicTranslator;

impl TopicTranslator for LiteralTopicTranslator {
    fn translate(&self, topic: &str, new_namespace: &str) -> Result<String, TopicError> {
        let parsed = ParsedTopic::parse(topic)?;
        // An empty namespace would match at offset 0
        if parsed.namespace.is_empty() {
            return Ok(format!("{new_namespace}{topic}"));
        }
        Ok(topic.replacen(parsed.namespace, new_namespace, 1))
    }
}

/// Replaces exactly segment 1
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralTopicTranslator;

impl TopicTranslator for StructuralTopicTranslator {
    fn translate(&self, topic: &str, new_namespace: &str) -> Result<String, TopicError> {
        ParsedTopic::parse(topic)?;
        let translated: Vec<&str> = topic
            .split('/')
            .enumerate()
            .map(|(index, segment)| if index == 1 { new_namespace } else { segment })
            .collect();
        Ok(translated.join("/"))
    }
}
