//! One task per subscribed topic filter
//!
//! Each task is tagged with the generation that created it. A message is
//! processed against a single snapshot and only published while that
//! generation is still the active one.

use super::state::ConfigurationState;
use crate::message_span;
use crate::observability::metrics::{metrics, DropReason};
use crate::pipeline::{DecisionReason, MessageError, MessagePipeline, PipelineOutcome};
use crate::transport::{BrokerConnection, InboundMessage, QualityOfService};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageDisposition {
    Published { topic: String },
    Filtered(DecisionReason),
    Stale,
    Invalid(String),
    PublishFailed(String),
}

pub struct SubscriptionTask<C: BrokerConnection> {
    filter: String,
    generation: u64,
    state: Arc<ConfigurationState>,
    pipeline: MessagePipeline,
    target: Arc<C>,
}

impl<C: BrokerConnection> SubscriptionTask<C> {
    pub fn new(
        filter: impl Into<String>,
        generation: u64,
        state: Arc<ConfigurationState>,
        pipeline: MessagePipeline,
        target: Arc<C>,
    ) -> Self {
        Self {
            filter: filter.into(),
            generation,
            state,
            pipeline,
            target,
        }
    }

    /// Run until every sender for `deliveries` is dropped
    pub fn spawn(self, deliveries: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        tokio::spawn(self.run(deliveries))
    }

    async fn run(self, mut deliveries: mpsc::Receiver<InboundMessage>) {
        debug!(filter = %self.filter, generation = self.generation, "Subscription task started");
        while let Some(message) = deliveries.recv().await {
            let span = message_span!(
                topic = %message.topic,
                filter = %self.filter,
                generation = self.generation
            );
            self.handle(message).instrument(span).await;
        }
        debug!(filter = %self.filter, generation = self.generation, "Subscription task finished");
    }

    /// Process and publish one message; errors never leave this function
    pub async fn handle(&self, message: InboundMessage) -> MessageDisposition {
        let started = Instant::now();
        metrics().message_received();

        let Some(snapshot) = self
            .state
            .snapshot()
            .filter(|snapshot| snapshot.generation() == self.generation)
        else {
            return self.stale(&message.topic);
        };

        let outcome = match self.pipeline.process(&snapshot, &message) {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = match &e {
                    MessageError::Topic(_) => DropReason::Malformed,
                    MessageError::Decode(_) | MessageError::NotAnObject | MessageError::Encode(_) => {
                        DropReason::Decode
                    }
                };
                warn!(topic = %message.topic, error = %e, "Dropping message");
                metrics().message_dropped(reason);
                return MessageDisposition::Invalid(e.to_string());
            }
        };

        let outbound = match outcome {
            PipelineOutcome::Forward(outbound) => outbound,
            PipelineOutcome::Drop {
                message_type,
                reason,
            } => {
                info!(
                    topic = %message.topic,
                    message_type = %message_type,
                    reason = %reason,
                    "Message filtered"
                );
                metrics().message_dropped(DropReason::Filtered);
                return MessageDisposition::Filtered(reason);
            }
        };

        // The snapshot may have been replaced while the pipeline ran
        if !self.state.is_current(self.generation) {
            return self.stale(&message.topic);
        }

        match self
            .target
            .publish(
                &outbound.topic,
                outbound.payload,
                QualityOfService::AtMostOnce,
                false,
            )
            .await
        {
            Ok(()) => {
                debug!(
                    topic = %message.topic,
                    target_topic = %outbound.topic,
                    message_type = %outbound.message_type,
                    reason = %outbound.reason,
                    generation = self.generation,
                    "Message forwarded"
                );
                metrics().message_forwarded(started.elapsed());
                MessageDisposition::Published {
                    topic: outbound.topic,
                }
            }
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    target_topic = %outbound.topic,
                    error = %e,
                    "Publish failed, message dropped"
                );
                metrics().publish_failed();
                MessageDisposition::PublishFailed(e.to_string())
            }
        }
    }

    fn stale(&self, topic: &str) -> MessageDisposition {
        debug!(
            topic = %topic,
            generation = self.generation,
            current = ?self.state.current_generation(),
            "Configuration changed, dropping stale message"
        );
        metrics().message_dropped(DropReason::Stale);
        MessageDisposition::Stale
    }
}
