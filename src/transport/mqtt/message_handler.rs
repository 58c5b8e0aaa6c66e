//! MQTT event routing and per-filter message dispatch
//!
//! `MessageHandler` turns rumqttc events into routing decisions without
//! side effects; `SubscriptionRouter` fans incoming publishes out to the
//! handler channel of every matching filter; `SubackTracker` pairs
//! SUBSCRIBE requests with the broker's SUBACK.

use crate::transport::{topic_matches, InboundMessage};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::{ConnectionError, Event, StateError};
use rumqttc::Outgoing;
use std::collections::VecDeque;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejection: suback
                        .return_codes
                        .iter()
                        .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                        .map(|code| format!("{code:?}")),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(packet_id)) => EventRoute::SubscribeSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Reason code of a SUBACK refusal reported as an event loop error.
    ///
    /// rumqttc does not emit the SUBACK event for a refused subscription; it
    /// fails the poll instead and drops the session.
    pub fn subscription_rejection(error: &ConnectionError) -> Option<String> {
        match error {
            ConnectionError::MqttState(StateError::SubFail { reason }) => {
                Some(format!("{reason:?}"))
            }
            _ => None,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// MQTT broker disconnected
    Disconnected,
    /// SUBACK received; `rejection` holds the first refused reason code
    SubscriptionConfirmed {
        packet_id: u16,
        rejection: Option<String>,
    },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// SUBSCRIBE written with this packet id
    SubscribeSent { packet_id: u16 },
    /// Our own DISCONNECT left the client
    DisconnectSent,
    /// Any other outgoing packet
    OutgoingEvent,
}

/// Outcome of a SUBSCRIBE as seen by the caller waiting on it
pub type SubscribeOutcome = Result<(), String>;

#[derive(Debug)]
struct PendingSubscribe {
    filter: String,
    waiter: Option<oneshot::Sender<SubscribeOutcome>>,
}

impl PendingSubscribe {
    fn resolve(self, outcome: SubscribeOutcome) -> String {
        if let Some(waiter) = self.waiter {
            // The caller may have timed out already
            let _ = waiter.send(outcome);
        }
        self.filter
    }
}

/// SUBSCRIBE requests awaiting their SUBACK.
///
/// rumqttc assigns packet ids only when it writes the request, in the order
/// requests were queued. Entries therefore wait in `unsent` until the
/// matching `Outgoing::Subscribe(pkid)` event and move to `in_flight` keyed
/// by that id. Callers must queue an entry and hand the request to the
/// client under the same lock so both orders agree.
#[derive(Debug, Default)]
pub struct SubackTracker {
    unsent: VecDeque<PendingSubscribe>,
    in_flight: VecDeque<(u16, PendingSubscribe)>,
}

impl SubackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request about to be queued. `None` for requests nobody awaits.
    pub fn queue(&mut self, filter: &str, waiter: Option<oneshot::Sender<SubscribeOutcome>>) {
        self.unsent.push_back(PendingSubscribe {
            filter: filter.to_string(),
            waiter,
        });
    }

    /// Forget the last queued entry when the client refused the request
    pub fn cancel_last(&mut self) {
        self.unsent.pop_back();
    }

    /// The oldest unsent request went out with `packet_id`
    pub fn sent(&mut self, packet_id: u16) {
        match self.unsent.pop_front() {
            Some(pending) => self.in_flight.push_back((packet_id, pending)),
            None => debug!(packet_id, "SUBSCRIBE sent without a tracked request"),
        }
    }

    /// Resolve the request sent with `packet_id`. Returns its filter.
    pub fn acknowledged(&mut self, packet_id: u16, outcome: SubscribeOutcome) -> Option<String> {
        let index = self
            .in_flight
            .iter()
            .position(|(id, _)| *id == packet_id)?;
        let (_, pending) = self.in_flight.remove(index)?;
        Some(pending.resolve(outcome))
    }

    /// Fail the oldest in-flight request. A refusal surfaces as an event loop
    /// error without a packet id, and brokers acknowledge in order.
    pub fn reject_oldest(&mut self, reason: &str) -> Option<String> {
        let (_, pending) = self.in_flight.pop_front()?;
        Some(pending.resolve(Err(reason.to_string())))
    }

    /// The session is gone: in-flight requests will never be acknowledged.
    /// Unsent requests stay queued; rumqttc sends them after reconnecting.
    pub fn connection_lost(&mut self, reason: &str) {
        for (_, pending) in self.in_flight.drain(..) {
            pending.resolve(Err(reason.to_string()));
        }
    }

    /// Fail everything; the event loop has stopped for good
    pub fn close(&mut self, reason: &str) {
        self.connection_lost(reason);
        for pending in self.unsent.drain(..) {
            pending.resolve(Err(reason.to_string()));
        }
    }

    /// Requests not yet acknowledged
    pub fn pending(&self) -> usize {
        self.unsent.len() + self.in_flight.len()
    }
}

/// Filter → handler table for one connection
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    routes: Vec<(String, mpsc::Sender<InboundMessage>)>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the same filter
    pub fn add(&mut self, filter: &str, handler: mpsc::Sender<InboundMessage>) {
        self.routes.retain(|(existing, _)| existing != filter);
        self.routes.push((filter.to_string(), handler));
    }

    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|(existing, _)| existing != filter);
        self.routes.len() != before
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    pub fn filters(&self) -> Vec<String> {
        self.routes.iter().map(|(filter, _)| filter.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Deliver to every matching handler without blocking the event loop.
    /// Returns the number of handlers that accepted the message.
    pub fn dispatch(&self, topic: &str, payload: &Bytes) -> usize {
        let mut delivered = 0;
        for (filter, handler) in &self.routes {
            if !topic_matches(filter, topic) {
                continue;
            }
            match handler.try_send(InboundMessage::new(topic, payload.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(filter = %filter, topic = %topic, "Delivery queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(filter = %filter, "Handler closed, skipping delivery");
                }
            }
        }
        if delivered == 0 {
            debug!(topic = %topic, "No subscription accepted message");
        }
        delivered
    }
}
