//! In-memory broker for testing
//!
//! [`MockBroker`] implements the broker capability without a network. Every
//! connection it hands out is recorded, so tests can inspect subscriptions
//! and published messages per address, inject messages as if the gateway had
//! published them, and make connects, subscribes or publishes fail.

use crate::transport::mqtt::SubscriptionRouter;
use crate::transport::{
    BrokerConnection, BrokerError, ConnectionRole, InboundMessage, MessageBroker,
    QualityOfService,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// A message recorded by a mock connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QualityOfService,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload parsed as JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct BrokerBehaviour {
    failing_addresses: Mutex<HashSet<String>>,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

#[derive(Debug, Default)]
struct MockBrokerInner {
    behaviour: Arc<BrokerBehaviour>,
    connections: Mutex<Vec<MockConnectionHandle>>,
    next_id: AtomicUsize,
}

/// Cloneable handle; clones share recorded state
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    inner: Arc<MockBrokerInner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse future connections to `address`
    pub fn fail_connections_to(&self, address: &str) {
        lock(&self.inner.behaviour.failing_addresses).insert(address.to_string());
    }

    pub fn allow_connections_to(&self, address: &str) {
        lock(&self.inner.behaviour.failing_addresses).remove(address);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner
            .behaviour
            .fail_subscribe
            .store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.behaviour.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every connect, to widen race windows in tests
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *lock(&self.inner.behaviour.connect_delay) = delay;
    }

    /// Every connection ever opened, in order
    pub fn connections(&self) -> Vec<MockConnectionHandle> {
        lock(&self.inner.connections).clone()
    }

    pub fn connections_to(&self, address: &str) -> Vec<MockConnectionHandle> {
        self.connections()
            .into_iter()
            .filter(|connection| connection.address() == address)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn connected_count(&self) -> usize {
        self.connections()
            .iter()
            .filter(|connection| connection.is_connected())
            .count()
    }

    /// Messages published on any connection to `address`
    pub fn published_to(&self, address: &str) -> Vec<PublishedMessage> {
        self.connections_to(address)
            .iter()
            .flat_map(|connection| connection.published())
            .collect()
    }

    /// Inject a message on every live connection to `address`.
    /// Returns the number of subscriptions that accepted it.
    pub fn deliver(&self, address: &str, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        self.connections_to(address)
            .iter()
            .filter(|connection| connection.is_connected())
            .map(|connection| connection.deliver(topic, payload.clone()))
            .sum()
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    type Connection = MockConnection;

    async fn connect(
        &self,
        address: &str,
        role: ConnectionRole,
    ) -> Result<Self::Connection, BrokerError> {
        let delay = *lock(&self.inner.behaviour.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.inner.behaviour.failing_addresses).contains(address) {
            return Err(BrokerError::ConnectionFailed {
                address: address.to_string(),
                reason: "connection refused (mock)".to_string(),
            });
        }

        let handle = MockConnectionHandle {
            shared: Arc::new(ConnectionShared {
                id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
                address: address.to_string(),
                role,
                connected: AtomicBool::new(true),
                router: Mutex::new(SubscriptionRouter::new()),
                subscriptions: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
            }),
        };
        lock(&self.inner.connections).push(handle.clone());

        Ok(MockConnection {
            handle,
            behaviour: self.inner.behaviour.clone(),
        })
    }
}

#[derive(Debug)]
struct ConnectionShared {
    id: usize,
    address: String,
    role: ConnectionRole,
    connected: AtomicBool,
    router: Mutex<SubscriptionRouter>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
}

/// Test-side view of a mock connection
#[derive(Debug, Clone)]
pub struct MockConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl MockConnectionHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn role(&self) -> ConnectionRole {
        self.shared.role
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Currently subscribed filters, in subscription order
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.shared.subscriptions).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.shared.published).clone()
    }

    /// Simulate a broker delivery on this connection
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        if !self.is_connected() {
            return 0;
        }
        lock(&self.shared.router).dispatch(topic, &payload.into())
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    pub fn restore_connection(&self) {
        self.shared.connected.store(true, Ordering::SeqCst);
    }
}

/// Connection returned by [`MockBroker::connect`]
#[derive(Debug)]
pub struct MockConnection {
    handle: MockConnectionHandle,
    behaviour: Arc<BrokerBehaviour>,
}

impl MockConnection {
    pub fn handle(&self) -> MockConnectionHandle {
        self.handle.clone()
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.handle.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected {
                state: "disconnected".to_string(),
            })
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn subscribe(
        &self,
        filter: &str,
        handler: mpsc::Sender<InboundMessage>,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        if self.behaviour.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::SubscriptionFailed {
                filter: filter.to_string(),
                reason: "not authorized (mock)".to_string(),
            });
        }

        lock(&self.handle.shared.router).add(filter, handler);
        let mut subscriptions = lock(&self.handle.shared.subscriptions);
        if !subscriptions.iter().any(|existing| existing == filter) {
            subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        lock(&self.handle.shared.router).remove(filter);
        lock(&self.handle.shared.subscriptions).retain(|existing| existing != filter);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        if self.behaviour.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: "broker unavailable (mock)".to_string(),
            });
        }

        lock(&self.handle.shared.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.handle.shared.connected.store(false, Ordering::SeqCst);
        lock(&self.handle.shared.router).clear();
        lock(&self.handle.shared.subscriptions).clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_records_connection() {
        let broker = MockBroker::new();
        let connection = broker
            .connect("tcp://a:1883", ConnectionRole::Source)
            .await
            .unwrap();

        assert!(connection.is_connected());
        assert_eq!(broker.connection_count(), 1);
        let handle = &broker.connections_to("tcp://a:1883")[0];
        assert_eq!(handle.role(), ConnectionRole::Source);
        assert_eq!(handle.id(), connection.handle().id());
    }

    #[tokio::test]
    async fn test_failing_address() {
        let broker = MockBroker::new();
        broker.fail_connections_to("tcp://down:1883");
        assert!(broker
            .connect("tcp://down:1883", ConnectionRole::Target)
            .await
            .is_err());

        broker.allow_connections_to("tcp://down:1883");
        assert!(broker
            .connect("tcp://down:1883", ConnectionRole::Target)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_deliver_reaches_matching_subscription() {
        let broker = MockBroker::new();
        let connection = broker
            .connect("tcp://a:1883", ConnectionRole::Source)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        connection.subscribe("gateway/+/event/up", tx).await.unwrap();

        assert_eq!(broker.deliver("tcp://a:1883", "gateway/x/event/up", "{}"), 1);
        assert_eq!(broker.deliver("tcp://a:1883", "gateway/x/event/stats", "{}"), 0);
        assert_eq!(rx.recv().await.unwrap().topic, "gateway/x/event/up");
    }

    #[tokio::test]
    async fn test_disconnect_drops_handlers() {
        let broker = MockBroker::new();
        let connection = broker
            .connect("tcp://a:1883", ConnectionRole::Source)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        connection.subscribe("gateway/#", tx).await.unwrap();

        connection.disconnect().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(broker.connections_to("tcp://a:1883")[0].subscriptions().is_empty());
        assert!(connection
            .publish("a/b", vec![], QualityOfService::AtMostOnce, false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_publish_recorded_and_failure_injection() {
        let broker = MockBroker::new();
        let connection = broker
            .connect("tcp://b:1883", ConnectionRole::Target)
            .await
            .unwrap();

        connection
            .publish("a/b", b"{\"k\":1}".to_vec(), QualityOfService::AtMostOnce, false)
            .await
            .unwrap();
        broker.set_fail_publish(true);
        assert!(matches!(
            connection
                .publish("a/b", vec![], QualityOfService::AtMostOnce, false)
                .await,
            Err(BrokerError::PublishFailed { .. })
        ));

        let published = broker.published_to("tcp://b:1883");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].json().unwrap()["k"], 1);
    }
}
