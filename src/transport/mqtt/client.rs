//! Impure I/O operations for MQTT connections
//!
//! Each [`MqttConnection`] owns one rumqttc event loop, driven by a
//! supervisor task that tracks connection state, re-subscribes after
//! reconnects and dispatches incoming publishes to subscription handlers.

use super::connection::{
    configure_mqtt_options, generate_client_id, parse_broker_address, to_mqtt_qos,
    ConnectionState, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler, SubackTracker, SubscriptionRouter};
use crate::config::MqttSection;
use crate::mqtt_span;
use crate::transport::{
    BrokerConnection, BrokerError, ConnectionRole, InboundMessage, MessageBroker,
    QualityOfService,
};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// rumqttc request queue depth
const REQUEST_CHANNEL_CAPACITY: usize = 32;
/// Grace period for the event loop to flush DISCONNECT
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type SharedSubacks = Arc<std::sync::Mutex<SubackTracker>>;

/// The tracker holds no invariant a panicking holder could break
fn lock_subacks(subacks: &SharedSubacks) -> MutexGuard<'_, SubackTracker> {
    subacks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates MQTT connections from the shared client settings
#[derive(Debug, Clone)]
pub struct MqttBroker {
    config: MqttSection,
    reconnect_config: ReconnectConfig,
}

impl MqttBroker {
    pub fn new(config: MqttSection) -> Self {
        let reconnect_config = ReconnectConfig::from_section(&config);
        Self {
            config,
            reconnect_config,
        }
    }
}

#[async_trait]
impl MessageBroker for MqttBroker {
    type Connection = MqttConnection;

    async fn connect(
        &self,
        address: &str,
        role: ConnectionRole,
    ) -> Result<Self::Connection, BrokerError> {
        MqttConnection::connect(address, role, &self.config, self.reconnect_config.clone())
            .instrument(mqtt_span!(operation = "connect", broker = %address, role = %role))
            .await
    }
}

/// One live MQTT session
pub struct MqttConnection {
    address: String,
    client: AsyncClient,
    router: Arc<RwLock<SubscriptionRouter>>,
    subacks: SharedSubacks,
    ack_timeout: Duration,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    /// Connect and return once the broker has sent CONNACK
    pub async fn connect(
        address: &str,
        role: ConnectionRole,
        config: &MqttSection,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, BrokerError> {
        let broker_address = parse_broker_address(address)?;
        let client_id = generate_client_id(&config.client_id_prefix, role);
        let mqtt_options = configure_mqtt_options(&broker_address, &client_id, config);

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = Arc::new(RwLock::new(SubscriptionRouter::new()));
        let subacks: SharedSubacks = Arc::new(std::sync::Mutex::new(SubackTracker::new()));
        let closing = Arc::new(AtomicBool::new(false));

        let supervisor = EventLoopSupervisor {
            address: broker_address.to_string(),
            client: client.clone(),
            router: router.clone(),
            subacks: subacks.clone(),
            state_tx,
            reconnect_config,
            closing: closing.clone(),
        };
        info!(
            broker = %broker_address,
            client_id = %client_id,
            role = %role,
            "Connecting to MQTT broker"
        );
        let handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx));

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        if let Err(reason) = Self::wait_for_connection_confirmation(state_rx.clone(), timeout).await
        {
            let _ = shutdown_tx.send(true);
            handle.abort();
            return Err(BrokerError::ConnectionFailed {
                address: address.to_string(),
                reason,
            });
        }

        Ok(Self {
            address: broker_address.to_string(),
            client,
            router,
            subacks,
            ack_timeout: timeout,
            state_rx,
            shutdown_tx,
            closing,
            event_loop_handle: Mutex::new(Some(handle)),
        })
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), String> {
        let confirmation = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(format!("Permanently disconnected: {reason}"));
                    }
                    ConnectionState::Connecting
                    | ConnectionState::Disconnected(_)
                    | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err("State channel closed".to_string());
                }
            }
        })
        .await;

        match confirmation {
            Ok(result) => result,
            Err(_) => {
                let last_state = state_rx.borrow().clone();
                Err(format!(
                    "ConnAck timeout after {}ms (last state: {last_state})",
                    timeout.as_millis()
                ))
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Queue a SUBSCRIBE and wait for the broker's SUBACK
    async fn request_subscription(&self, filter: &str) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut subacks = lock_subacks(&self.subacks);
            subacks.queue(filter, Some(tx));
            if let Err(e) = self.client.try_subscribe(filter, QoS::AtMostOnce) {
                subacks.cancel_last();
                return Err(e.to_string());
            }
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err("event loop stopped before SUBACK".to_string()),
            Err(_) => Err(format!(
                "no SUBACK within {}ms",
                self.ack_timeout.as_millis()
            )),
        }
    }

    fn require_connected(&self) -> Result<(), BrokerError> {
        let state = self.connection_state();
        if HealthMonitor::can_publish(&state) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected {
                state: state.to_string(),
            })
        }
    }
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    async fn subscribe(
        &self,
        filter: &str,
        handler: mpsc::Sender<InboundMessage>,
    ) -> Result<(), BrokerError> {
        self.require_connected()?;
        self.router.write().await.add(filter, handler);

        if let Err(reason) = self.request_subscription(filter).await {
            self.router.write().await.remove(filter);
            error!(broker = %self.address, filter = %filter, reason = %reason, "Subscription failed");
            return Err(BrokerError::SubscriptionFailed {
                filter: filter.to_string(),
                reason,
            });
        }

        debug!(broker = %self.address, filter = %filter, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.router.write().await.remove(filter);
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| BrokerError::SubscriptionFailed {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;
        debug!(broker = %self.address, filter = %filter, "Unsubscribed");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.require_connected()?;
        self.client
            .publish(topic, to_mqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the handlers ends the subscription tasks
        self.router.write().await.clear();

        if let Err(e) = self.client.disconnect().await {
            debug!(broker = %self.address, error = %e, "DISCONNECT not sent, event loop already stopped");
        }

        let handle = self.event_loop_handle.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(broker = %self.address, "Event loop shut down gracefully");
                }
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(broker = %self.address, "Event loop task ended with error: {}", e);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(broker = %self.address, "Event loop didn't shut down gracefully, aborting");
                    let _ = self.shutdown_tx.send(true);
                    handle.abort();
                }
            }
        }

        info!(broker = %self.address, "MQTT connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }
}

/// State owned by the event loop task
struct EventLoopSupervisor {
    address: String,
    client: AsyncClient,
    router: Arc<RwLock<SubscriptionRouter>>,
    subacks: SharedSubacks,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_config: ReconnectConfig,
    closing: Arc<AtomicBool>,
}

impl EventLoopSupervisor {
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(broker = %self.address, "Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event = event_loop.poll() => {
                    let keep_running = match event {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut reconnect_attempts, &shutdown_rx)
                                .await
                        }
                        Err(e) => {
                            self.handle_event_loop_error(e, &mut reconnect_attempts, &shutdown_rx)
                                .await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        self.router.write().await.clear();
        lock_subacks(&self.subacks).close("connection closed before SUBACK");
        self.set_state(HealthMonitor::determine_next_state(ConnectionEvent::Closed));
        debug!(broker = %self.address, "MQTT event loop stopped");
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.state_tx.borrow().clone();
        if old_state != new_state {
            HealthMonitor::log_state_transition(&self.address, &old_state, &new_state);
        }
        self.state_tx.send_replace(new_state);
    }

    /// Returns false when the event loop should stop
    async fn process_event_route(
        &self,
        route: EventRoute,
        reconnect_attempts: &mut u32,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::ConnAckReceived,
                ));
                *reconnect_attempts = 0;
                self.resubscribe().await;
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                tracing::trace!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                self.router.read().await.dispatch(&topic, &payload);
                true
            }
            EventRoute::Disconnected => {
                if self.closing.load(Ordering::SeqCst) {
                    return false;
                }
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::DisconnectedByBroker,
                ));
                self.schedule_reconnection(reconnect_attempts, shutdown_rx)
                    .await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                rejection,
            } => {
                let outcome = match &rejection {
                    Some(reason) => Err(reason.clone()),
                    None => Ok(()),
                };
                let filter = lock_subacks(&self.subacks).acknowledged(packet_id, outcome);
                match rejection {
                    Some(reason) => {
                        error!(broker = %self.address, packet_id, ?filter, reason = %reason, "Broker rejected subscription");
                    }
                    None => {
                        tracing::debug!(target: "mqtt_transport", "Subscription confirmed: {}", packet_id);
                    }
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::SubscribeSent { packet_id } => {
                lock_subacks(&self.subacks).sent(packet_id);
                true
            }
            EventRoute::DisconnectSent => !self.closing.load(Ordering::SeqCst),
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_event_loop_error(
        &self,
        error: rumqttc::v5::ConnectionError,
        reconnect_attempts: &mut u32,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return false;
        }

        if let Some(reason) = MessageHandler::subscription_rejection(&error) {
            let filter = lock_subacks(&self.subacks).reject_oldest(&reason);
            error!(broker = %self.address, ?filter, reason = %reason, "Broker rejected subscription");
            // Keep a refused filter out of the resubscribe after reconnecting
            if let Some(filter) = filter {
                self.router.write().await.remove(&filter);
            }
        }
        lock_subacks(&self.subacks).connection_lost("connection lost before SUBACK");

        self.set_state(HealthMonitor::determine_next_state(
            ConnectionEvent::NetworkError(error.to_string()),
        ));
        self.schedule_reconnection(reconnect_attempts, shutdown_rx)
            .await
    }

    /// Back off before the next poll; rumqttc reconnects on the following poll
    async fn schedule_reconnection(
        &self,
        reconnect_attempts: &mut u32,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &self.reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));
                debug!(broker = %self.address, attempt, delay_ms, "Scheduling reconnection");
                Self::interruptible_sleep(shutdown_rx.clone(), delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    *reconnect_attempts
                );
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::PermanentFailure(reason),
                ));
                false
            }
        }
    }

    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                changed.is_ok() && !*shutdown_rx.borrow()
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Clean sessions lose subscriptions on reconnect
    async fn resubscribe(&self) {
        let filters = self.router.read().await.filters();
        let mut subacks = lock_subacks(&self.subacks);
        for filter in filters {
            subacks.queue(&filter, None);
            // try_subscribe: the request queue is drained by this very task
            if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                subacks.cancel_last();
                error!(broker = %self.address, filter = %filter, "Failed to re-subscribe: {}", e);
            } else {
                debug!(broker = %self.address, filter = %filter, "Re-subscribed");
            }
        }
    }
}
