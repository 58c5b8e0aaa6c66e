//! Bridge lifecycle and (re)configuration
//!
//! The controller owns the active source/target connections and the
//! subscription tasks. Reconfiguration is make-before-break: the new brokers
//! are connected and subscribed before the previous activation is torn down,
//! and the configuration snapshot is swapped in between.

use super::state::{ActiveConfiguration, ConfigurationState};
use super::subscription::SubscriptionTask;
use crate::bridge_span;
use crate::config::ForwardingConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::observability::metrics::metrics;
use crate::pipeline::{MessagePipeline, SUBSCRIPTION_FILTERS};
use crate::transport::{BrokerConnection, BrokerError, ConnectionRole, MessageBroker};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Time given to subscription tasks to drain after the source is closed
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BridgeState {
    Unconfigured,
    Active { generation: u64 },
    Reconfiguring { from: u64, to: u64 },
    Terminated,
}

impl BridgeState {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeState::Unconfigured => "unconfigured",
            BridgeState::Active { .. } => "active",
            BridgeState::Reconfiguring { .. } => "reconfiguring",
            BridgeState::Terminated => "terminated",
        }
    }

    /// Messages are flowing (including while a replacement is being set up)
    pub fn is_forwarding(&self) -> bool {
        matches!(
            self,
            BridgeState::Active { .. } | BridgeState::Reconfiguring { .. }
        )
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Active { generation } => write!(f, "active (generation {generation})"),
            BridgeState::Reconfiguring { from, to } => {
                write!(f, "reconfiguring ({from} -> {to})")
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Liveness of the connections of the current activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub source: bool,
    pub target: bool,
}

/// Status seen by the health server without knowing the broker type
pub trait BridgeProbe: Send + Sync {
    fn state(&self) -> BridgeState;

    /// `None` when unconfigured or while an activation is being replaced
    fn connection_status(&self) -> Option<ConnectionStatus>;
}

/// Connections and tasks of one accepted configuration
struct Activation<C: BrokerConnection> {
    generation: u64,
    source: Arc<C>,
    target: Arc<C>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct BridgeController<B: MessageBroker> {
    broker: B,
    config_state: Arc<ConfigurationState>,
    pipeline: MessagePipeline,
    channel_capacity: usize,
    activation: Mutex<Option<Activation<B::Connection>>>,
    state_tx: watch::Sender<BridgeState>,
    terminated: AtomicBool,
}

impl<B: MessageBroker> BridgeController<B> {
    pub fn new(broker: B, pipeline: MessagePipeline, channel_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(BridgeState::Unconfigured);
        metrics().set_bridge_state(BridgeState::Unconfigured.name());
        Self {
            broker,
            config_state: Arc::new(ConfigurationState::new()),
            pipeline,
            channel_capacity: channel_capacity.max(1),
            activation: Mutex::new(None),
            state_tx,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    pub fn current_configuration(&self) -> Option<Arc<ActiveConfiguration>> {
        self.config_state.snapshot()
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Bridge state changed");
        }
        metrics().set_bridge_state(state.name());
    }

    /// Replace the active configuration.
    ///
    /// Returns the generation assigned to this request. A request overtaken by
    /// a newer one before it could activate fails with
    /// [`BridgeError::Superseded`]; the newer request decides what is active.
    pub async fn apply_configuration(&self, forwarding: ForwardingConfig) -> BridgeResult<u64> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(BridgeError::Terminated);
        }
        forwarding.validate()?;

        let generation = self.config_state.reserve_generation();
        let span = bridge_span!(operation = "apply_configuration", generation);
        let result = self.activate(generation, forwarding).instrument(span).await;
        if matches!(result, Err(BridgeError::Config(_) | BridgeError::Connection(_))) {
            metrics().reconfiguration_failed();
        }
        result
    }

    async fn activate(&self, generation: u64, forwarding: ForwardingConfig) -> BridgeResult<u64> {
        let mut activation = self.activation.lock().await;
        if self.terminated.load(Ordering::SeqCst) {
            return Err(BridgeError::Terminated);
        }
        if self.config_state.is_superseded(generation) {
            let by = self.config_state.latest_reserved();
            info!(latest = by, "Configuration superseded before activation, skipping");
            return Err(BridgeError::Superseded { generation, by });
        }

        let config = ActiveConfiguration::new(generation, forwarding)?;
        let previous_generation = Option::as_ref(&*activation).map(|active| active.generation);
        let resting_state = match previous_generation {
            Some(from) => {
                self.set_state(BridgeState::Reconfiguring {
                    from,
                    to: generation,
                });
                BridgeState::Active { generation: from }
            }
            None => BridgeState::Unconfigured,
        };

        info!(
            source = %config.forwarding().source_broker,
            target = %config.forwarding().target_broker,
            namespace = %config.forwarding().topic_namespace,
            "Activating configuration"
        );

        let (source, target) = match self.connect_pair(config.forwarding()).await {
            Ok(pair) => pair,
            Err(e) => {
                self.set_state(resting_state);
                return Err(e.into());
            }
        };

        if self.config_state.is_superseded(generation) {
            info!("Configuration superseded while connecting, abandoning setup");
            close_quietly(source.as_ref(), ConnectionRole::Source).await;
            close_quietly(target.as_ref(), ConnectionRole::Target).await;
            self.set_state(resting_state);
            return Err(BridgeError::Superseded {
                generation,
                by: self.config_state.latest_reserved(),
            });
        }

        let previous_snapshot = self.config_state.install(config);
        let tasks = match self.subscribe_all(generation, &source, &target).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Subscribing failed, keeping previous configuration");
                self.config_state.restore(previous_snapshot);
                close_quietly(source.as_ref(), ConnectionRole::Source).await;
                close_quietly(target.as_ref(), ConnectionRole::Target).await;
                self.set_state(resting_state);
                return Err(e.into());
            }
        };

        let replaced = activation.replace(Activation {
            generation,
            source,
            target,
            tasks,
        });
        self.set_state(BridgeState::Active { generation });
        metrics().reconfigured(generation);
        metrics().set_connections(true, true);

        if let Some(previous) = replaced {
            self.teardown(previous).await;
        }

        info!(generation, "Configuration active");
        Ok(generation)
    }

    async fn connect_pair(
        &self,
        forwarding: &ForwardingConfig,
    ) -> Result<(Arc<B::Connection>, Arc<B::Connection>), BrokerError> {
        let source = match self
            .broker
            .connect(&forwarding.source_broker, ConnectionRole::Source)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                metrics().connection_failed();
                error!(broker = %forwarding.source_broker, error = %e, "Source broker unreachable");
                return Err(e);
            }
        };

        match self
            .broker
            .connect(&forwarding.target_broker, ConnectionRole::Target)
            .await
        {
            Ok(target) => Ok((Arc::new(source), Arc::new(target))),
            Err(e) => {
                metrics().connection_failed();
                error!(broker = %forwarding.target_broker, error = %e, "Target broker unreachable");
                close_quietly(&source, ConnectionRole::Source).await;
                Err(e)
            }
        }
    }

    async fn subscribe_all(
        &self,
        generation: u64,
        source: &Arc<B::Connection>,
        target: &Arc<B::Connection>,
    ) -> Result<Vec<JoinHandle<()>>, BrokerError> {
        let mut tasks = Vec::with_capacity(SUBSCRIPTION_FILTERS.len());

        for filter in SUBSCRIPTION_FILTERS {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            let task = SubscriptionTask::new(
                filter,
                generation,
                self.config_state.clone(),
                self.pipeline.clone(),
                target.clone(),
            );
            tasks.push(task.spawn(rx));

            if let Err(e) = source.subscribe(filter, tx).await {
                for task in &tasks {
                    task.abort();
                }
                return Err(e);
            }
            debug!(filter, generation, "Subscribed");
        }

        Ok(tasks)
    }

    /// Close the source first so tasks drain, then the target
    async fn teardown(&self, activation: Activation<B::Connection>) {
        let Activation {
            generation,
            source,
            target,
            tasks,
        } = activation;
        let span = bridge_span!(operation = "teardown", generation);

        async move {
            for filter in SUBSCRIPTION_FILTERS {
                if let Err(e) = source.unsubscribe(filter).await {
                    debug!(filter, error = %e, "Unsubscribe failed during teardown");
                }
            }
            close_quietly(source.as_ref(), ConnectionRole::Source).await;

            for mut task in tasks {
                if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
                    warn!("Subscription task did not drain in time, aborting");
                    task.abort();
                }
            }

            close_quietly(target.as_ref(), ConnectionRole::Target).await;
            info!("Previous activation released");
        }
        .instrument(span)
        .await
    }

    /// Stop forwarding and release both connections. Idempotent.
    pub async fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let span = bridge_span!(operation = "shutdown");
        async {
            let previous = self.activation.lock().await.take();
            self.config_state.clear();
            self.set_state(BridgeState::Terminated);
            metrics().set_generation(0);
            metrics().set_connections(false, false);

            if let Some(activation) = previous {
                self.teardown(activation).await;
            }
            info!("Bridge terminated");
        }
        .instrument(span)
        .await
    }
}

impl<B: MessageBroker> BridgeProbe for BridgeController<B> {
    fn state(&self) -> BridgeState {
        BridgeController::state(self)
    }

    fn connection_status(&self) -> Option<ConnectionStatus> {
        let guard = self.activation.try_lock().ok()?;
        let activation = Option::as_ref(&*guard)?;
        let status = ConnectionStatus {
            source: activation.source.is_connected(),
            target: activation.target.is_connected(),
        };
        metrics().set_connections(status.source, status.target);
        Some(status)
    }
}

async fn close_quietly<C: BrokerConnection>(connection: &C, role: ConnectionRole) {
    if let Err(e) = connection.disconnect().await {
        warn!(role = %role, error = %e, "Error while closing broker connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::testing::MockBroker;

    fn forwarding(source: &str, target: &str, gateway_id: &str, namespace: &str) -> ForwardingConfig {
        ForwardingConfig {
            source_broker: source.to_string(),
            target_broker: target.to_string(),
            gateway_id: gateway_id.to_string(),
            topic_namespace: namespace.to_string(),
        }
    }

    fn controller(broker: &MockBroker) -> BridgeController<MockBroker> {
        BridgeController::new(broker.clone(), MessagePipeline::default(), 16)
    }

    #[tokio::test]
    async fn test_first_activation_subscribes_fixed_filters() {
        let broker = MockBroker::new();
        let controller = controller(&broker);
        assert_eq!(controller.state(), BridgeState::Unconfigured);

        let generation = controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
            .await
            .unwrap();

        assert_eq!(generation, 1);
        assert_eq!(controller.state(), BridgeState::Active { generation: 1 });

        let source = broker.connections_to("tcp://a:1883");
        assert_eq!(source.len(), 1);
        assert_eq!(source[0].role(), ConnectionRole::Source);
        assert_eq!(
            source[0].subscriptions(),
            SUBSCRIPTION_FILTERS.iter().map(|f| f.to_string()).collect::<Vec<_>>()
        );
        assert_eq!(broker.connections_to("tcp://b:1883")[0].role(), ConnectionRole::Target);
    }

    #[tokio::test]
    async fn test_missing_field_keeps_state() {
        let broker = MockBroker::new();
        let controller = controller(&broker);

        let result = controller
            .apply_configuration(forwarding("tcp://a:1883", "", "0102", "GW1"))
            .await;

        assert!(matches!(
            result,
            Err(BridgeError::Config(ConfigError::MissingField("target_broker")))
        ));
        assert_eq!(controller.state(), BridgeState::Unconfigured);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_source() {
        let broker = MockBroker::new();
        broker.fail_connections_to("tcp://down:1883");
        let controller = controller(&broker);

        let result = controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://down:1883", "0102", "GW1"))
            .await;

        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert_eq!(controller.state(), BridgeState::Unconfigured);
        assert!(controller.current_configuration().is_none());
        assert!(broker.connections_to("tcp://a:1883").iter().all(|c| !c.is_connected()));
    }

    #[tokio::test]
    async fn test_failed_reconfiguration_keeps_previous_activation() {
        let broker = MockBroker::new();
        let controller = controller(&broker);
        controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
            .await
            .unwrap();

        broker.fail_connections_to("tcp://c:1883");
        let result = controller
            .apply_configuration(forwarding("tcp://c:1883", "tcp://b:1883", "0304", "GW2"))
            .await;

        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert_eq!(controller.state(), BridgeState::Active { generation: 1 });
        let current = controller.current_configuration().unwrap();
        assert_eq!(current.generation(), 1);
        assert_eq!(current.forwarding().topic_namespace, "GW1");
        assert!(broker.connections_to("tcp://a:1883")[0].is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_failure_restores_snapshot() {
        let broker = MockBroker::new();
        let controller = controller(&broker);
        controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
            .await
            .unwrap();

        broker.set_fail_subscribe(true);
        let result = controller
            .apply_configuration(forwarding("tcp://c:1883", "tcp://d:1883", "0304", "GW2"))
            .await;

        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert_eq!(controller.current_configuration().unwrap().generation(), 1);
        assert!(broker.connections_to("tcp://c:1883").iter().all(|c| !c.is_connected()));
        assert!(broker.connections_to("tcp://d:1883").iter().all(|c| !c.is_connected()));
        assert_eq!(controller.state(), BridgeState::Active { generation: 1 });
    }

    #[tokio::test]
    async fn test_reconfiguration_replaces_connections() {
        let broker = MockBroker::new();
        let controller = controller(&broker);
        controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
            .await
            .unwrap();
        let generation = controller
            .apply_configuration(forwarding("tcp://c:1883", "tcp://d:1883", "0304", "GW2"))
            .await
            .unwrap();

        assert_eq!(generation, 2);
        assert_eq!(controller.state(), BridgeState::Active { generation: 2 });
        assert!(!broker.connections_to("tcp://a:1883")[0].is_connected());
        assert!(!broker.connections_to("tcp://b:1883")[0].is_connected());
        assert!(broker.connections_to("tcp://c:1883")[0].is_connected());
        assert!(broker.connections_to("tcp://d:1883")[0].is_connected());
    }

    #[tokio::test]
    async fn test_state_watch_sees_reconfiguring() {
        let broker = MockBroker::new();
        let controller = Arc::new(controller(&broker));
        controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
            .await
            .unwrap();

        let mut states = controller.subscribe_state();
        broker.set_connect_delay(Some(Duration::from_millis(50)));
        let applying = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .apply_configuration(forwarding("tcp://c:1883", "tcp://d:1883", "0304", "GW2"))
                    .await
            })
        };

        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), BridgeState::Reconfiguring { from: 1, to: 2 });
        assert_eq!(applying.await.unwrap().unwrap(), 2);
        assert_eq!(controller.state(), BridgeState::Active { generation: 2 });
    }

    #[tokio::test]
    async fn test_superseded_request_is_skipped() {
        let broker = MockBroker::new();
        broker.set_connect_delay(Some(Duration::from_millis(50)));
        let controller = Arc::new(controller(&broker));

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = controller
            .apply_configuration(forwarding("tcp://c:1883", "tcp://d:1883", "0304", "GW2"))
            .await
            .unwrap();

        assert!(matches!(
            first.await.unwrap(),
            Err(BridgeError::Superseded {
                generation: 1,
                by: 2
            })
        ));
        assert_eq!(second, 2);
        let current = controller.current_configuration().unwrap();
        assert_eq!(current.forwarding().topic_namespace, "GW2");
        assert!(broker
            .connections_to("tcp://a:1883")
            .iter()
            .all(|c| !c.is_connected()));
    }

    #[tokio::test]
    async fn test_superseded_request_fails_when_newer_request_fails() {
        let broker = MockBroker::new();
        broker.set_connect_delay(Some(Duration::from_millis(50)));
        broker.fail_connections_to("tcp://down:1883");
        let controller = Arc::new(controller(&broker));

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = controller
            .apply_configuration(forwarding("tcp://down:1883", "tcp://d:1883", "0304", "GW2"))
            .await;

        assert!(matches!(second, Err(BridgeError::Connection(_))));
        assert!(matches!(
            first.await.unwrap(),
            Err(BridgeError::Superseded {
                generation: 1,
                by: 2
            })
        ));
        assert_eq!(controller.state(), BridgeState::Unconfigured);
        assert!(controller.current_configuration().is_none());
        assert_eq!(broker.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let broker = MockBroker::new();
        let controller = controller(&broker);
        controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
            .await
            .unwrap();

        controller.shutdown().await;
        controller.shutdown().await;

        assert_eq!(controller.state(), BridgeState::Terminated);
        assert!(controller.current_configuration().is_none());
        assert_eq!(broker.connected_count(), 0);

        let result = controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
            .await;
        assert!(matches!(result, Err(BridgeError::Terminated)));
    }

    #[tokio::test]
    async fn test_probe_reports_connections() {
        let broker = MockBroker::new();
        let controller = controller(&broker);
        assert_eq!(controller.connection_status(), None);

        controller
            .apply_configuration(forwarding("tcp://a:1883", "tcp://b:1883", "0102", "GW1"))
            .await
            .unwrap();
        assert_eq!(
            controller.connection_status(),
            Some(ConnectionStatus {
                source: true,
                target: true
            })
        );
    }

    #[test]
    fn test_state_display_and_serialization() {
        assert_eq!(BridgeState::Unconfigured.to_string(), "unconfigured");
        assert_eq!(
            BridgeState::Reconfiguring { from: 1, to: 2 }.to_string(),
            "reconfiguring (1 -> 2)"
        );
        let json = serde_json::to_value(BridgeState::Active { generation: 4 }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "active", "generation": 4}));
        assert!(BridgeState::Reconfiguring { from: 1, to: 2 }.is_forwarding());
        assert!(!BridgeState::Terminated.is_forwarding());
    }
}
