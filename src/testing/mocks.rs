//! Mock implementations for testing
//!
//! Provides an in-process broker double so the sensor lifecycle can be
//! exercised without a running MQTT broker.

use crate::config::SensorConfig;
use crate::transport::{BrokerClient, BrokerFactory, ConnectionState, Message, MessageSink, MqttError};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Callback registered by one mock client
struct RegisteredSink {
    client_id: usize,
    sink: MessageSink,
}

#[derive(Default)]
struct MockBrokerState {
    clients_created: usize,
    connects: Vec<String>,
    subscriptions: Vec<(String, QoS)>,
    disconnects: usize,
    sinks: Vec<RegisteredSink>,
    fail_connect: bool,
    fail_subscribe: bool,
    connect_delay: Option<Duration>,
}

/// Mock broker shared by every client the factory creates
///
/// Sinks stay registered after their client disconnects, which lets tests
/// replay a late delivery through a stale callback.
#[derive(Clone, Default)]
pub struct MockBrokerFactory {
    state: Arc<Mutex<MockBrokerState>>,
}

impl MockBrokerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_failure() -> Self {
        let factory = Self::new();
        factory.set_fail_connect(true);
        factory
    }

    pub fn with_subscribe_failure() -> Self {
        let factory = Self::new();
        factory.set_fail_subscribe(true);
        factory
    }

    /// Every connect waits `delay` before answering
    pub fn with_connect_delay(delay: Duration) -> Self {
        let factory = Self::new();
        factory.state().connect_delay = Some(delay);
        factory
    }

    fn state(&self) -> MutexGuard<'_, MockBrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state().fail_subscribe = fail;
    }

    /// Deliver a message through the most recently registered callback.
    /// Returns false when no callback has been registered yet.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> bool {
        let sink = self.state().sinks.last().map(|s| Arc::clone(&s.sink));
        match sink {
            Some(sink) => {
                sink(Message::new(topic, payload, qos));
                true
            }
            None => false,
        }
    }

    /// Deliver through the callback registered by the `client_id`-th client
    /// (0-based), even if that client has since disconnected.
    pub fn deliver_via(&self, client_id: usize, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> bool {
        let sink = self
            .state()
            .sinks
            .iter()
            .find(|s| s.client_id == client_id)
            .map(|s| Arc::clone(&s.sink));
        match sink {
            Some(sink) => {
                sink(Message::new(topic, payload, qos));
                true
            }
            None => false,
        }
    }

    pub fn clients_created(&self) -> usize {
        self.state().clients_created
    }

    /// `host:port` of every successful connect, in order
    pub fn connected_brokers(&self) -> Vec<String> {
        self.state().connects.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.state().subscriptions.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    pub fn sink_count(&self) -> usize {
        self.state().sinks.len()
    }
}

impl BrokerFactory for MockBrokerFactory {
    type Client = MockBrokerClient;

    fn create(&self, config: &SensorConfig) -> Result<Self::Client, MqttError> {
        let mut state = self.state();
        let id = state.clients_created;
        state.clients_created += 1;
        Ok(MockBrokerClient {
            id,
            broker: config.broker_address(),
            connection_state: ConnectionState::Idle,
            broker_state: Arc::clone(&self.state),
        })
    }
}

/// Client handed out by [`MockBrokerFactory`]
pub struct MockBrokerClient {
    id: usize,
    broker: String,
    connection_state: ConnectionState,
    broker_state: Arc<Mutex<MockBrokerState>>,
}

impl MockBrokerClient {
    fn broker_state(&self) -> MutexGuard<'_, MockBrokerState> {
        self.broker_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        self.connection_state = ConnectionState::Connecting;
        let delay = self.broker_state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.broker_state().fail_connect {
            self.connection_state = ConnectionState::Failed("Mock connection failure".to_string());
            return Err(MqttError::ConnectionFailed(
                "Mock connection failure".to_string().into(),
            ));
        }

        let broker = self.broker.clone();
        self.broker_state().connects.push(broker);
        self.connection_state = ConnectionState::Connected;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS, sink: MessageSink) -> Result<(), MqttError> {
        if !self.connection_state.is_connected() {
            return Err(MqttError::NotConnected {
                state: self.connection_state.clone(),
            });
        }

        let mut state = self.broker_state();
        if state.fail_subscribe {
            return Err(MqttError::SubscriptionFailed(
                "Mock subscription failure".to_string().into(),
            ));
        }
        state.subscriptions.push((topic.to_string(), qos));
        state.sinks.push(RegisteredSink {
            client_id: self.id,
            sink,
        });
        drop(state);

        self.connection_state = ConnectionState::Subscribed;
        Ok(())
    }

    async fn disconnect(&mut self, _grace: Duration) {
        if self.connection_state.is_connected() {
            self.broker_state().disconnects += 1;
            self.connection_state = ConnectionState::Disconnected("Client disconnected".to_string());
        }
    }

    fn is_connected(&self) -> bool {
        self.connection_state.is_connected()
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection_state.clone()
    }
}
