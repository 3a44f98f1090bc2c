//! MQTT sensor component
//!
//! Owns one broker connection at a time, feeds the bounded buffer from the
//! client's delivery callback and serves reads in two modes:
//!
//! - capture mode pops the oldest queued message (at-most-once delivery)
//! - snapshot mode returns the latest message without consuming anything
//!
//! Each configuration epoch is a *generation*. Reconfiguring stops the
//! current generation (closing its delivery gate first, so its callback can
//! no longer push) and spawns the connect/subscribe of the next one. The
//! buffer and the latest-message slot survive reconfiguration.

use crate::buffer::MessageBuffer;
use crate::config::{qos_to_level, ConnectionTuning, SensorConfig};
use crate::error::{SensorError, SensorResult};
use crate::payload::{decode, Payload};
use crate::transport::mqtt::MqttClientFactory;
use crate::transport::{
    BrokerClient, BrokerFactory, ConnectionState, Message, MessageSink,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Key in the `extra` map that marks a read as an automated capture
pub const FROM_DATA_MANAGEMENT: &str = "fromDataManagement";

/// How a read consumes the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Pop the oldest queued message
    Capture,
    /// Peek the most recently received message
    Snapshot,
}

impl ReadMode {
    pub fn from_capture_flag(is_capture: bool) -> Self {
        if is_capture {
            ReadMode::Capture
        } else {
            ReadMode::Snapshot
        }
    }

    /// Capture mode when `extra["fromDataManagement"]` is `true`
    pub fn from_extra(extra: &Map<String, Value>) -> Self {
        Self::from_capture_flag(extra.get(FROM_DATA_MANAGEMENT) == Some(&Value::Bool(true)))
    }
}

/// A decoded message as handed to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub payload: Payload,
    pub qos: u8,
    pub topic: String,
}

impl Reading {
    fn decode(message: &Message, config: &SensorConfig) -> SensorResult<Self> {
        Ok(Reading {
            payload: decode(config.payload_format(), &message.payload)?,
            qos: qos_to_level(message.qos),
            topic: message.topic.clone(),
        })
    }
}

/// Result of a successful read call
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Reading(Reading),
    /// Capture mode found nothing usable in the queue
    NothingToCapture,
    /// Snapshot mode: no message has ever arrived
    NoData,
}

impl ReadOutcome {
    pub fn reading(&self) -> Option<&Reading> {
        match self {
            ReadOutcome::Reading(reading) => Some(reading),
            _ => None,
        }
    }

    pub fn into_reading(self) -> Option<Reading> {
        match self {
            ReadOutcome::Reading(reading) => Some(reading),
            _ => None,
        }
    }
}

/// Resolves to the connect-phase outcome of one generation
#[derive(Debug)]
pub struct ConnectAttempt {
    generation: u64,
    outcome: oneshot::Receiver<SensorResult<()>>,
}

impl ConnectAttempt {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for connect/subscribe to finish. A generation stopped before it
    /// got that far yields [`SensorError::ConnectAbandoned`].
    pub async fn outcome(self) -> SensorResult<()> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(SensorError::ConnectAbandoned))
    }
}

/// Admits deliveries until closed. Closing waits for in-flight deliveries,
/// so nothing passes the gate once `close` returns.
#[derive(Debug)]
struct DeliveryGate {
    open: RwLock<bool>,
}

impl DeliveryGate {
    fn new() -> Self {
        Self {
            open: RwLock::new(true),
        }
    }

    fn deliver(&self, push: impl FnOnce()) -> bool {
        let open = self.open.read().unwrap_or_else(PoisonError::into_inner);
        if *open {
            push();
        }
        *open
    }

    fn close(&self) {
        *self.open.write().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Delivery callback for one generation: a single buffer push behind the gate
fn buffer_sink(gate: Arc<DeliveryGate>, buffer: Arc<MessageBuffer>) -> MessageSink {
    Arc::new(move |message: Message| {
        let topic = message.topic.clone();
        if gate.deliver(|| {
            if let Some(evicted) = buffer.push(message) {
                debug!(topic = %evicted.topic, "Queue full, evicted oldest message");
            }
        }) {
            debug!(topic = %topic, "Buffered message");
        } else {
            debug!(topic = %topic, "Dropped message delivered after generation stopped");
        }
    })
}

/// One configuration epoch's connection and callback registration
struct Generation<C> {
    id: u64,
    gate: Arc<DeliveryGate>,
    client: Arc<Mutex<Option<C>>>,
    task: JoinHandle<()>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<C: BrokerClient> Generation<C> {
    async fn state(&self) -> ConnectionState {
        match self.client.lock().await.as_ref() {
            Some(client) => client.connection_state(),
            None => self.state_tx.borrow().clone(),
        }
    }

    /// Tear down: close the gate, abandon any in-flight connect, then
    /// disconnect the client within `grace`.
    async fn stop(self, grace: Duration) {
        self.gate.close();

        self.task.abort();
        if let Err(e) = self.task.await {
            if e.is_cancelled() {
                info!(generation = self.id, "Abandoned in-flight connection attempt");
            } else {
                warn!(generation = self.id, "Connection task ended with error: {}", e);
            }
        }

        if let Some(mut client) = self.client.lock().await.take() {
            client.disconnect(grace).await;
        }
        self.state_tx.send_modify(|state| {
            if !matches!(state, ConnectionState::Failed(_)) {
                *state = ConnectionState::Disconnected("Generation stopped".to_string());
            }
        });
        info!(generation = self.id, "Generation stopped");
    }
}

/// Single-topic MQTT ingestion component
pub struct MqttSensor<F: BrokerFactory = MqttClientFactory> {
    name: String,
    factory: Arc<F>,
    disconnect_grace: Duration,
    buffer: Arc<MessageBuffer>,
    config: RwLock<Arc<SensorConfig>>,
    generation: Mutex<Option<Generation<F::Client>>>,
    next_generation: AtomicU64,
}

impl MqttSensor<MqttClientFactory> {
    /// Create a sensor backed by rumqttc and start its first generation.
    ///
    /// Only an invalid configuration fails here; the connect outcome is
    /// reported through the returned [`ConnectAttempt`].
    pub async fn new(
        name: impl Into<String>,
        config: SensorConfig,
    ) -> SensorResult<(Self, ConnectAttempt)> {
        let tuning = ConnectionTuning::default();
        Self::with_factory(name, config, MqttClientFactory::new(tuning.clone()), &tuning).await
    }
}

impl<F: BrokerFactory> MqttSensor<F> {
    pub async fn with_factory(
        name: impl Into<String>,
        config: SensorConfig,
        factory: F,
        tuning: &ConnectionTuning,
    ) -> SensorResult<(Self, ConnectAttempt)> {
        config.validate()?;
        let sensor = MqttSensor {
            name: name.into(),
            factory: Arc::new(factory),
            disconnect_grace: tuning.disconnect_grace,
            buffer: Arc::new(MessageBuffer::new(config.queue_length)),
            config: RwLock::new(Arc::new(config.clone())),
            generation: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        };
        let attempt = sensor.reconfigure(config).await?;
        Ok((sensor, attempt))
    }

    /// Component name used in log fields
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration snapshot
    pub fn config(&self) -> Arc<SensorConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of queued, undelivered messages
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Identifier of the running generation, if any
    pub async fn current_generation(&self) -> Option<u64> {
        self.generation.lock().await.as_ref().map(|g| g.id)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match self.generation.lock().await.as_ref() {
            Some(generation) => generation.state().await,
            None => ConnectionState::Idle,
        }
    }

    /// Apply a new configuration.
    ///
    /// Validation failures leave the running generation and buffer untouched.
    /// Otherwise the old generation is stopped, the configuration swapped and
    /// a new generation spawned; the call does not wait for the broker.
    pub async fn reconfigure(&self, config: SensorConfig) -> SensorResult<ConnectAttempt> {
        if let Err(e) = config.validate() {
            error!(sensor = %self.name, "Rejected configuration: {}", e);
            return Err(e.into());
        }

        let mut current = self.generation.lock().await;
        if let Some(previous) = current.take() {
            previous.stop(self.disconnect_grace).await;
        }

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config.clone());
        let dropped = self.buffer.set_capacity(config.queue_length);
        if dropped > 0 {
            warn!(sensor = %self.name, dropped, "Queue shrunk, dropped oldest messages");
        }
        info!(
            sensor = %self.name,
            topic = %config.topic,
            host = %config.host,
            port = config.port,
            qos = config.qos,
            client_id = %config.client_id,
            msg_type = %config.payload_format(),
            q_length = config.queue_length,
            "Reconfigured mqtt client"
        );

        let (generation, attempt) = self.spawn_generation(config);
        *current = Some(generation);
        Ok(attempt)
    }

    fn spawn_generation(&self, config: SensorConfig) -> (Generation<F::Client>, ConnectAttempt) {
        let id = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(DeliveryGate::new());
        let slot = Arc::new(Mutex::new(None));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let span = crate::mqtt_span!(
            generation = id,
            topic = %config.topic,
            broker = %config.broker_address()
        );
        let task = tokio::spawn(
            run_generation(
                Arc::clone(&self.factory),
                config,
                buffer_sink(Arc::clone(&gate), Arc::clone(&self.buffer)),
                Arc::clone(&slot),
                state_tx.clone(),
                outcome_tx,
            )
            .instrument(span),
        );

        let generation = Generation {
            id,
            gate,
            client: slot,
            task,
            state_tx,
        };
        let attempt = ConnectAttempt {
            generation: id,
            outcome: outcome_rx,
        };
        (generation, attempt)
    }

    /// Stop the running generation. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(generation) = self.generation.lock().await.take() {
            generation.stop(self.disconnect_grace).await;
        }
        info!(sensor = %self.name, "Sensor closed");
    }

    /// Read one value. Never blocks on the broker; decoding happens after
    /// the message has left the buffer lock.
    pub fn read(&self, mode: ReadMode) -> SensorResult<ReadOutcome> {
        match mode {
            ReadMode::Capture => {
                let Some(message) = self.buffer.pop() else {
                    return Ok(ReadOutcome::NothingToCapture);
                };
                match Reading::decode(&message, &self.config()) {
                    Ok(reading) => Ok(ReadOutcome::Reading(reading)),
                    Err(e) => {
                        error!(sensor = %self.name, topic = %message.topic, "Discarding message: {}", e);
                        Ok(ReadOutcome::NothingToCapture)
                    }
                }
            }
            ReadMode::Snapshot => match self.buffer.peek_latest() {
                Some(message) => Ok(ReadOutcome::Reading(Reading::decode(
                    &message,
                    &self.config(),
                )?)),
                None => Ok(ReadOutcome::NoData),
            },
        }
    }

    /// Host framework entry point; the mode comes from `extra`
    pub fn readings(&self, extra: &Map<String, Value>) -> SensorResult<ReadOutcome> {
        self.read(ReadMode::from_extra(extra))
    }

    /// Extension commands are not supported
    pub async fn do_command(&self, _command: &Map<String, Value>) -> SensorResult<Map<String, Value>> {
        Err(SensorError::Unimplemented)
    }
}

impl<F: BrokerFactory> Drop for MqttSensor<F> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.get_mut().take() {
            generation.gate.close();
            generation.task.abort();
        }
    }
}

/// Connect and subscribe for one generation, then park the client in `slot`
async fn run_generation<F: BrokerFactory>(
    factory: Arc<F>,
    config: SensorConfig,
    sink: MessageSink,
    slot: Arc<Mutex<Option<F::Client>>>,
    state_tx: watch::Sender<ConnectionState>,
    outcome_tx: oneshot::Sender<SensorResult<()>>,
) {
    state_tx.send_replace(ConnectionState::Connecting);

    let mut client = match factory.create(&config) {
        Ok(client) => client,
        Err(e) => {
            error!("Error initializing mqtt client: {}", e);
            state_tx.send_replace(ConnectionState::Failed(e.to_string()));
            let _ = outcome_tx.send(Err(SensorError::Connection(e)));
            return;
        }
    };

    if let Err(e) = client.connect().await {
        error!("Error connecting mqtt client: {}", e);
        state_tx.send_replace(ConnectionState::Failed(e.to_string()));
        let _ = outcome_tx.send(Err(SensorError::Connection(e)));
        return;
    }
    state_tx.send_replace(ConnectionState::Connected);

    let outcome = match client
        .subscribe(&config.topic, config.qos_level(), sink)
        .await
    {
        Ok(()) => {
            info!("Subscribed to {}", config.topic);
            Ok(())
        }
        Err(e) => {
            error!("Subscription error: {}", e);
            Err(SensorError::from_transport(e))
        }
    };

    *slot.lock().await = Some(client);
    let _ = outcome_tx.send(outcome);
}
