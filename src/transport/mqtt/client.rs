//! Impure I/O operations for the MQTT client
//!
//! This module owns the rumqttc client and drives its event loop on a tokio
//! task. The event loop forwards every publish to the registered sink and
//! publishes connection state changes on a watch channel.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::{ConnectionTuning, SensorConfig};
use crate::transport::{BrokerClient, BrokerFactory, MessageSink};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Broker answer to the most recent subscribe request
#[derive(Debug, Clone, PartialEq)]
enum SubAckStatus {
    Pending,
    Granted,
    Rejected(String),
}

/// rumqttc-backed broker client for one configuration generation
///
/// The event loop is started by [`MqttClient::connect`] and never restarted:
/// a dropped connection ends the generation instead of reconnecting.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    broker: String,
    tuning: ConnectionTuning,
    event_loop_handle: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    suback_tx: watch::Sender<SubAckStatus>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
}

impl MqttClient {
    pub fn new(config: &SensorConfig, tuning: ConnectionTuning) -> Self {
        let mqtt_options = configure_mqtt_options(config, &tuning);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        let (suback_tx, _) = watch::channel(SubAckStatus::Pending);

        MqttClient {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            broker: config.broker_address(),
            tuning,
            event_loop_handle: None,
            state_tx,
            state_rx,
            shutdown_tx,
            suback_tx,
            message_forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
        }
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Wait until the event loop reports the outcome of the connect phase
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected | ConnectionState::Subscribed => return Ok(()),
                    ConnectionState::Failed(reason) | ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(reason.clone().into()));
                    }
                    ConnectionState::Idle | ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "State channel closed".to_string().into(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectTimeout),
        }
    }

    /// Wait for the broker's SubAck. A lost connection or a missing answer
    /// within `timeout` counts as failure.
    async fn wait_for_subscription_ack(
        mut suback_rx: watch::Receiver<SubAckStatus>,
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let ack = tokio::time::timeout(timeout, async {
            loop {
                let status = suback_rx.borrow_and_update().clone();
                match status {
                    SubAckStatus::Granted => return Ok(()),
                    SubAckStatus::Rejected(reason) => {
                        return Err(MqttError::SubscriptionFailed(reason.into()));
                    }
                    SubAckStatus::Pending => {}
                }

                let state = state_rx.borrow_and_update().clone();
                if state.is_terminal() {
                    return Err(MqttError::NotConnected { state });
                }

                tokio::select! {
                    changed = suback_rx.changed() => {
                        if changed.is_err() {
                            return Err(MqttError::SubscriptionFailed(
                                "SubAck channel closed".to_string().into(),
                            ));
                        }
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return Err(MqttError::ConnectionFailed(
                                "State channel closed".to_string().into(),
                            ));
                        }
                    }
                }
            }
        })
        .await;

        ack.unwrap_or_else(|_| {
            Err(MqttError::SubscriptionFailed(
                format!("no SubAck received within {timeout:?}").into(),
            ))
        })
    }

    /// Drive the rumqttc event loop until shutdown or a terminal event
    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
        suback_tx: watch::Sender<SubAckStatus>,
        message_forwarder: Arc<Mutex<MessageForwarder>>,
        broker: String,
    ) {
        info!(broker = %broker, "Starting MQTT event loop");
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }
                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::process_event_route(route, &state_tx, &suback_tx, &message_forwarder).await {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(broker = %broker, "MQTT event loop error: {}", e);
                            let reason = e.to_string();
                            state_tx.send_modify(|state| {
                                *state = if matches!(state, ConnectionState::Connecting) {
                                    ConnectionState::Failed(reason)
                                } else {
                                    ConnectionState::Disconnected(reason)
                                };
                            });
                            break;
                        }
                    }
                }
            }
        }
        info!(broker = %broker, "MQTT event loop stopped");
    }

    /// Apply a routed event. Returns true to keep polling.
    async fn process_event_route(
        route: EventRoute,
        state_tx: &watch::Sender<ConnectionState>,
        suback_tx: &watch::Sender<SubAckStatus>,
        message_forwarder: &Arc<Mutex<MessageForwarder>>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                info!("MQTT client connected successfully");
                let _ = state_tx.send(ConnectionState::Connected);
                true
            }
            EventRoute::ConnectionRefused(reason) => {
                error!("MQTT broker refused connection: {}", reason);
                let _ = state_tx.send(ConnectionState::Failed(reason));
                false
            }
            EventRoute::MessageReceived(message) => {
                message_forwarder.lock().await.forward(message);
                true
            }
            EventRoute::SubscriptionConfirmed => {
                info!("Subscription confirmed");
                let _ = state_tx.send(ConnectionState::Subscribed);
                suback_tx.send_replace(SubAckStatus::Granted);
                true
            }
            EventRoute::SubscriptionRejected(reason) => {
                // The connection stays up; nothing arrives until the next generation.
                error!("Subscription error: {}", reason);
                suback_tx.send_replace(SubAckStatus::Rejected(reason));
                true
            }
            EventRoute::Disconnected => {
                warn!("MQTT broker closed the connection");
                let _ = state_tx.send(ConnectionState::Disconnected(
                    "Broker sent disconnect".to_string(),
                ));
                false
            }
            EventRoute::DisconnectSent => {
                let _ = state_tx.send(ConnectionState::Disconnected(
                    "Client disconnected".to_string(),
                ));
                false
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Stop the event loop task and wait for it to finish
    async fn stop_event_loop(&mut self) {
        if let Some(handle) = self.event_loop_handle.take() {
            let _ = self.shutdown_tx.send(true);
            handle.abort();
            match handle.await {
                Err(e) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                _ => {}
            }
        }
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .take()
            .ok_or(MqttError::AlreadyStarted)?;

        let _ = self.state_tx.send(ConnectionState::Connecting);
        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            self.state_tx.clone(),
            self.shutdown_tx.subscribe(),
            self.suback_tx.clone(),
            Arc::clone(&self.message_forwarder),
            self.broker.clone(),
        ));
        self.event_loop_handle = Some(handle);

        let result =
            Self::wait_for_connection_confirmation(self.state_rx.clone(), self.tuning.connect_timeout)
                .await;
        if let Err(e) = &result {
            error!(broker = %self.broker, "MQTT connect failed: {}", e);
            self.stop_event_loop().await;
            self.state_tx.send_modify(|state| {
                if !state.is_terminal() {
                    *state = ConnectionState::Failed(e.to_string());
                }
            });
        }
        result
    }

    async fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
        sink: MessageSink,
    ) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !state.is_connected() {
            return Err(MqttError::NotConnected { state });
        }

        self.message_forwarder.lock().await.set_sink(sink);

        self.suback_tx.send_replace(SubAckStatus::Pending);
        let suback_rx = self.suback_tx.subscribe();

        info!("Subscribing to topic: {} ({:?})", topic, qos);
        self.client.subscribe(topic, qos).await.map_err(|e| {
            MqttError::SubscriptionFailed(format!("Failed to subscribe to {topic}: {e}").into())
        })?;

        Self::wait_for_subscription_ack(
            suback_rx,
            self.state_rx.clone(),
            self.tuning.connect_timeout,
        )
        .await
    }

    async fn disconnect(&mut self, grace: Duration) {
        let Some(mut handle) = self.event_loop_handle.take() else {
            return;
        };

        if self.connection_state().is_connected() {
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to queue MQTT disconnect: {}", e);
            }
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(_) => debug!("Event loop task shut down gracefully"),
                Err(_) => {
                    warn!("Event loop didn't shut down within {:?}, forcing abort", grace);
                    let _ = self.shutdown_tx.send(true);
                    handle.abort();
                    let _ = handle.await;
                }
            }
        } else {
            let _ = self.shutdown_tx.send(true);
            handle.abort();
            let _ = handle.await;
        }

        self.message_forwarder.lock().await.clear();
        self.state_tx.send_modify(|state| {
            if !state.is_terminal() {
                *state = ConnectionState::Disconnected("Client disconnected".to_string());
            }
        });
        info!(broker = %self.broker, "MQTT client disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    fn connection_state(&self) -> ConnectionState {
        MqttClient::connection_state(self)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Async disconnect is impossible here; make sure the event loop dies
        // with the client so an abandoned connect leaves nothing running.
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

/// Builds a fresh [`MqttClient`] per generation
#[derive(Debug, Clone, Default)]
pub struct MqttClientFactory {
    tuning: ConnectionTuning,
}

impl MqttClientFactory {
    pub fn new(tuning: ConnectionTuning) -> Self {
        Self { tuning }
    }
}

impl BrokerFactory for MqttClientFactory {
    type Client = MqttClient;

    fn create(&self, config: &SensorConfig) -> Result<Self::Client, MqttError> {
        Ok(MqttClient::new(config, self.tuning.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Message;

    fn unreachable_config() -> SensorConfig {
        let mut config = SensorConfig::test_config();
        // Reserved port on localhost; nothing listens there.
        config.port = 1;
        config
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(MqttError::ConnectTimeout)));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_failed() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Failed("NotAuthorized".to_string()));
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500)).await;
        let err = result.unwrap_err();
        assert!(matches!(err, MqttError::ConnectionFailed(_)));
        assert!(err.to_string().contains("NotAuthorized"));
    }

    #[tokio::test]
    async fn test_wait_for_subscription_ack_granted() {
        let (suback_tx, suback_rx) = watch::channel(SubAckStatus::Pending);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            suback_tx.send_replace(SubAckStatus::Granted);
            // Keep the sender alive until the waiter has seen the change.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let result =
            MqttClient::wait_for_subscription_ack(suback_rx, state_rx, Duration::from_millis(500)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_subscription_ack_rejected() {
        let (suback_tx, suback_rx) = watch::channel(SubAckStatus::Pending);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        suback_tx.send_replace(SubAckStatus::Rejected("filter 0 rejected".to_string()));

        let result =
            MqttClient::wait_for_subscription_ack(suback_rx, state_rx, Duration::from_millis(500)).await;
        let err = result.unwrap_err();
        assert!(matches!(err, MqttError::SubscriptionFailed(_)));
        assert!(err.to_string().contains("filter 0 rejected"));
    }

    #[tokio::test]
    async fn test_wait_for_subscription_ack_times_out() {
        let (_suback_tx, suback_rx) = watch::channel(SubAckStatus::Pending);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        let result =
            MqttClient::wait_for_subscription_ack(suback_rx, state_rx, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(MqttError::SubscriptionFailed(_))));
    }

    #[tokio::test]
    async fn test_wait_for_subscription_ack_connection_lost() {
        let (_suback_tx, suback_rx) = watch::channel(SubAckStatus::Pending);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("Broker sent disconnect".to_string()));
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let result =
            MqttClient::wait_for_subscription_ack(suback_rx, state_rx, Duration::from_millis(500)).await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_process_event_route_updates_state() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (suback_tx, suback_rx) = watch::channel(SubAckStatus::Pending);
        let forwarder = Arc::new(Mutex::new(MessageForwarder::new()));

        assert!(
            MqttClient::process_event_route(
                EventRoute::ConnectionAcknowledged,
                &state_tx,
                &suback_tx,
                &forwarder
            )
            .await
        );
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        assert!(
            MqttClient::process_event_route(
                EventRoute::SubscriptionRejected("denied".to_string()),
                &state_tx,
                &suback_tx,
                &forwarder
            )
            .await
        );
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
        assert_eq!(*suback_rx.borrow(), SubAckStatus::Rejected("denied".to_string()));

        assert!(
            MqttClient::process_event_route(
                EventRoute::SubscriptionConfirmed,
                &state_tx,
                &suback_tx,
                &forwarder
            )
            .await
        );
        assert_eq!(*state_rx.borrow(), ConnectionState::Subscribed);
        assert_eq!(*suback_rx.borrow(), SubAckStatus::Granted);

        assert!(
            !MqttClient::process_event_route(
                EventRoute::Disconnected,
                &state_tx,
                &suback_tx,
                &forwarder
            )
            .await
        );
        assert!(state_rx.borrow().is_terminal());
    }

    #[tokio::test]
    async fn test_process_event_route_forwards_messages() {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Subscribed);
        let (suback_tx, _suback_rx) = watch::channel(SubAckStatus::Pending);
        let forwarder = Arc::new(Mutex::new(MessageForwarder::new()));
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_received = Arc::clone(&received);
        forwarder
            .lock()
            .await
            .set_sink(Arc::new(move |message: Message| {
                sink_received.lock().unwrap().push(message);
            }));

        let message = Message::new("sensors/temp", "20", QoS::AtMostOnce);
        assert!(
            MqttClient::process_event_route(
                EventRoute::MessageReceived(message.clone()),
                &state_tx,
                &suback_tx,
                &forwarder
            )
            .await
        );
        assert_eq!(*received.lock().unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_new_client_is_idle() {
        let client = MqttClient::new(&SensorConfig::test_config(), ConnectionTuning::default());
        assert_eq!(client.connection_state(), ConnectionState::Idle);
        assert!(!BrokerClient::is_connected(&client));
    }

    #[tokio::test]
    async fn test_subscribe_without_connection_fails() {
        let mut client = MqttClient::new(&SensorConfig::test_config(), ConnectionTuning::default());
        let result = client
            .subscribe("sensors/temp", QoS::AtMostOnce, Arc::new(|_: Message| {}))
            .await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let mut client = MqttClient::new(&SensorConfig::test_config(), ConnectionTuning::default());
        client.disconnect(Duration::from_millis(50)).await;
        assert_eq!(client.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let tuning = ConnectionTuning {
            connect_timeout: Duration::from_secs(2),
            ..ConnectionTuning::default()
        };
        let mut client = MqttClient::new(&unreachable_config(), tuning);

        let result = client.connect().await;
        assert!(result.is_err());
        assert!(client.connection_state().is_terminal());

        let second = client.connect().await;
        assert!(matches!(second, Err(MqttError::AlreadyStarted)));
    }
}
