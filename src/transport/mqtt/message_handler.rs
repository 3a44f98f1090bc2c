//! Pure routing of rumqttc events and forwarding of publishes to the sink
//!
//! Routing decisions are pure functions over [`Event`]; the only impure
//! piece is [`MessageForwarder`], which hands a message to the registered
//! delivery callback.

use crate::transport::{Message, MessageSink};
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use tracing::{debug, warn};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    /// Broker answered the connect with a refusal code
    ConnectionRefused(String),
    /// Message received on a subscribed topic
    MessageReceived(Message),
    /// Every requested filter was granted
    SubscriptionConfirmed,
    /// At least one requested filter was rejected
    SubscriptionRejected(String),
    /// Broker sent a Disconnect
    Disconnected,
    /// Our own Disconnect went out on the wire
    DisconnectSent,
    /// PingResp, PubAck and friends
    InfrastructureEvent(String),
    /// Other outgoing traffic
    OutgoingEvent,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route a rumqttc event (pure function)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match &connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(format!("{code:?}")),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(Message::new(
                    publish.topic.clone(),
                    publish.payload.clone(),
                    publish.qos,
                )),
                Packet::SubAck(suback) => {
                    match Self::validate_subscription_success(&suback.return_codes) {
                        Ok(()) => EventRoute::SubscriptionConfirmed,
                        Err(reason) => EventRoute::SubscriptionRejected(reason),
                    }
                }
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck return codes (pure function)
    pub fn validate_subscription_success(return_codes: &[SubscribeReasonCode]) -> Result<(), String> {
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Hands received messages to the delivery callback registered at subscribe
#[derive(Default)]
pub struct MessageForwarder {
    sink: Option<MessageSink>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sink(&mut self, sink: MessageSink) {
        self.sink = Some(sink);
    }

    /// Drop the callback; later messages are discarded
    pub fn clear(&mut self) {
        self.sink = None;
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Forward `message` to the sink. Returns false when none is registered.
    pub fn forward(&self, message: Message) -> bool {
        match &self.sink {
            Some(sink) => {
                debug!(topic = %message.topic, bytes = message.payload.len(), "Received MQTT message");
                sink(message);
                true
            }
            None => {
                warn!(topic = %message.topic, "Received MQTT message but no sink registered - message dropped");
                false
            }
        }
    }
}
