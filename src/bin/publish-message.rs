//! Test message publisher
//!
//! Publishes one or more messages to a topic so a running sensor has
//! something to read.
//!
//! ## Usage
//!
//! ```bash
//! # One JSON reading
//! publish-message --topic sensors/temperature --message '{"celsius": 21.5}'
//!
//! # A burst of ten numbered messages, {n} is replaced by the index
//! publish-message --topic sensors/temperature --message '{"seq": {n}}' --count 10
//!
//! # Remote broker, QoS 2
//! publish-message --host broker.local --port 1884 --qos 2 \
//!   --topic sensors/humidity --message "42"
//! ```

use clap::Parser;
use mqttsensor::config::qos_from_level;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet};
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "publish-message",
    about = "Publish test messages to an MQTT topic",
    long_about = "Publishes one or more messages to an MQTT topic.\nUseful for feeding a running mqttsensor."
)]
struct Args {
    /// Topic to publish to
    #[arg(long, required = true)]
    topic: String,

    /// Message body; `{n}` is replaced by the message index
    #[arg(long, required = true)]
    message: String,

    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    port: u16,

    /// Publish QoS (0, 1 or 2)
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: u8,

    /// Number of messages to publish
    #[arg(long, default_value = "1")]
    count: u32,

    /// Delay between messages in milliseconds
    #[arg(long, default_value = "0")]
    interval_ms: u64,

    /// Set the retain flag on every message
    #[arg(long)]
    retain: bool,
}

fn render_message(template: &str, index: u32) -> String {
    template.replace("{n}", &index.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let client_id = format!("publish-message-{}", Uuid::new_v4().simple());
    let mut mqttoptions = MqttOptions::new(client_id, &args.host, args.port);
    mqttoptions.set_keep_alive(Duration::from_secs(60));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, args.count.max(1) as usize + 1);

    println!("Connecting to MQTT broker {}:{}...", args.host, args.port);

    let qos = qos_from_level(args.qos);
    let publisher = {
        let client = client.clone();
        let topic = args.topic.clone();
        let template = args.message.clone();
        let (count, retain, interval_ms) = (args.count, args.retain, args.interval_ms);
        tokio::spawn(async move {
            for index in 0..count {
                let payload = render_message(&template, index);
                if let Err(e) = client.publish(&topic, qos, retain, payload).await {
                    eprintln!("✗ Failed to queue message {index}: {e}");
                    break;
                }
                if interval_ms > 0 {
                    sleep(Duration::from_millis(interval_ms)).await;
                }
            }
            if let Err(e) = client.disconnect().await {
                eprintln!("✗ Failed to queue disconnect: {e}");
            }
        })
    };

    // Drive the event loop until our disconnect has gone out
    let mut published = 0u32;
    loop {
        match timeout(Duration::from_secs(10), eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => println!("✓ Connected"),
            Ok(Ok(Event::Outgoing(Outgoing::Publish(_)))) => published += 1,
            Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                eprintln!("✗ MQTT eventloop error: {e}");
                publisher.abort();
                std::process::exit(1);
            }
            Err(_) => {
                eprintln!("✗ Timed out waiting for the broker");
                publisher.abort();
                std::process::exit(1);
            }
        }
    }

    publisher.await?;
    println!("✓ Published {published} message(s) to {}", args.topic);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_message_substitutes_index() {
        assert_eq!(render_message(r#"{"seq": {n}}"#, 3), r#"{"seq": 3}"#);
        assert_eq!(render_message("plain", 7), "plain");
    }

    #[test]
    fn test_qos_argument_range_matches_library_mapping() {
        use rumqttc::QoS;

        let parsed = Args::try_parse_from([
            "publish-message", "--topic", "t", "--message", "m", "--qos", "2",
        ])
        .unwrap();
        assert_eq!(qos_from_level(parsed.qos), QoS::ExactlyOnce);

        let defaulted = Args::try_parse_from(["publish-message", "--topic", "t", "--message", "m"]).unwrap();
        assert_eq!(qos_from_level(defaulted.qos), QoS::AtLeastOnce);

        let out_of_range =
            Args::try_parse_from(["publish-message", "--topic", "t", "--message", "m", "--qos", "3"]);
        assert!(out_of_range.is_err());
    }
}
