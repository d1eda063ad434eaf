use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Connector, RelayLink};
use crate::protocol::{Envelope, EVENT_BOAT_DATA, EVENT_BOAT_LOCATIONS, EVENT_CALIBRATION_DATA};

pub const TOPIC_PREFIX: &str = "sunny/relay/";
const DEFAULT_PORT: u16 = 1883;
const INBOUND_EVENTS: [&str; 3] = [EVENT_BOAT_DATA, EVENT_BOAT_LOCATIONS, EVENT_CALIBRATION_DATA];

/// MQTT relay: each event is a topic under [`TOPIC_PREFIX`], the payload is
/// the envelope's `data`.
pub struct MqttConnector {
    name: String,
}

impl MqttConnector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn options(&self, endpoint: &str) -> Result<MqttOptions> {
        let url = Url::parse(endpoint).with_context(|| format!("Invalid MQTT endpoint {}", endpoint))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow!("MQTT endpoint {} has no host", endpoint))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let client_id = format!("{}_{}", self.name, uuid::Uuid::new_v4());

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(30))
            .set_clean_session(true);
        Ok(mqtt_options)
    }
}

pub fn topic_for(event: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, event)
}

pub fn envelope_from_publish(topic: &str, payload: &[u8]) -> Result<Envelope> {
    let event = topic
        .strip_prefix(TOPIC_PREFIX)
        .filter(|event| !event.is_empty())
        .ok_or_else(|| anyhow!("Topic {} is outside the relay namespace", topic))?;
    let data: Value = serde_json::from_slice(payload)
        .with_context(|| format!("Payload on {} is not JSON", topic))?;
    Ok(Envelope::new(event, data))
}

async fn await_connack(eventloop: &mut EventLoop, endpoint: &str) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("🔗 Connected to MQTT relay {}: {:?}", endpoint, ack);
                return Ok(());
            }
            Ok(event) => debug!("MQTT event before ConnAck: {:?}", event),
            Err(e) => bail!("Failed to connect to MQTT relay {}: {}", endpoint, e),
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn open(&self, endpoint: &str) -> Result<RelayLink> {
        info!("Connecting to MQTT relay {}", endpoint);
        let (client, mut eventloop) = AsyncClient::new(self.options(endpoint)?, 10);

        await_connack(&mut eventloop, endpoint).await?;
        for event in INBOUND_EVENTS {
            client
                .subscribe(topic_for(event), QoS::AtLeastOnce)
                .await
                .context("Failed to subscribe")?;
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let endpoint = endpoint.to_string();

        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => {
                        let Some(envelope) = outgoing else {
                            debug!("Closing MQTT relay {}", endpoint);
                            let _ = client.try_disconnect();
                            break;
                        };
                        let payload = envelope.data.to_string();
                        if let Err(e) = client.try_publish(
                            topic_for(&envelope.event),
                            QoS::AtLeastOnce,
                            false,
                            payload,
                        ) {
                            error!("Failed to publish {} to {}: {:?}", envelope.event, endpoint, e);
                        }
                    }
                    polled = eventloop.poll() => {
                        match polled {
                            Ok(Event::Incoming(Packet::Publish(p))) => {
                                debug!("📨 {} ({} bytes)", p.topic, p.payload.len());
                                match envelope_from_publish(&p.topic, &p.payload) {
                                    Ok(envelope) => {
                                        if inbound_tx.send(envelope).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!("Discarding MQTT message: {}", e),
                                }
                            }
                            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                                debug!("✅ Subscription confirmed: {:?}", ack);
                            }
                            Ok(Event::Incoming(Packet::Disconnect)) => {
                                info!("MQTT relay {} disconnected us", endpoint);
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!("❌ MQTT relay {} connection error: {:?}", endpoint, e);
                                break;
                            }
                        }
                    }
                }
            }
            debug!("MQTT driver for {} stopped", endpoint);
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            driver: Some(driver),
        })
    }
}
