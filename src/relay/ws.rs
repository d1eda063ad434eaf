use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{Connector, RelayLink};
use crate::protocol::Envelope;

/// WebSocket relay: one JSON envelope per text frame.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<RelayLink> {
        info!("Connecting to WebSocket relay {}", endpoint);
        let (socket, _) = tokio_tungstenite::connect_async(endpoint)
            .await
            .with_context(|| format!("Failed to connect to {}", endpoint))?;
        info!("WebSocket relay {} connected", endpoint);

        let (mut write, mut read) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let endpoint = endpoint.to_string();

        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => {
                        let Some(envelope) = outgoing else {
                            debug!("Closing WebSocket relay {}", endpoint);
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        };
                        let text = match envelope.to_text() {
                            Ok(text) => text,
                            Err(e) => {
                                error!("Dropping outbound {}: {}", envelope.event, e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            error!("WebSocket send to {} failed: {}", endpoint, e);
                            break;
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => match Envelope::from_text(&text) {
                                Ok(envelope) => {
                                    if inbound_tx.send(envelope).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("Discarding frame from {}: {}", endpoint, e),
                            },
                            Some(Ok(Message::Close(reason))) => {
                                info!("Relay {} closed the connection: {:?}", endpoint, reason);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("WebSocket relay {} error: {}", endpoint, e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("WebSocket driver for {} stopped", endpoint);
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            driver: Some(driver),
        })
    }
}
