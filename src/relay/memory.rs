use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Connector, RelayLink};
use crate::protocol::Envelope;

/// In-process loopback relay. Each successful `open` hands the far end of
/// the link to whoever holds the receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    relays: mpsc::UnboundedSender<MemoryRelay>,
    unreachable: Mutex<HashSet<String>>,
}

/// The relay side of an in-process link.
pub struct MemoryRelay {
    pub endpoint: String,
    to_console: mpsc::UnboundedSender<Envelope>,
    from_console: mpsc::UnboundedReceiver<Envelope>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryRelay>) {
        let (relays, accepted) = mpsc::unbounded_channel();
        (
            Self {
                relays,
                unreachable: Mutex::new(HashSet::new()),
            },
            accepted,
        )
    }

    /// Makes future `open` calls for `endpoint` fail.
    pub fn set_unreachable(&self, endpoint: &str) {
        if let Ok(mut unreachable) = self.unreachable.lock() {
            unreachable.insert(endpoint.to_string());
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, endpoint: &str) -> Result<RelayLink> {
        let refused = self
            .unreachable
            .lock()
            .map_err(|e| anyhow!("Lock error: {}", e))?
            .contains(endpoint);
        if refused {
            bail!("Connection refused by {}", endpoint);
        }

        let (outbound, from_console) = mpsc::unbounded_channel();
        let (to_console, inbound) = mpsc::unbounded_channel();
        self.relays
            .send(MemoryRelay {
                endpoint: endpoint.to_string(),
                to_console,
                from_console,
            })
            .map_err(|_| anyhow!("No relay is accepting connections for {}", endpoint))?;

        Ok(RelayLink {
            outbound,
            inbound,
            driver: None,
        })
    }
}

impl MemoryRelay {
    pub fn push(&self, event: &str, data: Value) -> Result<()> {
        self.push_envelope(Envelope::new(event, data))
    }

    pub fn push_envelope(&self, envelope: Envelope) -> Result<()> {
        self.to_console
            .send(envelope)
            .map_err(|_| anyhow!("Console side of {} is closed", self.endpoint))
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.from_console.recv().await
    }

    /// Everything the console has sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut sent = Vec::new();
        while let Ok(envelope) = self.from_console.try_recv() {
            sent.push(envelope);
        }
        sent
    }

    /// True once the console dropped its side of the link.
    pub fn is_closed(&self) -> bool {
        self.from_console.is_closed()
    }
}
