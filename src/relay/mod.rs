//! Relay connectivity: one live transport at a time, behind a pluggable
//! [`Connector`].

pub mod connection;
pub mod memory;
pub mod mqtt;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::Envelope;

pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, RelayListener};
pub use memory::{MemoryConnector, MemoryRelay};
pub use mqtt::MqttConnector;
pub use ws::WsConnector;

/// An open transport. Dropping `outbound` asks the driver to close; when the
/// remote side goes away the driver drops its end of `inbound`.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    pub driver: Option<JoinHandle<()>>,
}

/// How long a driver may take to finish its close handshake.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

impl RelayLink {
    pub fn close(self) {
        drop(self.outbound);
        if let Some(driver) = self.driver {
            retire_driver(driver);
        }
    }
}

/// Lets a driver whose outbound sender is gone close the transport itself,
/// aborting it after [`CLOSE_GRACE`]. Aborts at once outside a runtime.
pub(crate) fn retire_driver(driver: JoinHandle<()>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        driver.abort();
        return;
    };
    let abort = driver.abort_handle();
    runtime.spawn(async move {
        if tokio::time::timeout(CLOSE_GRACE, driver).await.is_err() {
            debug!("Transport driver did not close within {:?}", CLOSE_GRACE);
            abort.abort();
        }
    });
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a transport to `endpoint`. Never retries; a failure is final
    /// until the operator asks again.
    async fn open(&self, endpoint: &str) -> Result<RelayLink>;
}

/// Picks the transport from the endpoint scheme.
pub struct EndpointConnector {
    ws: WsConnector,
    mqtt: MqttConnector,
}

impl EndpointConnector {
    pub fn new(client_name: &str) -> Self {
        Self {
            ws: WsConnector,
            mqtt: MqttConnector::new(client_name),
        }
    }

    pub fn shared(client_name: &str) -> Arc<dyn Connector> {
        Arc::new(Self::new(client_name))
    }
}

#[async_trait]
impl Connector for EndpointConnector {
    async fn open(&self, endpoint: &str) -> Result<RelayLink> {
        match endpoint.split_once("://").map(|(scheme, _)| scheme) {
            Some("ws") | Some("wss") => self.ws.open(endpoint).await,
            Some("mqtt") | Some("mqtts") | Some("tcp") => self.mqtt.open(endpoint).await,
            Some(other) => bail!("Unsupported relay scheme '{}' in {}", other, endpoint),
            None => bail!("Relay endpoint has no scheme: {}", endpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unknown_schemes() {
        let connector = EndpointConnector::new("sunny-test");
        let err = connector.open("http://localhost:80").await.err().unwrap();
        assert!(err.to_string().contains("Unsupported relay scheme"));
        assert!(connector.open("localhost:5000").await.is_err());
    }
}
