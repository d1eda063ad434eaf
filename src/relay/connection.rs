use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{retire_driver, Connector, RelayLink};
use crate::protocol::{Envelope, InboundEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub endpoint: Option<String>,
}

impl ConnectionStatus {
    fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            endpoint: None,
        }
    }
}

/// In-core subscriber. Callbacks run synchronously on the task that caused
/// the change and must not call back into the [`ConnectionManager`].
pub trait RelayListener: Send + Sync {
    fn on_status(&self, _status: &ConnectionStatus) {}
    fn on_event(&self, _event: &InboundEvent) {}
}

#[derive(Default)]
struct Live {
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
    driver: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Live {
    fn teardown(&mut self) -> bool {
        let was_live = self.outbound.is_some();
        self.outbound = None;
        if let Some(driver) = self.driver.take() {
            retire_driver(driver);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        was_live
    }
}

/// Owns the single transport to the relay.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    live: Mutex<Live>,
    // Bumped by every connect/disconnect so late results from a superseded
    // attempt are ignored.
    generation: AtomicU64,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: broadcast::Sender<InboundEvent>,
    listeners: RwLock<Vec<Weak<dyn RelayListener>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::disconnected());
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            connector,
            live: Mutex::new(Live::default()),
            generation: AtomicU64::new(0),
            status_tx,
            events_tx,
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Registers an in-core listener. Only a weak reference is kept.
    pub fn register<L: RelayListener + 'static>(&self, listener: &Arc<L>) {
        let listener: Arc<dyn RelayListener> = listener.clone();
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(Arc::downgrade(&listener));
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<InboundEvent> {
        self.events_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status_tx.borrow().state == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> Option<String> {
        self.status_tx.borrow().endpoint.clone()
    }

    /// Tears down any live transport, then opens one to `endpoint`. A
    /// failure leaves the manager disconnected and is returned as-is.
    pub async fn connect(self: &Arc<Self>, endpoint: &str) -> Result<()> {
        self.disconnect();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(ConnectionState::Connecting, Some(endpoint));

        let link = match self.connector.open(endpoint).await {
            Ok(link) => link,
            Err(e) => {
                error!("Connection to {} failed: {:#}", endpoint, e);
                if self.is_current(generation) {
                    self.set_status(ConnectionState::Disconnected, None);
                }
                return Err(e);
            }
        };

        {
            // Checked under the lock so a concurrent disconnect either sees
            // this link or makes us drop it.
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_current(generation) {
                drop(live);
                link.close();
                bail!("Connection to {} was superseded", endpoint);
            }
            let RelayLink {
                outbound,
                inbound,
                driver,
            } = link;
            live.outbound = Some(outbound);
            live.driver = driver;
            live.pump = Some(self.spawn_pump(generation, inbound));
        }
        info!("Connected to relay {}", endpoint);
        self.set_status(ConnectionState::Connected, Some(endpoint));
        Ok(())
    }

    /// Closes the live transport, if any. Listeners are always told, so
    /// stale state is dropped even when already disconnected.
    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let was_live = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .teardown();
        if was_live {
            info!("Disconnected from relay");
        }
        self.set_status(ConnectionState::Disconnected, None);
    }

    /// Queues `envelope` on the live transport without waiting.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.is_connected() {
            bail!("Not connected to a relay");
        }
        let live = self
            .live
            .lock()
            .map_err(|e| anyhow!("Lock error: {}", e))?;
        let outbound = live
            .outbound
            .as_ref()
            .ok_or_else(|| anyhow!("Not connected to a relay"))?;
        debug!("Sending {}: {}", envelope.event, envelope.data);
        outbound
            .send(envelope)
            .map_err(|_| anyhow!("Relay transport is closed"))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn spawn_pump(
        self: &Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let event_name = envelope.event.clone();
                match InboundEvent::parse(envelope) {
                    Ok(event) => manager.dispatch(event),
                    Err(e) => warn!("Discarding malformed {}: {:#}", event_name, e),
                }
            }
            if let Some(manager) = manager.upgrade() {
                manager.on_link_lost(generation);
            }
        })
    }

    fn on_link_lost(&self, generation: u64) {
        {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_current(generation) {
                debug!("Ignoring loss of superseded link {}", generation);
                return;
            }
            warn!("Relay link dropped");
            // The pump is the caller; let it finish on its own.
            live.pump = None;
            live.teardown();
        }
        self.set_status(ConnectionState::Disconnected, None);
    }

    fn dispatch(&self, event: InboundEvent) {
        for listener in self.listeners() {
            listener.on_event(&event);
        }
        let _ = self.events_tx.send(event);
    }

    fn set_status(&self, state: ConnectionState, endpoint: Option<&str>) {
        let status = ConnectionStatus {
            state,
            endpoint: endpoint.map(str::to_string),
        };
        debug!("Connection status: {:?}", status);
        self.status_tx.send_replace(status.clone());
        for listener in self.listeners() {
            listener.on_status(&status);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn RelayListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.live
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .teardown();
    }
}
