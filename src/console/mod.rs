//! Wires the relay connection, fleet store, recorder and dispatcher into one
//! operator console.

pub mod commands;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;

use crate::config::{self, Config, EndpointConfig};
use crate::dispatcher::CommandDispatcher;
use crate::fleet::FleetStore;
use crate::protocol::CommandSchema;
use crate::recording::{Exporter, FileExporter, RecordingManager, SessionScope};
use crate::relay::{ConnectionManager, Connector, EndpointConnector};
use crate::wind::{self, WindVector};

pub use commands::{OperatorCommand, Reply};

#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    pub endpoints: Vec<EndpointConfig>,
    pub schema: CommandSchema,
    pub period: Duration,
    pub record_on_connect: bool,
}

impl ConsoleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            schema: config.dispatcher.schema,
            period: config.dispatcher.period(),
            record_on_connect: config.recording.record_on_connect,
        }
    }
}

pub struct Console {
    pub connection: Arc<ConnectionManager>,
    pub fleet: Arc<FleetStore>,
    pub recorder: Arc<RecordingManager>,
    pub dispatcher: Arc<CommandDispatcher>,
    settings: ConsoleSettings,
}

impl Console {
    pub fn new(
        connector: Arc<dyn Connector>,
        exporter: Arc<dyn Exporter>,
        settings: ConsoleSettings,
    ) -> Self {
        let connection = ConnectionManager::new(connector);
        let fleet = Arc::new(FleetStore::new());
        let recorder = Arc::new(RecordingManager::new(exporter));
        let dispatcher = Arc::new(CommandDispatcher::new(
            connection.clone(),
            settings.schema,
            settings.period,
        ));

        connection.register(&fleet);
        connection.register(&recorder);
        connection.register(&dispatcher);

        Self {
            connection,
            fleet,
            recorder,
            dispatcher,
            settings,
        }
    }

    pub fn from_config(config: &Config, client_name: &str) -> Result<Self> {
        let exporter = FileExporter::new(
            config.recording.export_dir()?,
            config.recording.format,
        );
        Ok(Self::new(
            EndpointConnector::shared(client_name),
            Arc::new(exporter),
            ConsoleSettings::from_config(config),
        ))
    }

    pub fn settings(&self) -> &ConsoleSettings {
        &self.settings
    }

    /// Resolves a label or raw URL to an endpoint string. No key means the
    /// first configured endpoint.
    pub fn resolve_endpoint(&self, key: Option<&str>) -> Option<String> {
        let endpoints = &self.settings.endpoints;
        match key {
            None => config::default_endpoint(endpoints).map(|e| e.value.clone()),
            Some(key) => config::find_endpoint(endpoints, key)
                .map(|e| e.value.clone())
                .or_else(|| key.contains("://").then(|| key.to_string())),
        }
    }

    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        self.connection.connect(endpoint).await?;
        if self.settings.record_on_connect {
            self.recorder.start_session(SessionScope::All);
        }
        Ok(())
    }

    /// Fails instead of building a grid past [`wind::MAX_GRID_POINTS`].
    pub fn wind_field(&self, grid_step: f64) -> Result<Vec<WindVector>> {
        if !grid_step.is_finite() || grid_step <= 0.0 {
            bail!("Grid step must be a positive number of degrees");
        }
        let samples = wind::samples_from_fleet(&self.fleet.snapshot()?);
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        if wind::grid_shape(&samples, grid_step).is_none() {
            bail!(
                "Grid step {} over the current fleet exceeds {} points",
                grid_step,
                wind::MAX_GRID_POINTS
            );
        }
        Ok(wind::interpolate(&samples, grid_step))
    }

    /// Zeroes held controls, exports every open session, then disconnects.
    pub fn shutdown(&self) -> Vec<PathBuf> {
        let released = self.dispatcher.release_all();
        if released > 0 {
            info!("Released {} held control(s)", released);
        }
        let exported = self.recorder.stop_all();
        self.connection.disconnect();
        exported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{MemoryConnector, MemoryRelay};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn console(record_on_connect: bool) -> (Console, UnboundedReceiver<MemoryRelay>) {
        let (connector, relays) = MemoryConnector::new();
        let dir = std::env::temp_dir().join("sunny-console-tests");
        let settings = ConsoleSettings {
            endpoints: vec![
                EndpointConfig {
                    label: "Local".to_string(),
                    value: "mem://local".to_string(),
                },
                EndpointConfig {
                    label: "Marina".to_string(),
                    value: "mem://marina".to_string(),
                },
            ],
            schema: CommandSchema::Compact,
            period: Duration::from_millis(500),
            record_on_connect,
        };
        (
            Console::new(
                Arc::new(connector),
                Arc::new(FileExporter::new(dir, Default::default())),
                settings,
            ),
            relays,
        )
    }

    #[test]
    fn endpoints_resolve_by_label_value_or_url() {
        let (console, _relays) = console(false);
        assert_eq!(console.resolve_endpoint(None).as_deref(), Some("mem://local"));
        assert_eq!(
            console.resolve_endpoint(Some("Marina")).as_deref(),
            Some("mem://marina")
        );
        assert_eq!(
            console.resolve_endpoint(Some("ws://10.0.0.9:5000")).as_deref(),
            Some("ws://10.0.0.9:5000")
        );
        assert!(console.resolve_endpoint(Some("nowhere")).is_none());
    }

    #[tokio::test]
    async fn wind_field_rejects_oversized_grids() {
        let (console, mut relays) = console(false);
        console.connect("mem://local").await.unwrap();
        let relay = relays.recv().await.unwrap();
        relay
            .push(
                crate::protocol::EVENT_BOAT_LOCATIONS,
                serde_json::json!([
                    {"boat_id": "A", "data": {"latitude": 37.0, "longitude": -122.0, "u": 1.0, "v": 0.0}},
                    {"boat_id": "B", "data": {"latitude": 38.0, "longitude": -121.0, "u": 0.0, "v": 1.0}}
                ]),
            )
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while console.fleet.len() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(console.wind_field(1e-12).is_err());
        assert!(console.wind_field(-1.0).is_err());
        assert_eq!(console.wind_field(0.5).unwrap().len(), 9);
    }

    #[tokio::test]
    async fn record_on_connect_opens_a_fleet_session() {
        let (console, _relays) = console(true);
        console.connect("mem://local").await.unwrap();
        assert!(console.recorder.is_recording(&SessionScope::All));

        assert!(console.shutdown().is_empty());
        assert!(!console.connection.is_connected());
        assert!(!console.recorder.is_recording(&SessionScope::All));
    }
}
