//! Telemetry capture into scope-keyed sessions, exported when stopped.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::protocol::{Fields, InboundEvent, TelemetryDelta};
use crate::relay::RelayListener;
use crate::util::export_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionScope {
    All,
    Vehicle(String),
}

impl SessionScope {
    pub fn matches(&self, vehicle_id: &str) -> bool {
        match self {
            SessionScope::All => true,
            SessionScope::Vehicle(id) => id == vehicle_id,
        }
    }
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionScope::All => write!(f, "all"),
            SessionScope::Vehicle(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for SessionScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => bail!("Empty recording scope"),
            "all" => Ok(SessionScope::All),
            id => Ok(SessionScope::Vehicle(id.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// Writes a finished session somewhere and reports where.
pub trait Exporter: Send + Sync {
    fn export(&self, scope: &SessionScope, records: &[Value]) -> Result<PathBuf>;
}

pub struct FileExporter {
    dir: PathBuf,
    format: ExportFormat,
}

impl FileExporter {
    pub fn new(dir: impl Into<PathBuf>, format: ExportFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn file_name(&self, scope: &SessionScope, at: DateTime<Utc>) -> String {
        let scope: String = scope
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!(
            "boat_data_{}_{}.{}",
            scope,
            export_timestamp(at),
            self.format.extension()
        )
    }
}

impl Exporter for FileExporter {
    fn export(&self, scope: &SessionScope, records: &[Value]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.dir.join(self.file_name(scope, Utc::now()));
        let body = match self.format {
            ExportFormat::Json => serde_json::to_string_pretty(records)?,
            ExportFormat::Csv => to_csv(records),
        };
        write_file(&path, &body)?;
        Ok(path)
    }
}

fn write_file(path: &Path, body: &str) -> Result<()> {
    fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))
}

/// One level of flattening: `data.magnetic_field.x` becomes `magnetic_field_x`.
fn flatten(record: &Value) -> Vec<(String, Value)> {
    let mut row = Vec::new();
    if let Some(id) = record.get("boat_id") {
        row.push(("boat_id".to_string(), id.clone()));
    }
    if let Some(data) = record.get("data").and_then(Value::as_object) {
        for (key, value) in data {
            match value {
                Value::Object(nested) => {
                    for (sub, value) in nested {
                        row.push((format!("{}_{}", key, sub), value.clone()));
                    }
                }
                other => row.push((key.clone(), other.clone())),
            }
        }
    }
    row
}

fn csv_cell(value: Option<&Value>) -> String {
    let text = match value {
        None | Some(Value::Null) => return String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

pub fn to_csv(records: &[Value]) -> String {
    let rows: Vec<Vec<(String, Value)>> = records.iter().map(flatten).collect();
    let Some(first) = rows.first() else {
        return String::new();
    };
    let header: Vec<&str> = first.iter().map(|(key, _)| key.as_str()).collect();

    let mut out = header
        .iter()
        .map(|key| csv_cell(Some(&Value::String(key.to_string()))))
        .collect::<Vec<_>>()
        .join(",");
    out.push('\n');
    for row in &rows {
        let cells: Vec<String> = header
            .iter()
            .map(|key| csv_cell(row.iter().find(|(k, _)| k == key).map(|(_, v)| v)))
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

/// Owns the active sessions. At most one per scope.
pub struct RecordingManager {
    exporter: Arc<dyn Exporter>,
    sessions: Mutex<HashMap<SessionScope, Vec<Value>>>,
}

impl RecordingManager {
    pub fn new(exporter: Arc<dyn Exporter>) -> Self {
        Self {
            exporter,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false when `scope` was already recording.
    pub fn start_session(&self, scope: SessionScope) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&scope) {
            debug!("Recording for {} already active", scope);
            return false;
        }
        info!("Recording started for {}", scope);
        sessions.insert(scope, Vec::new());
        true
    }

    /// Ends `scope` and exports what it captured. `Ok(None)` when the scope
    /// was not recording or captured nothing.
    pub fn stop_session(&self, scope: &SessionScope) -> Result<Option<PathBuf>> {
        let records = self
            .sessions
            .lock()
            .map_err(|e| anyhow!("Lock error: {}", e))?
            .remove(scope);
        let Some(records) = records else {
            debug!("No active recording for {}", scope);
            return Ok(None);
        };
        if records.is_empty() {
            info!("Recording for {} stopped with nothing captured", scope);
            return Ok(None);
        }
        let path = match self.exporter.export(scope, &records) {
            Ok(path) => path,
            Err(e) => {
                // Keep the capture so the operator can retry the stop.
                let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
                let newer = sessions.insert(scope.clone(), records).unwrap_or_default();
                if let Some(records) = sessions.get_mut(scope) {
                    records.extend(newer);
                }
                return Err(e);
            }
        };
        info!(
            "Recording for {} exported {} event(s) to {}",
            scope,
            records.len(),
            path.display()
        );
        Ok(Some(path))
    }

    /// Stops every session, exporting each. Export failures are logged.
    pub fn stop_all(&self) -> Vec<PathBuf> {
        let mut exported = Vec::new();
        for scope in self.active_scopes() {
            match self.stop_session(&scope) {
                Ok(Some(path)) => exported.push(path),
                Ok(None) => {}
                Err(e) => error!("Failed to export recording for {}: {:#}", scope, e),
            }
        }
        exported
    }

    pub fn is_recording(&self, scope: &SessionScope) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(scope)
    }

    pub fn active_scopes(&self) -> Vec<SessionScope> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn captured(&self, scope: &SessionScope) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .map_or(0, Vec::len)
    }

    fn capture(&self, delta: &TelemetryDelta, received: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions.is_empty() {
            return;
        }
        let mut data: Fields = delta.fields.clone();
        data.insert("time_now".to_string(), Value::String(received.to_string()));
        let record = json!({ "boat_id": delta.vehicle_id, "data": data });
        for (scope, records) in sessions.iter_mut() {
            if scope.matches(&delta.vehicle_id) {
                records.push(record.clone());
            }
        }
    }
}

impl RelayListener for RecordingManager {
    fn on_event(&self, event: &InboundEvent) {
        let received = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        match event {
            InboundEvent::BoatData(delta) => self.capture(delta, &received),
            InboundEvent::BoatLocations(fleet) => {
                for delta in fleet {
                    self.capture(delta, &received);
                }
            }
            _ => {}
        }
    }
}
