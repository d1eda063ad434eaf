use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub type Fields = Map<String, Value>;

pub const EVENT_GUI_DATA: &str = "gui_data";
pub const EVENT_BOAT_DATA: &str = "boat_data";
pub const EVENT_BOAT_LOCATIONS: &str = "boat_locations";
pub const EVENT_CALIBRATION_DATA: &str = "calibration_data";
pub const EVENT_REQUEST_CALIBRATION: &str = "request_calibration_data";
pub const EVENT_TEST_CALIBRATION: &str = "test_calibration";

/// Manual commands addressed to this id are fanned out by the relay.
pub const BROADCAST_ID: &str = "all";

/// A single relay frame: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize relay frame")
    }

    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Relay frame is not a JSON envelope")
    }
}

/// Field naming used for outbound `gui_data`. The relay has accepted both
/// over time; `Compact` matches the current boat firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSchema {
    #[default]
    Compact,
    Verbose,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMode {
    #[default]
    Manual,
    Autonomous,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManualCommand {
    pub vehicle_id: String,
    pub rudder: f64,
    pub throttle: f64,
    pub sail: f64,
}

impl ManualCommand {
    pub fn zeroed(vehicle_id: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            rudder: 0.0,
            throttle: 0.0,
            sail: 0.0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.rudder == 0.0 && self.throttle == 0.0 && self.sail == 0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoalCommand {
    pub vehicle_id: String,
    pub target_latitude: f64,
    pub target_longitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Manual(ManualCommand),
    Goal(GoalCommand),
}

impl Command {
    pub fn vehicle_id(&self) -> &str {
        match self {
            Command::Manual(cmd) => &cmd.vehicle_id,
            Command::Goal(cmd) => &cmd.vehicle_id,
        }
    }

    pub fn mode(&self) -> CommandMode {
        match self {
            Command::Manual(_) => CommandMode::Manual,
            Command::Goal(_) => CommandMode::Autonomous,
        }
    }

    pub fn to_envelope(&self, schema: CommandSchema) -> Envelope {
        let data = match (self, schema) {
            (Command::Manual(cmd), CommandSchema::Compact) => json!({
                "id": cmd.vehicle_id,
                "r": cmd.rudder,
                "th": cmd.throttle,
                "s": cmd.sail,
                "md": "manual",
            }),
            (Command::Manual(cmd), CommandSchema::Verbose) => json!({
                "boat_id": cmd.vehicle_id,
                "rudder_angle": cmd.rudder,
                "throttle": cmd.throttle,
                "sail_angle": cmd.sail,
                "command_mode": "manual",
            }),
            (Command::Goal(cmd), CommandSchema::Compact) => json!({
                "id": cmd.vehicle_id,
                "md": "auto",
                "tlat": cmd.target_latitude,
                "tlng": cmd.target_longitude,
            }),
            (Command::Goal(cmd), CommandSchema::Verbose) => json!({
                "boat_name": cmd.vehicle_id,
                "command_mode": "autonomous",
                "target_gps_latitude": cmd.target_latitude,
                "target_gps_longitude": cmd.target_longitude,
            }),
        };
        Envelope::new(EVENT_GUI_DATA, data)
    }
}

/// Actuator calibration traffic; the core only passes it through.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationRequest {
    Request { vehicle_id: String },
    Send { vehicle_id: String, values: Fields },
    Test { vehicle_id: String, values: Fields },
}

impl CalibrationRequest {
    pub fn to_envelope(&self) -> Envelope {
        let (event, vehicle_id, values) = match self {
            CalibrationRequest::Request { vehicle_id } => {
                (EVENT_REQUEST_CALIBRATION, vehicle_id, None)
            }
            CalibrationRequest::Send { vehicle_id, values } => {
                (EVENT_CALIBRATION_DATA, vehicle_id, Some(values))
            }
            CalibrationRequest::Test { vehicle_id, values } => {
                (EVENT_TEST_CALIBRATION, vehicle_id, Some(values))
            }
        };
        let mut data = Fields::new();
        data.insert("id".to_string(), Value::String(vehicle_id.clone()));
        if let Some(values) = values {
            for (key, value) in values {
                data.insert(key.clone(), value.clone());
            }
        }
        Envelope::new(event, Value::Object(data))
    }
}

/// Partial telemetry for one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryDelta {
    pub vehicle_id: String,
    pub fields: Fields,
}

impl TelemetryDelta {
    /// The shape captured by recordings: `{boat_id, data:{..}}`.
    pub fn to_value(&self) -> Value {
        json!({
            "boat_id": self.vehicle_id,
            "data": Value::Object(self.fields.clone()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    BoatData(TelemetryDelta),
    BoatLocations(Vec<TelemetryDelta>),
    Calibration(Value),
    Other(Envelope),
}

impl InboundEvent {
    /// Rejects frames a store could not merge without guessing: no vehicle
    /// id, or a payload that is not an object.
    pub fn parse(envelope: Envelope) -> Result<Self> {
        match envelope.event.as_str() {
            EVENT_BOAT_DATA => Ok(InboundEvent::BoatData(parse_delta(&envelope.data)?)),
            EVENT_BOAT_LOCATIONS => parse_locations(&envelope.data).map(InboundEvent::BoatLocations),
            EVENT_CALIBRATION_DATA => Ok(InboundEvent::Calibration(envelope.data)),
            _ => Ok(InboundEvent::Other(envelope)),
        }
    }
}

fn vehicle_id_of(object: &Fields) -> Result<String> {
    let id = object
        .get("boat_id")
        .or_else(|| object.get("id"))
        .ok_or_else(|| anyhow!("telemetry is missing boat_id"))?;
    match id {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        Value::String(_) => bail!("telemetry has an empty boat_id"),
        other => bail!("telemetry boat_id is not a string: {}", other),
    }
}

fn parse_delta(data: &Value) -> Result<TelemetryDelta> {
    let object = data
        .as_object()
        .ok_or_else(|| anyhow!("boat_data payload is not an object"))?;
    let vehicle_id = vehicle_id_of(object)?;
    let fields = match object.get("data") {
        Some(Value::Object(fields)) => fields.clone(),
        Some(other) => bail!("boat_data.data for {} is not an object: {}", vehicle_id, other),
        None => bail!("boat_data for {} carries no data", vehicle_id),
    };
    Ok(TelemetryDelta { vehicle_id, fields })
}

fn parse_location_entry(entry: &Value) -> Result<TelemetryDelta> {
    let object = entry
        .as_object()
        .ok_or_else(|| anyhow!("fleet entry is not an object"))?;
    let vehicle_id = vehicle_id_of(object)?;
    let fields = match object.get("data") {
        Some(Value::Object(fields)) => fields.clone(),
        Some(other) => bail!("fleet entry data for {} is not an object: {}", vehicle_id, other),
        // Flat entries carry their fields next to the id.
        None => object
            .iter()
            .filter(|(key, _)| key.as_str() != "boat_id" && key.as_str() != "id")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    };
    Ok(TelemetryDelta { vehicle_id, fields })
}

fn parse_locations(data: &Value) -> Result<Vec<TelemetryDelta>> {
    let entries = data
        .as_array()
        .ok_or_else(|| anyhow!("boat_locations payload is not an array"))?;
    let mut fleet = Vec::with_capacity(entries.len());
    for entry in entries {
        match parse_location_entry(entry) {
            Ok(delta) => fleet.push(delta),
            Err(e) => tracing::warn!("Skipping fleet entry: {}", e),
        }
    }
    Ok(fleet)
}
