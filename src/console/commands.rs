use std::fmt::Write as _;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use super::Console;
use crate::protocol::Fields;
use crate::recording::SessionScope;
use crate::relay::ConnectionState;

pub const HELP: &str = "\
endpoints                              list configured relays
connect [label|url]                    connect (default: first endpoint)
disconnect
status
fleet
manual <id> <rudder> <throttle> [sail] hold manual control
release <id>                           release manual control
goal <id> <lat> <lng>                  send an autonomous goal
record start|stop <all|id>
wind <step>                            interpolate the wind field
calibrate request|send|test <id> [key=value ..]
quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationAction {
    Request,
    Send,
    Test,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Help,
    Endpoints,
    Connect(Option<String>),
    Disconnect,
    Status,
    Fleet,
    Manual {
        vehicle_id: String,
        rudder: f64,
        throttle: f64,
        sail: f64,
    },
    Release(String),
    Goal {
        vehicle_id: String,
        latitude: f64,
        longitude: f64,
    },
    StartRecording(SessionScope),
    StopRecording(SessionScope),
    Wind(f64),
    Calibrate {
        action: CalibrationAction,
        vehicle_id: String,
        values: Fields,
    },
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Quit,
}

fn number(args: &[&str], index: usize, name: &str) -> Result<f64> {
    let raw = args
        .get(index)
        .ok_or_else(|| anyhow!("Missing {}", name))?;
    raw.parse::<f64>()
        .with_context(|| format!("Invalid {} '{}'", name, raw))
}

fn word(args: &[&str], index: usize, name: &str) -> Result<String> {
    args.get(index)
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("Missing {}", name))
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn values(pairs: &[&str]) -> Result<Fields> {
    let mut fields = Fields::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected key=value, got '{}'", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = tokens.split_first() else {
            bail!("Empty command");
        };
        let command = match verb {
            "help" | "?" => OperatorCommand::Help,
            "endpoints" => OperatorCommand::Endpoints,
            "connect" => OperatorCommand::Connect(args.first().map(|s| s.to_string())),
            "disconnect" => OperatorCommand::Disconnect,
            "status" => OperatorCommand::Status,
            "fleet" => OperatorCommand::Fleet,
            "manual" => OperatorCommand::Manual {
                vehicle_id: word(args, 0, "vehicle id")?,
                rudder: number(args, 1, "rudder")?,
                throttle: number(args, 2, "throttle")?,
                sail: if args.len() > 3 {
                    number(args, 3, "sail")?
                } else {
                    0.0
                },
            },
            "release" => OperatorCommand::Release(word(args, 0, "vehicle id")?),
            "goal" => OperatorCommand::Goal {
                vehicle_id: word(args, 0, "vehicle id")?,
                latitude: number(args, 1, "latitude")?,
                longitude: number(args, 2, "longitude")?,
            },
            "record" => {
                let scope: SessionScope = word(args, 1, "scope")?.parse()?;
                match args.first().copied() {
                    Some("start") => OperatorCommand::StartRecording(scope),
                    Some("stop") => OperatorCommand::StopRecording(scope),
                    _ => bail!("Usage: record start|stop <all|id>"),
                }
            }
            "wind" => OperatorCommand::Wind(number(args, 0, "grid step")?),
            "calibrate" => {
                let action = match args.first().copied() {
                    Some("request") => CalibrationAction::Request,
                    Some("send") => CalibrationAction::Send,
                    Some("test") => CalibrationAction::Test,
                    _ => bail!("Usage: calibrate request|send|test <id> [key=value ..]"),
                };
                OperatorCommand::Calibrate {
                    action,
                    vehicle_id: word(args, 1, "vehicle id")?,
                    values: values(args.get(2..).unwrap_or_default())?,
                }
            }
            "quit" | "exit" => OperatorCommand::Quit,
            other => bail!("Unknown command '{}', try 'help'", other),
        };
        Ok(command)
    }
}

fn sent(ok: bool, what: &str) -> Reply {
    if ok {
        Reply::Text(format!("{} sent", what))
    } else {
        Reply::Text(format!("{} not sent: not connected", what))
    }
}

impl Console {
    pub async fn execute(&self, command: OperatorCommand) -> Result<Reply> {
        let reply = match command {
            OperatorCommand::Help => Reply::Text(HELP.to_string()),
            OperatorCommand::Endpoints => {
                let mut out = String::new();
                for endpoint in &self.settings.endpoints {
                    let _ = writeln!(out, "{:<24} {}", endpoint.label, endpoint.value);
                }
                Reply::Text(out.trim_end().to_string())
            }
            OperatorCommand::Connect(key) => {
                let endpoint = self
                    .resolve_endpoint(key.as_deref())
                    .ok_or_else(|| anyhow!("No endpoint matches {:?}", key))?;
                self.connect(&endpoint).await?;
                Reply::Text(format!("Connected to {}", endpoint))
            }
            OperatorCommand::Disconnect => {
                self.connection.disconnect();
                Reply::Text("Disconnected".to_string())
            }
            OperatorCommand::Status => Reply::Text(self.describe_status()),
            OperatorCommand::Fleet => Reply::Text(self.describe_fleet()?),
            OperatorCommand::Manual {
                vehicle_id,
                rudder,
                throttle,
                sail,
            } => {
                if self
                    .dispatcher
                    .update_manual_control(&vehicle_id, rudder, throttle, sail)
                {
                    Reply::Text(format!(
                        "Holding {} every {:?}",
                        vehicle_id,
                        self.dispatcher.period()
                    ))
                } else {
                    Reply::Text("Not connected; manual input ignored".to_string())
                }
            }
            OperatorCommand::Release(vehicle_id) => sent(
                self.dispatcher.end_manual_control(&vehicle_id),
                "Zeroed command",
            ),
            OperatorCommand::Goal {
                vehicle_id,
                latitude,
                longitude,
            } => sent(
                self.dispatcher.send_goal(&vehicle_id, latitude, longitude),
                "Goal",
            ),
            OperatorCommand::StartRecording(scope) => {
                if self.recorder.start_session(scope.clone()) {
                    Reply::Text(format!("Recording {}", scope))
                } else {
                    Reply::Text(format!("Already recording {}", scope))
                }
            }
            OperatorCommand::StopRecording(scope) => match self.recorder.stop_session(&scope)? {
                Some(path) => Reply::Text(format!("Exported {}", path.display())),
                None => Reply::Text(format!("Nothing recorded for {}", scope)),
            },
            OperatorCommand::Wind(step) => {
                let field = self.wind_field(step)?;
                Reply::Text(serde_json::to_string(&field)?)
            }
            OperatorCommand::Calibrate {
                action,
                vehicle_id,
                values,
            } => {
                let ok = match action {
                    CalibrationAction::Request => self.dispatcher.request_calibration(&vehicle_id),
                    CalibrationAction::Send => self.dispatcher.send_calibration(&vehicle_id, values),
                    CalibrationAction::Test => self.dispatcher.test_calibration(&vehicle_id, values),
                };
                sent(ok, "Calibration")
            }
            OperatorCommand::Quit => Reply::Quit,
        };
        Ok(reply)
    }

    fn describe_status(&self) -> String {
        let status = self.connection.status();
        let mut out = match (status.state, status.endpoint) {
            (ConnectionState::Connected, Some(endpoint)) => format!("connected to {}", endpoint),
            (ConnectionState::Connecting, Some(endpoint)) => format!("connecting to {}", endpoint),
            (ConnectionState::Connecting, None) => "connecting".to_string(),
            _ => "disconnected".to_string(),
        };
        let _ = write!(
            out,
            ", mode {:?}, {} vehicle(s)",
            self.dispatcher.command_mode(),
            self.fleet.len()
        );
        let scopes = self.recorder.active_scopes();
        if !scopes.is_empty() {
            let names: Vec<String> = scopes.iter().map(ToString::to_string).collect();
            let _ = write!(out, ", recording {}", names.join(" "));
        }
        out
    }

    fn describe_fleet(&self) -> Result<String> {
        let snapshot = self.fleet.snapshot()?;
        if snapshot.is_empty() {
            return Ok("No vehicles".to_string());
        }
        let mut out = String::new();
        for vehicle in snapshot {
            let position = vehicle
                .position()
                .map(|(lat, lng)| format!("{:.5}, {:.5}", lat, lng))
                .unwrap_or_else(|| "no fix".to_string());
            let _ = writeln!(
                out,
                "{:<12} {:<24} {:?} (seen {})",
                vehicle.id,
                position,
                vehicle.status(),
                vehicle.last_seen.format("%H:%M:%S")
            );
        }
        Ok(out.trim_end().to_string())
    }
}
