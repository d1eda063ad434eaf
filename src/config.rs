use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Environment, File};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::protocol::CommandSchema;
use crate::recording::ExportFormat;

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

#[derive(Debug, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub endpoints: Vec<EndpointConfig>,
    pub dispatcher: DispatcherConfig,
    pub recording: RecordingConfig,
}

/// One selectable relay, shown to the operator as `label`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EndpointConfig {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    pub period_ms: u64,
    #[serde(default)]
    pub schema: CommandSchema,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default)]
    pub record_on_connect: bool,
}

impl DispatcherConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

impl RecordingConfig {
    /// Empty `directory` means the user's download folder, like a browser save.
    pub fn export_dir(&self) -> Result<PathBuf> {
        if !self.directory.trim().is_empty() {
            return Ok(PathBuf::from(self.directory.trim()));
        }
        let base = dirs::download_dir()
            .or_else(dirs::home_dir)
            .context("Failed to resolve a download directory")?;
        Ok(base.join("sunny"))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let env = std::env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let config_path = format!("config/{}.toml", env);
        let fallback_path = format!("/etc/sunny/{}.toml", env);

        let config_builder = config::Config::builder();
        let config_builder = if std::path::Path::new(&config_path).exists() {
            config_builder.add_source(File::with_name(&config_path))
        } else {
            config_builder.add_source(File::with_name(&fallback_path))
        };

        let settings = config_builder
            .add_source(Environment::with_prefix("SUNNY").separator("__"))
            .build()?;
        let config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

}

/// The operator's initial selection: the first configured endpoint.
pub fn default_endpoint(endpoints: &[EndpointConfig]) -> Option<&EndpointConfig> {
    endpoints.first()
}

/// Looks an endpoint up by label first, then by value.
pub fn find_endpoint<'a>(endpoints: &'a [EndpointConfig], key: &str) -> Option<&'a EndpointConfig> {
    endpoints
        .iter()
        .find(|e| e.label == key)
        .or_else(|| endpoints.iter().find(|e| e.value == key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_level = "info"

[[endpoints]]
label = "Local relay"
value = "ws://127.0.0.1:5000/relay"

[[endpoints]]
label = "Broker"
value = "mqtt://10.0.0.2:1883"

[dispatcher]
period_ms = 250
schema = "verbose"

[recording]
directory = "/tmp/sunny"
format = "csv"
"#;

    #[test]
    fn parses_endpoints_and_sections() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(
            default_endpoint(&config.endpoints).map(|e| e.value.as_str()),
            Some("ws://127.0.0.1:5000/relay")
        );
        assert_eq!(config.dispatcher.period(), Duration::from_millis(250));
        assert_eq!(config.dispatcher.schema, CommandSchema::Verbose);
        assert_eq!(config.recording.format, ExportFormat::Csv);
        assert!(!config.recording.record_on_connect);
        assert_eq!(
            config.recording.export_dir().unwrap(),
            PathBuf::from("/tmp/sunny")
        );
    }

    #[test]
    fn finds_endpoint_by_label_or_value() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(
            find_endpoint(&config.endpoints, "Broker").map(|e| e.value.as_str()),
            Some("mqtt://10.0.0.2:1883")
        );
        assert_eq!(
            find_endpoint(&config.endpoints, "ws://127.0.0.1:5000/relay")
                .map(|e| e.label.as_str()),
            Some("Local relay")
        );
        assert!(find_endpoint(&config.endpoints, "nowhere").is_none());
    }
}
