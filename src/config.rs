use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use nexus_broker::BrokerConfig;
use nexus_telemetry::TelemetryConfig;

/// Top-level config file: `{"broker": {...}, "telemetry": {...}, "db_path": "..."}`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub telemetry: TelemetryConfig,
    pub db_path: Option<PathBuf>,
}

impl AppConfig {
    /// Defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

pub fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".nexus")
        .join("state")
        .join("sessions.db")
}
