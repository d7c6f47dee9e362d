//! Structured logging setup shared by the broker binary and its tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level {0:?}")]
    InvalidLevel(String),

    #[error("invalid filter directive: {0}")]
    InvalidDirective(String),

    #[error("telemetry already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("filter reload failed: {0}")]
    Reload(String),
}

/// Output encoding for the stdout layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG` when set.
    pub log_level: String,
    /// Per-module level overrides (e.g. `nexus_broker` => `debug`).
    pub module_levels: BTreeMap<String, String>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            module_levels: BTreeMap::new(),
            format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    fn parsed_levels(&self) -> Result<(Level, Vec<(String, Level)>), TelemetryError> {
        let base = parse_level(&self.log_level)?;
        let modules = self
            .module_levels
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok((base, modules))
    }
}

fn parse_level(raw: &str) -> Result<Level, TelemetryError> {
    raw.parse::<Level>()
        .map_err(|_| TelemetryError::InvalidLevel(raw.to_string()))
}

/// `info,nexus_broker=debug`
fn directive_string(base: &str, modules: &[(String, Level)]) -> String {
    let mut filter = base.to_string();
    for (module, level) in modules {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

fn build_filter(base: &str, modules: &[(String, Level)]) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directive_string(base, modules))
        .map_err(|e| TelemetryError::InvalidDirective(e.to_string()))
}

/// Keeps the reload handle for runtime level changes.
///
/// `base` is the startup directive string (`RUST_LOG` when it was set,
/// otherwise the configured level), so runtime overrides layer on top of it.
pub struct TelemetryGuard {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
    levels: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    fn new(
        handle: reload::Handle<EnvFilter, Registry>,
        base: String,
        levels: Vec<(String, Level)>,
    ) -> Self {
        Self {
            handle,
            base,
            levels: Arc::new(RwLock::new(levels)),
        }
    }

    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        {
            let mut levels = self.levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
        }
        let filter = EnvFilter::try_new(self.directives())
            .map_err(|e| TelemetryError::InvalidDirective(e.to_string()))?;
        self.handle
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    /// Current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.levels.read().clone()
    }

    /// The full filter string currently installed.
    fn directives(&self) -> String {
        directive_string(&self.base, &self.levels.read())
    }
}

/// `RUST_LOG`, unless unset or blank.
fn env_directives() -> Option<String> {
    std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|raw| !raw.trim().is_empty())
}

/// Install the global subscriber. Call once at startup. Log lines go to
/// stderr so stdout stays free for program output.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let (level, modules) = config.parsed_levels()?;

    // RUST_LOG replaces the configured levels entirely.
    let (base, modules) = match env_directives() {
        Some(raw) => (raw, Vec::new()),
        None => (level.to_string().to_lowercase(), modules),
    };
    let (filter_layer, handle) = reload::Layer::new(build_filter(&base, &modules)?);

    let json_layer = (config.format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_span_list(true)
    });
    let compact_layer = (config.format == LogFormat::Compact).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(compact_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    Ok(TelemetryGuard::new(handle, base, modules))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.module_levels.is_empty());
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn config_from_partial_json() {
        let config: TelemetryConfig = serde_json::from_str(
            r#"{"module_levels": {"nexus_broker": "debug"}, "format": "compact"}"#,
        )
        .unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.format, LogFormat::Compact);
        let (base, modules) = config.parsed_levels().unwrap();
        assert_eq!(base, Level::INFO);
        assert_eq!(modules, vec![("nexus_broker".to_string(), Level::DEBUG)]);
    }

    #[test]
    fn bad_level_rejected() {
        let config = TelemetryConfig {
            log_level: "loud".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.parsed_levels(),
            Err(TelemetryError::InvalidLevel(l)) if l == "loud"
        ));
    }

    #[test]
    fn directive_lists_modules_after_base() {
        let s = directive_string(
            "warn",
            &[
                ("nexus_broker".into(), Level::DEBUG),
                ("nexus_store".into(), Level::TRACE),
            ],
        );
        assert_eq!(s, "warn,nexus_broker=debug,nexus_store=trace");
        assert!(build_filter("warn", &[]).is_ok());
    }

    #[test]
    fn set_module_level_updates_and_reloads() {
        let (layer, handle) = reload::Layer::new(build_filter("info", &[]).unwrap());
        let _subscriber = tracing_subscriber::registry().with(layer);
        let guard = TelemetryGuard::new(handle, "info".into(), Vec::new());

        guard.set_module_level("nexus_broker", Level::DEBUG).unwrap();
        guard.set_module_level("nexus_broker", Level::TRACE).unwrap();
        guard.set_module_level("nexus_store", Level::WARN).unwrap();

        assert_eq!(
            guard.module_levels(),
            vec![
                ("nexus_broker".to_string(), Level::TRACE),
                ("nexus_store".to_string(), Level::WARN),
            ]
        );
    }

    #[test]
    fn runtime_override_keeps_env_directives() {
        let base = "warn,hyper=off";
        let (layer, handle) = reload::Layer::new(build_filter(base, &[]).unwrap());
        let _subscriber = tracing_subscriber::registry().with(layer);
        let guard = TelemetryGuard::new(handle, base.into(), Vec::new());

        guard.set_module_level("nexus_broker", Level::DEBUG).unwrap();
        assert_eq!(guard.directives(), "warn,hyper=off,nexus_broker=debug");
    }
}
