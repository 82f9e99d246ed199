//! Configuration for the `godap` adapter.
//!
//! The file is TOML with two sections:
//!
//! ```toml
//! [logging]
//! level = "godap.session=debug,info"
//! file = "/tmp/godap.log"
//!
//! [adapter]
//! dlv_path = "/home/me/go/bin/dlv"
//! halt_timeout_ms = 1000
//! ```
//!
//! Every key is optional. Logs never go to stdout: in bridge and proxy mode
//! stdout carries the debug adapter protocol.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Once, OnceLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{
        writer::{BoxMakeWriter, MakeWriterExt},
        MakeWriter,
    },
    layer::SubscriberExt,
    Layer,
};

/// Environment variable consulted when `--config` is not given.
pub const CONFIG_ENV_VAR: &str = "GODAP_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` includes a source snippet; keep only the message.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

fn sanitize_toml_error_message(message: &str) -> String {
    static QUOTED_STRING_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();

    // Values may be paths or environment entries the user would rather not
    // see echoed into an editor's output panel.
    let re = QUOTED_STRING_RE.get_or_init(|| regex::Regex::new(r#""(?:\\.|[^"\\])*""#).ok());
    match re {
        Some(re) => re.replace_all(message, r#""<redacted>""#).into_owned(),
        None => message.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to this file. An unopenable file disables only this sink.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Include a backtrace when logging panics.
    #[serde(default)]
    pub include_backtrace: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            "off" | "none" => "off".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: [`LoggingConfig::level`] merged with `RUST_LOG`.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
            include_backtrace: false,
        }
    }
}

/// Timeouts and backend settings for debug sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    /// Delve binary used when a launch configuration does not name one.
    /// Falls back to `dlv` on `PATH`.
    pub dlv_path: Option<PathBuf>,
    /// How long disconnect waits for `halt` before forcing cleanup.
    pub halt_timeout_ms: u64,
    /// Upper bound on the whole disconnect handshake.
    pub disconnect_timeout_ms: u64,
    /// How long to wait for a spawned backend to start listening.
    pub startup_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Reply timeout for backend calls that do not resume the target.
    pub rpc_timeout_ms: u64,
    /// How long a disposed proxy backend may take to exit before SIGINT.
    pub dispose_grace_ms: u64,
    pub stack_trace_depth: i64,
}

impl AdapterConfig {
    pub fn halt_timeout(&self) -> Duration {
        Duration::from_millis(self.halt_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }

    pub fn dlv_program(&self) -> PathBuf {
        self.dlv_path.clone().unwrap_or_else(|| PathBuf::from("dlv"))
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            dlv_path: None,
            halt_timeout_ms: 1_000,
            disconnect_timeout_ms: 5_000,
            startup_timeout_ms: 30_000,
            connect_timeout_ms: 1_000,
            rpc_timeout_ms: 30_000,
            dispose_grace_ms: 1_000,
            stack_trace_depth: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GodapConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
}

/// Non-fatal findings from loading a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiagnostics {
    /// Dotted paths of keys that were ignored (top-level sections only; the
    /// known sections reject unknown keys outright).
    pub unknown_keys: Vec<String>,
}

impl GodapConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_from_path_with_diagnostics(path).map(|(config, _)| config)
    }

    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str_with_diagnostics(&text)
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let deserializer = toml::de::Deserializer::new(text);
        let mut unknown_keys = Vec::new();
        let config: GodapConfig = serde_ignored::deserialize(deserializer, |path| {
            unknown_keys.push(path.to_string());
        })?;
        Ok((config, ConfigDiagnostics { unknown_keys }))
    }

    /// Resolves the config path from `explicit` or [`CONFIG_ENV_VAR`].
    pub fn resolve_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit.or_else(|| {
            std::env::var_os(CONFIG_ENV_VAR)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
    }
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        MutexFileWriter {
            guard: self
                .file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

struct MutexFileWriter<'a> {
    guard: std::sync::MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber. Only the first call has an effect.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_open_failed = logging.file.is_some() && file.is_none();

        let mut make_writer = BoxMakeWriter::new(io::sink);
        if logging.stderr {
            // Keep `cargo test` output capture working in debug builds.
            if cfg!(debug_assertions) {
                make_writer = BoxMakeWriter::new(
                    make_writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr),
                );
            } else {
                make_writer = BoxMakeWriter::new(make_writer.and(io::stderr));
            }
        }
        if let Some(file) = file {
            let file = Arc::new(Mutex::new(file));
            make_writer = BoxMakeWriter::new(make_writer.and(MutexFileMakeWriter { file }));
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = logging.file.as_ref() {
                tracing::warn!(
                    target: "godap.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn level_directives_are_normalized() {
        assert_eq!(LoggingConfig::normalize_level_directives(""), "info");
        assert_eq!(LoggingConfig::normalize_level_directives(" WARNING "), "warn");
        assert_eq!(
            LoggingConfig::normalize_level_directives("godap.session=trace,info"),
            "godap.session=trace,info"
        );
    }

    #[test]
    fn empty_document_yields_defaults() {
        let (config, diagnostics) = GodapConfig::load_from_str_with_diagnostics("").unwrap();
        assert_eq!(config, GodapConfig::default());
        assert!(diagnostics.unknown_keys.is_empty());
        assert_eq!(config.adapter.halt_timeout(), Duration::from_secs(1));
        assert_eq!(config.adapter.disconnect_timeout(), Duration::from_secs(5));
        assert_eq!(config.adapter.stack_trace_depth, 50);
        assert_eq!(config.adapter.dlv_program(), PathBuf::from("dlv"));
    }

    #[test]
    fn partial_adapter_section_keeps_other_defaults() {
        let text = r#"
[adapter]
dlv_path = "/opt/go/bin/dlv"
halt_timeout_ms = 250
"#;
        let (config, _) = GodapConfig::load_from_str_with_diagnostics(text).unwrap();
        assert_eq!(config.adapter.halt_timeout(), Duration::from_millis(250));
        assert_eq!(config.adapter.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.adapter.dlv_program(), PathBuf::from("/opt/go/bin/dlv"));
    }

    #[test]
    fn unknown_sections_are_reported() {
        let text = r#"
[telemetry]
enabled = true
"#;
        let (_, diagnostics) = GodapConfig::load_from_str_with_diagnostics(text).unwrap();
        assert_eq!(diagnostics.unknown_keys, vec!["telemetry".to_string()]);
    }

    #[test]
    fn parse_errors_do_not_echo_values() {
        let text = r#"
[logging]
json = "hunter2"
"#;
        let err = GodapConfig::load_from_str_with_diagnostics(text).unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("hunter2"), "{message}");
        assert!(message.starts_with("failed to parse toml config"), "{message}");
    }
}
