//! Static configuration descriptor for the `lua-dap` debug adapter, plus the
//! process-wide `tracing` setup.
//!
//! The descriptor is a JSON document loaded once at process start:
//!
//! ```json
//! {
//!   "endpoint": "tcp://127.0.0.1:4711",
//!   "installed_root": "/opt/host/scripts",
//!   "source_root": "/home/me/project/scripts",
//!   "log_file": "/tmp/lua-dap.log",
//!   "test_mode": false
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use url::Url;

/// Endpoint value selecting the stdio pipe transport.
pub const STDIO_ENDPOINT: &str = "stdio";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse json config: {0}")]
    Json(String),
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    Endpoint { endpoint: String, reason: String },
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        // Keep the location, drop the echoed value: config files may carry
        // credentials embedded in endpoint URLs.
        ConfigError::Json(format!(
            "{:?} error at line {} column {}",
            err.classify(),
            err.line(),
            err.column()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LuaDapConfig {
    /// Where the adapter exchanges DAP messages: `stdio` or `tcp://host:port`.
    pub endpoint: String,

    /// Root directory the host runtime loads scripts from.
    pub installed_root: Option<PathBuf>,

    /// Root directory of the original sources the client edits.
    pub source_root: Option<PathBuf>,

    /// Append logs to this file. Takes precedence over `logging.file`.
    pub log_file: Option<PathBuf>,

    /// Verbose logging, and a failing exit status when the script fails.
    pub test_mode: bool,

    /// Emit the `stackTraceUpdate` extension event on every trace event.
    pub stack_trace_updates: bool,

    /// Route the script's `print` to DAP `output` events.
    pub redirect_print: bool,

    pub logging: LoggingConfig,
}

impl Default for LuaDapConfig {
    fn default() -> Self {
        Self {
            endpoint: STDIO_ENDPOINT.to_owned(),
            installed_root: None,
            source_root: None,
            log_file: None,
            test_mode: false,
            stack_trace_updates: true,
            redirect_print: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl LuaDapConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: LuaDapConfig = serde_json::from_str(text)?;
        // Validate eagerly so a typo fails at startup, not at connect time.
        config.endpoint()?;
        Ok(config)
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.endpoint)
    }

    /// Logging settings with the top-level overrides (`log_file`, `test_mode`) applied.
    pub fn effective_logging(&self) -> LoggingConfig {
        let mut logging = self.logging.clone();
        if let Some(file) = &self.log_file {
            logging.file = Some(file.clone());
        }
        if self.test_mode {
            logging.level = "debug".to_owned();
        }
        logging
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Stdio,
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        let trimmed = endpoint.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(STDIO_ENDPOINT) {
            return Ok(Endpoint::Stdio);
        }

        let invalid = |reason: &str| ConfigError::Endpoint {
            endpoint: trimmed.to_owned(),
            reason: reason.to_owned(),
        };

        let url = Url::parse(trimmed).map_err(|err| invalid(&err.to_string()))?;
        if url.scheme() != "tcp" {
            return Err(invalid("unsupported scheme (expected `tcp`)"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host"))?
            .to_owned();
        let port = url.port().ok_or_else(|| invalid("missing port"))?;
        Ok(Endpoint::Tcp { host, port })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or an `EnvFilter` directive string.
    pub level: String,

    /// Emit logs in JSON format.
    pub json: bool,

    /// Mirror logs to stderr. Never stdout: it may carry the pipe transport.
    pub stderr: bool,

    /// Append logs to the given file path.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: true,
            file: None,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
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
            _ => trimmed.to_owned(),
        }
    }

    /// The effective filter: configured directives merged with `RUST_LOG`.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let config_directives = Self::normalize_level_directives(&self.level);
        let fallback = || {
            tracing_subscriber::EnvFilter::try_new(&config_directives).unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::default()
                    .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
            })
        };

        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                tracing_subscriber::EnvFilter::try_new(format!("{config_directives},{env_directives}"))
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| fallback())
            }
            None => fallback(),
        }
    }
}

#[derive(Clone)]
struct SharedFile(Arc<Mutex<File>>);

impl io::Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut *self.0.lock(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut *self.0.lock())
    }
}

impl<'a> MakeWriter<'a> for SharedFile {
    type Writer = SharedFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber.
///
/// Safe to call multiple times; only the first call has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let file = config
            .file
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| SharedFile(Arc::new(Mutex::new(file))));
        let file_requested = config.file.is_some();
        let file_opened = file.is_some();

        let writer = match (config.stderr, file) {
            (true, Some(file)) => BoxMakeWriter::new(io::stderr.and(file)),
            (true, None) => BoxMakeWriter::new(io::stderr),
            (false, Some(file)) => BoxMakeWriter::new(file),
            (false, None) => BoxMakeWriter::new(io::sink),
        };

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        let registry = tracing_subscriber::registry().with(config.env_filter());
        let installed = if config.json {
            tracing::subscriber::set_global_default(registry.with(layer.json())).is_ok()
        } else {
            tracing::subscriber::set_global_default(registry.with(layer)).is_ok()
        };

        if installed && file_requested && !file_opened {
            tracing::warn!(
                target: "lua_dap.config",
                "failed to open log file; file logging is disabled"
            );
        }
    });
}
