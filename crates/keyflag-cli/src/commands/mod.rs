pub mod canary;
pub mod keys;
pub mod service;

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::ValueEnum;
use serde::Serialize;
use tracing::debug;

use keyflag_core::config::{LogConfig, LogFormat};
use keyflag_core::{KeyRecord, KeyflagConfig};
use keyflag_lifecycle::KeyLifecycle;
use keyflag_state::StateStore;

const DEFAULT_CONFIG: &str = "keyflag.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Read the config file, falling back to defaults when no file was named
/// and `./keyflag.toml` does not exist.
pub fn load_config(path: Option<&Path>, store: Option<PathBuf>) -> anyhow::Result<KeyflagConfig> {
    let mut config = match path {
        Some(path) => KeyflagConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            KeyflagConfig::from_file(Path::new(DEFAULT_CONFIG))?
        }
        None => KeyflagConfig::default(),
    };
    if let Some(store) = store {
        config.store.path = store;
        config.store.in_memory = false;
    }
    Ok(config)
}

/// Logs go to stderr; stdout carries command output only.
pub fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log.filter))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

pub struct Context {
    pub engine: KeyLifecycle,
    pub format: OutputFormat,
}

impl Context {
    pub fn open(config: &KeyflagConfig, format: OutputFormat) -> anyhow::Result<Self> {
        let store = if config.store.in_memory {
            StateStore::open_in_memory()?
        } else {
            StateStore::open(&config.store.path).with_context(|| {
                format!("failed to open store {}", config.store.path.display())
            })?
        };
        let engine = KeyLifecycle::with_defaults(store);
        if config.cache.warm_on_start {
            let count = engine.warm_cache()?;
            debug!(count, "cache warmed from store");
        }
        Ok(Self { engine, format })
    }

    /// Print `value` as pretty JSON, or as `text` in text mode.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text => println!("{}", text(value)),
        }
        Ok(())
    }
}

pub fn record_line(record: &KeyRecord) -> String {
    format!(
        "{:>6}  {:<14} {} = {} ({})",
        record.id,
        record.status.label(),
        record.key,
        record.value,
        record.value_type
    )
}

pub fn record_table(records: &[KeyRecord]) -> String {
    if records.is_empty() {
        return "(none)".to_string();
    }
    records.iter().map(record_line).collect::<Vec<_>>().join("\n")
}
