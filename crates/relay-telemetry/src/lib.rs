//! Process-wide `tracing` setup for the relay.

mod logging;

pub use logging::{LogFilter, LogStore, StoredEvent, WarnLayer};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: Level,
    pub json: bool,
    /// Keep WARN+ events in this SQLite file.
    pub event_db: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            event_db: None,
        }
    }
}

/// What the server needs from telemetry after startup.
#[derive(Clone, Default)]
pub struct TelemetryHandle {
    events: Option<Arc<LogStore>>,
}

impl TelemetryHandle {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn persisting(store: Arc<LogStore>) -> Self {
        Self {
            events: Some(store),
        }
    }

    /// `None` when no event database was configured or it failed to open.
    pub fn events(&self) -> Option<&LogStore> {
        self.events.as_deref()
    }
}

fn console_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

/// Install the global subscriber. A second call leaves the first in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryHandle {
    let console = if config.json {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    }
    .with_filter(console_filter(config.level));

    let events = config.event_db.as_deref().and_then(|path| {
        LogStore::open(path)
            .map(Arc::new)
            .map_err(|e| eprintln!("relay-telemetry: event log {} unavailable: {e}", path.display()))
            .ok()
    });

    let installed = tracing_subscriber::registry()
        .with(console)
        .with(events.clone().map(WarnLayer::new))
        .try_init();
    if let Err(e) = installed {
        eprintln!("relay-telemetry: {e}");
    }

    TelemetryHandle { events }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_log_info_to_console_only() {
        let config = TelemetryConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json);
        assert!(config.event_db.is_none());
    }

    #[test]
    fn disabled_handle_exposes_no_events() {
        assert!(TelemetryHandle::disabled().events().is_none());
    }

    #[test]
    fn persisting_handle_shares_the_store() {
        let path = std::env::temp_dir()
            .join(format!("relay-telemetry-{}", uuid::Uuid::now_v7()))
            .join("events.db");
        let store = Arc::new(LogStore::open(&path).unwrap());
        let handle = TelemetryHandle::persisting(store.clone());
        let clone = handle.clone();
        assert!(std::ptr::eq(clone.events().unwrap(), store.as_ref()));
    }

    #[test]
    fn unset_env_uses_configured_level() {
        if std::env::var("RUST_LOG").is_err() {
            assert!(console_filter(Level::WARN).to_string().contains("warn"));
        }
    }
}
