//! Warn-and-above events kept in SQLite so the operator can read them back
//! through `/admin/logs`.
//!
//! Correlation comes from the event's own `token` and `connection_id` fields.
//! Tokens are logged as a short prefix, so the token filter matches either
//! the prefix or a full token that starts with it.

use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

/// One persisted event as served to the operator.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: i64,
    pub at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub token: Option<String>,
    pub connection_id: Option<String>,
    /// Remaining event fields as a JSON object, if any.
    pub extra: Option<String>,
}

/// `/admin/logs` query string. Every filter is optional.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub level: Option<String>,
    pub target: Option<String>,
    pub token: Option<String>,
    pub connection_id: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogFilter {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

/// Event about to be written.
#[derive(Debug)]
struct NewEvent {
    at: String,
    level: Level,
    target: String,
    message: String,
    token: Option<String>,
    connection_id: Option<String>,
    extra: Option<String>,
}

pub struct LogStore {
    conn: Mutex<Connection>,
}

impl LogStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS warn_events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 at TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 token TEXT,
                 connection_id TEXT,
                 extra TEXT
             );
             CREATE INDEX IF NOT EXISTS warn_events_at ON warn_events(at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, event: &NewEvent) -> Result<(), rusqlite::Error> {
        self.conn.lock().execute(
            "INSERT INTO warn_events (at, level, target, message, token, connection_id, extra)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.at,
                event.level.as_str(),
                event.target,
                event.message,
                event.token,
                event.connection_id,
                event.extra,
            ],
        )?;
        Ok(())
    }

    /// Matching events, newest first.
    pub fn recent(&self, filter: &LogFilter) -> Result<Vec<StoredEvent>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, at, level, target, message, token, connection_id, extra
             FROM warn_events
             WHERE (?1 IS NULL OR level = ?1)
               AND (?2 IS NULL OR instr(target, ?2) > 0)
               AND (?3 IS NULL OR (token IS NOT NULL AND instr(?3, token) = 1))
               AND (?4 IS NULL OR connection_id = ?4)
               AND (?5 IS NULL OR at >= ?5)
             ORDER BY id DESC
             LIMIT ?6",
        )?;
        let rows = stmt.query_map(
            params![
                filter.level.as_deref().map(str::to_uppercase),
                filter.target,
                filter.token,
                filter.connection_id,
                filter.since,
                filter.limit(),
            ],
            |row| {
                Ok(StoredEvent {
                    id: row.get(0)?,
                    at: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    token: row.get(5)?,
                    connection_id: row.get(6)?,
                    extra: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }
}

/// Subscriber layer feeding WARN and ERROR events into a [`LogStore`].
pub struct WarnLayer {
    store: Arc<LogStore>,
}

impl WarnLayer {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self { store }
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    token: Option<String>,
    connection_id: Option<String>,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_debug(field, &format_args!("{value}"));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        match field.name() {
            "message" => self.message = text,
            "token" => self.token = Some(text),
            "connection_id" => self.connection_id = Some(text),
            other => {
                self.extra.insert(other.to_owned(), text.into());
            }
        }
    }
}

impl<S: Subscriber> Layer<S> for WarnLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let extra = (!fields.extra.is_empty())
            .then(|| serde_json::Value::Object(fields.extra).to_string());
        let row = NewEvent {
            at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: *meta.level(),
            target: meta.target().to_owned(),
            message: fields.message,
            token: fields.token,
            connection_id: fields.connection_id,
            extra,
        };
        // Logging a failed log write would recurse into this layer.
        if let Err(e) = self.store.append(&row) {
            eprintln!("relay-telemetry: dropped {} event: {e}", row.level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tracing_subscriber::layer::SubscriberExt;

    fn db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("relay-warn-log-{}", uuid::Uuid::now_v7()))
            .join("events.db")
    }

    fn captured(emit: impl FnOnce()) -> Arc<LogStore> {
        let store = Arc::new(LogStore::open(&db_path()).unwrap());
        let subscriber = tracing_subscriber::registry().with(WarnLayer::new(store.clone()));
        tracing::subscriber::with_default(subscriber, emit);
        store
    }

    fn messages(events: &[StoredEvent]) -> Vec<&str> {
        events.iter().map(|e| e.message.as_str()).collect()
    }

    #[test]
    fn info_and_below_are_not_kept() {
        let store = captured(|| {
            tracing::debug!("noise");
            tracing::info!("admin connected");
            tracing::warn!("send queue full, dropping frame");
            tracing::error!("failed to encode admin frame");
        });

        let events = store.recent(&LogFilter::default()).unwrap();
        assert_eq!(
            messages(&events),
            ["failed to encode admin frame", "send queue full, dropping frame"]
        );
        assert_eq!(events[0].level, "ERROR");
        assert_eq!(events[1].level, "WARN");
    }

    #[test]
    fn correlation_fields_get_their_own_columns() {
        let store = captured(|| {
            tracing::warn!(
                connection_id = %"conn_7",
                token = %"AbCdEfGhIjKl",
                attempts = 3u64,
                "resume with unknown token"
            );
        });

        let events = store.recent(&LogFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.connection_id.as_deref(), Some("conn_7"));
        assert_eq!(event.token.as_deref(), Some("AbCdEfGhIjKl"));
        assert_eq!(event.extra.as_deref(), Some(r#"{"attempts":"3"}"#));
        assert!(event.at.ends_with('Z'));
    }

    #[test]
    fn token_filter_accepts_prefix_or_full_token() {
        let store = captured(|| {
            tracing::warn!(token = "AbCdEfGhIjKl", "first");
            tracing::warn!(token = "ZZZZZZZZZZZZ", "second");
            tracing::warn!("untagged");
        });

        let full = format!("AbCdEfGhIjKl{}", "x".repeat(76));
        for token in ["AbCdEfGhIjKl", full.as_str()] {
            let filter = LogFilter {
                token: Some(token.into()),
                ..Default::default()
            };
            assert_eq!(messages(&store.recent(&filter).unwrap()), ["first"]);
        }
    }

    #[test]
    fn level_target_and_connection_filters() {
        let store = captured(|| {
            tracing::warn!(target: "relay_server::auth", "bad credentials");
            tracing::error!(target: "relay_store::messages", connection_id = "conn_1", "insert failed");
            tracing::warn!(target: "relay_store::sessions", connection_id = "conn_2", "touch failed");
        });

        let by_level = LogFilter {
            level: Some("error".into()),
            ..Default::default()
        };
        assert_eq!(messages(&store.recent(&by_level).unwrap()), ["insert failed"]);

        let by_target = LogFilter {
            target: Some("relay_store".into()),
            ..Default::default()
        };
        assert_eq!(
            messages(&store.recent(&by_target).unwrap()),
            ["touch failed", "insert failed"]
        );

        let by_connection = LogFilter {
            connection_id: Some("conn_2".into()),
            ..Default::default()
        };
        assert_eq!(messages(&store.recent(&by_connection).unwrap()), ["touch failed"]);
    }

    #[test]
    fn since_is_inclusive_and_limit_is_capped() {
        let store = captured(|| {
            for i in 0..5 {
                tracing::warn!(n = i, "tick");
            }
        });

        let all = store.recent(&LogFilter::default()).unwrap();
        let oldest = all.last().unwrap().at.clone();
        let since = LogFilter {
            since: Some(oldest),
            ..Default::default()
        };
        assert_eq!(store.recent(&since).unwrap().len(), 5);

        let future = LogFilter {
            since: Some("2999-01-01T00:00:00.000Z".into()),
            ..Default::default()
        };
        assert!(store.recent(&future).unwrap().is_empty());

        let two = LogFilter {
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(store.recent(&two).unwrap().len(), 2);

        assert_eq!(LogFilter::default().limit(), 100);
        let huge = LogFilter {
            limit: Some(50_000),
            ..Default::default()
        };
        assert_eq!(huge.limit(), 1000);
    }

    #[test]
    fn filter_parses_camel_case_query() {
        let filter: LogFilter =
            serde_json::from_str(r#"{"connectionId":"conn_3","limit":10}"#).unwrap();
        assert_eq!(filter.connection_id.as_deref(), Some("conn_3"));
        assert_eq!(filter.limit(), 10);
    }
}
