use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_server::ServerConfig;
use relay_store::{Database, MessageStore, SqliteMessageStore};
use relay_telemetry::TelemetryConfig;
use secrecy::SecretString;

/// One operator, many anonymous visitors, persisted chat history.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "RELAY_PORT", default_value_t = 8080)]
    port: u16,

    /// SQLite file. Defaults to $HOME/.relay/relay.db
    #[arg(long, env = "RELAY_DATABASE")]
    database: Option<PathBuf>,

    #[arg(long, env = "RELAY_ADMIN_USER")]
    admin_user: String,

    #[arg(long, env = "RELAY_ADMIN_PASS", hide_env_values = true)]
    admin_pass: String,

    /// Token salt. A random one is generated per process when absent.
    #[arg(long, env = "RELAY_SALT", hide_env_values = true)]
    salt: Option<String>,

    #[arg(long, env = "RELAY_LOG", default_value = "info")]
    log_level: tracing::Level,

    #[arg(long, env = "RELAY_LOG_JSON")]
    log_json: bool,

    /// Persist warn+ logs to this SQLite file.
    #[arg(long, env = "RELAY_LOG_DB")]
    log_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = relay_telemetry::init_telemetry(TelemetryConfig {
        level: args.log_level,
        json: args.log_json,
        event_db: args.log_db.clone(),
    });

    tracing::info!("starting relay");

    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| dirs_home().join(".relay").join("relay.db"));
    let db = Database::open(&db_path)
        .with_context(|| format!("store unavailable: cannot open {}", db_path.display()))?;
    let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(db));

    let mut config = ServerConfig {
        host: args.host,
        port: args.port,
        admin_user: args.admin_user,
        admin_pass: SecretString::from(args.admin_pass),
        ..Default::default()
    };
    match args.salt {
        Some(salt) => config.salt = SecretString::from(salt),
        None => tracing::warn!("no salt configured, using a random per-process salt"),
    }

    let handle = relay_server::start(config, store, telemetry)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
