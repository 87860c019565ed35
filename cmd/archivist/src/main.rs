use archivist_core::config::ConfigStore;
use archivist_core::events::ProgressBroadcaster;
use archivist_core::executor::Executor;
use archivist_core::history::HistoryStore;
use archivist_core::scheduler::Scheduler;
use archivist_core::util::shutdown::shutdown_signal;
use archivist_core::util::usage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_ROOT_DIR: &str = "/data";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_LOG_LEVEL: &str = "info";

struct RuntimeOptions {
    root_dir: PathBuf,
    port: String,
    log_level: String,
}

impl RuntimeOptions {
    fn load() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self {
            root_dir: PathBuf::from(flag_or_env(&args, "--root", "ARCHIVIST_ROOT", DEFAULT_ROOT_DIR)),
            port: flag_or_env(&args, "--port", "ARCHIVIST_PORT", DEFAULT_PORT),
            log_level: flag_or_env(
                &args,
                "--log-level",
                "ARCHIVIST_LOG_LEVEL",
                DEFAULT_LOG_LEVEL,
            ),
        }
    }
}

fn flag_or_env(args: &[String], flag: &str, env_key: &str, default_value: &str) -> String {
    if let Some(position) = args.iter().position(|arg| arg == flag) {
        if let Some(value) = args.get(position + 1) {
            return value.clone();
        }
    }
    std::env::var(env_key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_value.to_string())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if usage::handle_cli_flags(APP_VERSION) {
        return Ok(());
    }

    let options = RuntimeOptions::load();
    init_tracing(&options.log_level);

    let config_path = options.root_dir.join("config").join("config.json");
    let db_path = options.root_dir.join("config").join("archivist.db");
    let temp_dir = options.root_dir.join("temp");
    let sources_dir = options.root_dir.join("sources");

    tracing::info!(version = APP_VERSION, root = %options.root_dir.display(), "starting archivist");

    for dir in [
        options.root_dir.join("config"),
        temp_dir.clone(),
        sources_dir.clone(),
    ] {
        std::fs::create_dir_all(&dir)?;
    }

    let config = Arc::new(ConfigStore::load_or_create_default(
        &config_path,
        &options.root_dir,
        &temp_dir.to_string_lossy(),
        &sources_dir.to_string_lossy(),
    )?);
    tracing::info!(path = %config_path.display(), "configuration loaded");

    let history = HistoryStore::open(&db_path).await?;
    tracing::info!(path = %db_path.display(), "history store ready");

    let events = ProgressBroadcaster::new();
    let executor = Executor::new(config.clone(), history.clone(), events.clone());
    let scheduler = Scheduler::new(config.clone(), executor);
    scheduler.start();

    // The HTTP/WebSocket surface binds this port; it sits outside the core.
    tracing::info!(port = %options.port, "archivist ready");

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    scheduler.stop();
    history.close().await;
    tracing::info!("archivist stopped");
    Ok(())
}
