//! Companion daemon entrypoint.
//!
//! A single-writer service: one dispatch loop owns all activity state, while
//! the filesystem watcher, the HTTP accept loop, and the editor-history sync
//! run on their own threads and talk to it over a command channel.

use clap::Parser;
use fs_err as fs;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod change_detector;
mod clock;
mod config;
mod conversation;
mod correlator;
mod db;
mod dispatch;
mod engine;
mod error;
mod http;
mod privacy;
mod queue;
mod resources;
mod scheduler;
mod sessions;
mod source;
mod watcher;
mod workspace;

use clock::{Clock, SystemClock};
use config::CompanionConfig;
use db::Db;
use dispatch::Dispatcher;
use engine::Engine;
use source::{CursorSource, PromptSource};
use watcher::{IgnoreRules, WatchSettings};

const ADDR_FILE_NAME: &str = "daemon.addr";
const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "companion-daemon.log";

#[derive(Debug, Parser)]
#[command(name = "companion-daemon", version, about = "Correlates editor activity into a deliverable queue")]
struct Cli {
    /// Config file (default: <data-dir>/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on; 0 picks a free port
    #[arg(long)]
    port: Option<u16>,

    /// Directory to watch; repeatable, replaces configured roots
    #[arg(long = "watch")]
    watch: Vec<PathBuf>,

    /// State directory (default: ~/.companion)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => match config::default_data_dir() {
            Ok(dir) => dir,
            Err(err) => {
                eprintln!("companion-daemon: {}", err);
                std::process::exit(1);
            }
        },
    };
    let _log_guard = init_logging(&data_dir);

    let config = load_effective_config(&cli, &data_dir);

    let store = match Db::in_dir(&data_dir) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, dir = %data_dir.display(), "Failed to open activity store");
            std::process::exit(1);
        }
    };

    let server = match http::bind(&config.server.bind_address()) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "Failed to bind HTTP server");
            std::process::exit(1);
        }
    };
    match http::local_addr(&server) {
        Some(addr) => {
            if let Err(err) = write_addr_file(&data_dir, &addr.to_string()) {
                warn!(error = %err, "Failed to write address file");
            }
            info!(addr = %addr, store = %store.path().display(), "Companion daemon started");
        }
        None => warn!("HTTP server bound to a non-IP address"),
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (commands_tx, commands_rx) = mpsc::channel();
    let engine = Engine::new(&config, Arc::clone(&clock), Box::new(store));

    let watch_settings = WatchSettings {
        roots: config.watch.roots.clone(),
        ignore: IgnoreRules::new(&config.watch.ignore_patterns),
        settle_delay: std::time::Duration::from_millis(config.watch.settle_delay_ms),
        max_file_bytes: config.watch.max_file_bytes,
    };
    if let Err(err) = watcher::spawn_watcher(watch_settings, commands_tx.clone()) {
        warn!(error = %err, "Filesystem watcher unavailable; continuing without it");
    }

    let server = Arc::new(server);
    let http_tx = commands_tx.clone();
    thread::spawn(move || http::serve(server, http_tx));

    let source = prompt_source(&config);
    Dispatcher::new(engine, &config, clock, source, commands_rx, commands_tx).run();
}

fn init_logging(data_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let debug_enabled = env::var("COMPANION_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if fs::create_dir_all(&log_dir).is_err() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    }

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Some(guard)
}

fn load_effective_config(cli: &Cli, data_dir: &Path) -> CompanionConfig {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_path(data_dir));

    let mut config = match config::load_config(&path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Ignoring unusable config file, using defaults");
            CompanionConfig::default()
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if !cli.watch.is_empty() {
        config.watch.roots = cli.watch.clone();
    }
    info!(
        config = %path.display(),
        port = config.server.port,
        roots = config.watch.roots.len(),
        privacy = config.privacy.enabled,
        "Configuration loaded"
    );
    config
}

fn prompt_source(config: &CompanionConfig) -> Option<Arc<dyn PromptSource>> {
    if !config.source.enabled {
        return None;
    }
    let dir = config
        .source
        .storage_dir
        .clone()
        .or_else(CursorSource::default_storage_dir)?;
    if !dir.is_dir() {
        info!(dir = %dir.display(), "Editor history not found; prompt sync disabled");
        return None;
    }
    info!(dir = %dir.display(), "Prompt sync enabled");
    Some(Arc::new(CursorSource::new(dir)))
}

fn write_addr_file(data_dir: &Path, addr: &str) -> std::io::Result<()> {
    fs::create_dir_all(data_dir)?;
    fs::write(data_dir.join(ADDR_FILE_NAME), addr)
}
