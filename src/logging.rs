use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::{debug, info, metadata::LevelFilter};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{prelude::*, EnvFilter};

/// The identifier the daemon logs under; also the log file prefix.
pub const LOG_IDENT: &str = "koruza-control";

fn env_filter() -> EnvFilter {
    EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
}

fn do_init(stderr: bool, log_dir: Option<PathBuf>) {
    let stderr_layer = stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(env_filter())
    });

    let file_layer = log_dir.and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_IDENT)
            .build(dir)
            .ok()?;

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_filter(LevelFilter::INFO),
        )
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    debug!("Logging initialized");
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
///
/// The stderr layer is meant for foreground runs; the file layer is the
/// daemon's operational log and is skipped if `log_dir` cannot be used.
pub async fn init(stderr: bool, log_dir: Option<PathBuf>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stderr, log_dir);

        *initialized = true;
    }

    info!("Logging initialized");
}
