//! Tracing infrastructure.
//!
//! One console layer for interactive use, plus an optional timestamped
//! session log file in the data directory so an unattended overnight run
//! leaves a record of every lifecycle event (connects, sequence state
//! transitions, failed recorder ticks). `RUST_LOG` overrides the configured
//! level when set.

use crate::config::Settings;
use crate::error::{RigError, RigResult};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber from settings.
///
/// Returns the session log path when one was opened. Fails if a subscriber
/// is already installed.
pub fn init(settings: &Settings) -> RigResult<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let console = fmt::layer().with_target(false);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    let session_path = if settings.session_log {
        std::fs::create_dir_all(&settings.storage.data_dir)?;
        let name = format!(
            "session {}.log",
            chrono::Local::now().format("%Y-%m-%d %H-%M-%S")
        );
        let path = settings.storage.data_dir.join(name);
        let file = File::create(&path)?;
        let file_layer = fmt::layer().with_ansi(false).with_writer(Arc::new(file));
        registry
            .with(file_layer)
            .try_init()
            .map_err(|e| RigError::Configuration(format!("tracing init failed: {e}")))?;
        Some(path)
    } else {
        registry
            .try_init()
            .map_err(|e| RigError::Configuration(format!("tracing init failed: {e}")))?;
        None
    };

    match &session_path {
        Some(path) => info!(path = %path.display(), "session being logged"),
        None => info!("session log file disabled"),
    }
    Ok(session_path)
}
