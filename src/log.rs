//! Structured logging for gatekeep.
//!
//! Log levels:
//! - ERROR: failures that abort a run
//! - WARN: blocked gates, bundle audit failures, escalations
//! - INFO: run lifecycle, dispute verdicts, hint escalations
//! - DEBUG: graph mutations, artifact writes, gate passes
//! - TRACE: producer payloads
//!
//! Output goes to `<state_dir>/gatekeep.log`. Debug mode can be enabled
//! with the `debug` argument or `GATEKEEP_DEBUG=1`; `GATEKEEP_LOG` takes a
//! full `EnvFilter` directive and overrides both.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub const DEBUG_ENV: &str = "GATEKEEP_DEBUG";
pub const FILTER_ENV: &str = "GATEKEEP_LOG";

/// Initialize logging to `~/.gatekeep/gatekeep.log`.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging under the default state directory.
pub fn init_with_debug(debug: bool) {
    if let Ok(dir) = PipelineConfig::gatekeep_dir() {
        init_in(&dir, debug);
    }
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn filter(debug: bool) -> EnvFilter {
    let default = if debug { "gatekeep=debug" } else { "gatekeep=info" };
    std::env::var(FILTER_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

/// Initialize logging to `<dir>/gatekeep.log`.
///
/// Safe to call more than once: only the first call installs a
/// subscriber, and an already installed global subscriber is left alone.
pub fn init_in(dir: &Path, debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    if LOG_PATH.get().is_some() {
        return;
    }
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }
    let path = dir.join("gatekeep.log");
    let Ok(file) = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
    else {
        return;
    };

    let installed = tracing_subscriber::registry()
        .with(filter(debug_enabled))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .is_ok();
    if installed {
        LOG_PATH.set(path).ok();
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}
