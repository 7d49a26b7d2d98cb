use std::fs::{create_dir_all, OpenOptions};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, OnceLock,
};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DIAG_ENV: &str = "SPACES_DIAG";
const LOG_ENV: &str = "SPACES_LOG";

static DIAG_ENABLED: AtomicBool = AtomicBool::new(false);
static DIAG_ENABLED_INIT: OnceLock<()> = OnceLock::new();

/// Explicitly set diagnostics enabled state. Call early in main().
/// If not called, falls back to checking SPACES_DIAG env var.
pub fn set_enabled(enabled: bool) {
    DIAG_ENABLED.store(enabled, Ordering::Relaxed);
    let _ = DIAG_ENABLED_INIT.set(());
}

pub fn diagnostics_enabled() -> bool {
    if DIAG_ENABLED_INIT.get().is_some() {
        return DIAG_ENABLED.load(Ordering::Relaxed);
    }

    let env_enabled = std::env::var(DIAG_ENV)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);
    if env_enabled {
        DIAG_ENABLED.store(true, Ordering::Relaxed);
    }
    let _ = DIAG_ENABLED_INIT.set(());
    env_enabled
}

fn diagnostics_path() -> Option<PathBuf> {
    static PATH: OnceLock<Option<PathBuf>> = OnceLock::new();
    PATH.get_or_init(|| Some(log_dir()?.join("diagnostics.log")))
        .clone()
}

pub fn log_dir() -> Option<PathBuf> {
    static DIR: OnceLock<Option<PathBuf>> = OnceLock::new();
    DIR.get_or_init(|| {
        let home = dirs::home_dir()?;
        Some(home.join(".spaces").join("logs"))
    })
    .clone()
}

/// Installs the process-wide tracing subscriber.
///
/// Events always go to stderr, filtered by `SPACES_LOG` (default `info`,
/// or `debug` while diagnostics are on). With diagnostics enabled they are
/// also appended to `~/.spaces/logs/diagnostics.log`. Calling this twice
/// is harmless; the second subscriber is ignored.
pub fn init(debug: bool) {
    if debug {
        set_enabled(true);
    }
    let enabled = diagnostics_enabled();
    let default_level = if enabled { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = if enabled {
        diagnostics_path().and_then(|path| {
            if let Some(parent) = path.parent() {
                let _ = create_dir_all(parent);
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()
                .map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        })
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_enabled_overrides_env() {
        set_enabled(true);
        assert!(diagnostics_enabled(), "explicit enable must win");
        set_enabled(false);
        assert!(!diagnostics_enabled(), "explicit disable must win");
    }

    #[test]
    fn test_log_dir_lives_under_spaces_home() {
        if let Some(dir) = log_dir() {
            let dir = dir.to_string_lossy().to_string();
            assert!(dir.contains(".spaces"), "log dir must be under ~/.spaces");
            assert!(dir.ends_with("logs"), "log dir must be named logs");
        }
    }
}
