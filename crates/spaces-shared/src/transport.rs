use std::io;
use std::path::Path;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(unix)]
pub type LocalStream = UnixStream;

#[cfg(unix)]
pub type LocalListener = UnixListener;

/// Connects to the daemon socket at `path`.
#[cfg(unix)]
pub async fn connect(path: &Path) -> io::Result<LocalStream> {
    UnixStream::connect(path).await
}

/// Binds the daemon socket at `path`, replacing a stale socket file left
/// behind by a previous process.
#[cfg(unix)]
pub fn bind(path: &Path) -> io::Result<LocalListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}
