//! Socket locations. One Unix socket per profile under `~/.spaces/run`.

use std::path::{Path, PathBuf};

use tracing::warn;

/// `~/.spaces/run`, or `/tmp` when there is no home directory.
pub fn run_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".spaces").join("run"),
        None => {
            warn!("spaces_home_unavailable using /tmp for sockets");
            PathBuf::from("/tmp")
        }
    }
}

/// Socket for `profile` in the default run directory.
pub fn socket_path_for(profile: &str) -> PathBuf {
    socket_path_in(&run_dir(), profile)
}

/// Socket for `profile` under `dir`. Characters outside `[A-Za-z0-9_-]`
/// in the profile name become `_`.
pub fn socket_path_in(dir: &Path, profile: &str) -> PathBuf {
    dir.join(format!("spaces-{}.sock", profile_slug(profile)))
}

fn profile_slug(profile: &str) -> String {
    let slug: String = profile
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_names_are_made_path_safe() {
        let dir = Path::new("/run/spaces");
        assert_eq!(
            socket_path_in(dir, "work/profile 1"),
            dir.join("spaces-work_profile_1.sock")
        );
        assert_eq!(
            socket_path_in(dir, ""),
            dir.join("spaces-default.sock"),
            "empty names fall back"
        );
    }

    #[test]
    fn test_default_socket_lives_in_run_dir() {
        let path = socket_path_for("default");
        assert_eq!(path.parent(), Some(run_dir().as_path()));
        assert_eq!(path.file_name().unwrap(), "spaces-default.sock");
    }
}
