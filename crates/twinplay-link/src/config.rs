use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 9998;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// TCP port the host listens on, and the port a remote dials when the
    /// address names none.
    pub port: u16,
    /// Envelopes the host may queue ahead of the peer before its clock blocks.
    pub max_pending_updates: usize,
    /// Envelopes the remote may hold undelivered before it stops reading.
    pub max_delivered_updates: usize,
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_pending_updates: 20,
            max_delivered_updates: 20,
            poll_interval_ms: 20,
            connect_timeout_ms: 3000,
        }
    }
}

impl LinkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// A zero-capacity queue would turn every hand-off into a rendezvous
    /// with the peer, so both bounds are at least one.
    fn sanitized(mut self) -> Self {
        for (name, bound) in [
            ("max_pending_updates", &mut self.max_pending_updates),
            ("max_delivered_updates", &mut self.max_delivered_updates),
        ] {
            if *bound == 0 {
                warn!("Link config: {name} = 0 is not usable, raising to 1");
                *bound = 1;
            }
        }
        self
    }
}

const CONFIG_DIR: &str = "twinplay";
const CONFIG_FILE: &str = "link.toml";

/// `$TWINPLAY_LINK_CONFIG` if set, otherwise `link.toml` under the platform
/// config directory.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TWINPLAY_LINK_CONFIG") {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    let base = std::env::var_os("APPDATA").map(PathBuf::from);
    #[cfg(not(target_os = "windows"))]
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")));

    match base {
        Some(dir) => dir.join(CONFIG_DIR).join(CONFIG_FILE),
        None => PathBuf::from(CONFIG_FILE),
    }
}

/// Reads link settings from `path`. A missing file is normal and silently
/// yields defaults; anything else unreadable is logged first.
pub fn load_from_file(path: &Path) -> LinkConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LinkConfig::default(),
        Err(e) => {
            warn!("Link config {} unreadable ({e}); using defaults", path.display());
            return LinkConfig::default();
        }
    };

    match toml::from_str::<LinkConfig>(&text) {
        Ok(cfg) => cfg.sanitized(),
        Err(e) => {
            warn!("Link config {} is malformed ({e}); using defaults", path.display());
            LinkConfig::default()
        }
    }
}

pub fn save_to_file(path: &Path, cfg: &LinkConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = toml::to_string_pretty(cfg).map_err(std::io::Error::other)?;
    std::fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_file(&dir.path().join("absent.toml"));
        assert_eq!(cfg, LinkConfig::default());
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("link.toml");
        std::fs::write(&path, "port = 4000\npoll_interval_ms = 5\n").expect("write");
        let cfg = load_from_file(&path);
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(5));
        assert_eq!(cfg.max_pending_updates, 20);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("link.toml");
        std::fs::write(&path, "port = \"not a number\"").expect("write");
        assert_eq!(load_from_file(&path), LinkConfig::default());
    }

    #[test]
    fn zero_queue_bounds_are_raised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("link.toml");
        std::fs::write(&path, "max_pending_updates = 0\nmax_delivered_updates = 0\n")
            .expect("write");
        let cfg = load_from_file(&path);
        assert_eq!(cfg.max_pending_updates, 1);
        assert_eq!(cfg.max_delivered_updates, 1);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("link.toml");
        let cfg = LinkConfig {
            port: 12345,
            connect_timeout_ms: 750,
            ..LinkConfig::default()
        };
        save_to_file(&path, &cfg).expect("save");
        assert_eq!(load_from_file(&path), cfg);
    }
}
