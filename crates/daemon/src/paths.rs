use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::platform::Platform;

/// Log files the daemon owns or rotates. `daemon.log` is the daemon's own
/// log; the rest are written by the children and the front-end but rotated
/// and truncated here so every boot starts from a clean slate.
pub const CANONICAL_LOGS: [&str; 6] = [
    "daemon.log",
    "debug.log",
    "gui.log",
    "scsynth.log",
    "spider.log",
    "tau.log",
];

/// Resolved filesystem layout.
///
/// User state lives under `STUDIO_HOME` (default `~/.studio`); the server
/// collaborators are resolved relative to the daemon executable unless
/// overridden by environment variables.
#[derive(Debug, Clone)]
pub struct Paths {
    user_root: PathBuf,
    server_dir: PathBuf,
}

impl Paths {
    pub fn resolve() -> anyhow::Result<Self> {
        let user_root = match std::env::var_os("STUDIO_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => directories::BaseDirs::new()
                .context("cannot determine the user home directory (set STUDIO_HOME)")?
                .home_dir()
                .join(".studio"),
        };

        let server_dir = match std::env::var_os("STUDIO_SERVER_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let exe = std::env::current_exe().context("cannot locate the daemon executable")?;
                exe.parent()
                    .and_then(Path::parent)
                    .context("daemon executable has no parent directory")?
                    .join("server")
            }
        };

        let paths = Self {
            user_root,
            server_dir,
        };
        std::fs::create_dir_all(paths.log_dir())
            .with_context(|| format!("create log dir {}", paths.log_dir().display()))?;
        std::fs::create_dir_all(paths.config_dir())
            .with_context(|| format!("create config dir {}", paths.config_dir().display()))?;
        Ok(paths)
    }

    /// Layout rooted at an explicit directory. Test hook; `resolve` is the
    /// production entry point.
    #[cfg(test)]
    pub fn for_root(root: &Path) -> Self {
        Self {
            user_root: root.join("user"),
            server_dir: root.join("server"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.user_root.join("log")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.user_root.join("config")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.log_dir().join("daemon.log")
    }

    pub fn scsynth_log(&self) -> PathBuf {
        self.log_dir().join("scsynth.log")
    }

    pub fn spider_log(&self) -> PathBuf {
        self.log_dir().join("spider.log")
    }

    pub fn tau_log(&self) -> PathBuf {
        self.log_dir().join("tau.log")
    }

    /// The language runtime interpreter. `RUBY_PATH` overrides; otherwise
    /// whatever `ruby` resolves to on PATH.
    pub fn ruby(&self) -> PathBuf {
        std::env::var_os("RUBY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ruby"))
    }

    pub fn spider_server_script(&self) -> PathBuf {
        self.server_dir.join("spider").join("spider-server.rb")
    }

    /// The audio engine binary. `SCSYNTH_PATH` overrides; otherwise PATH.
    pub fn scsynth(&self) -> PathBuf {
        std::env::var_os("SCSYNTH_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("scsynth"))
    }

    pub fn tau_boot_script(&self, platform: Platform) -> PathBuf {
        let script = match platform {
            Platform::Windows => "boot.bat",
            _ => "boot.sh",
        };
        self.server_dir.join("tau").join(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_user_root() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::for_root(tmp.path());
        assert!(paths.log_dir().starts_with(tmp.path()));
        assert_eq!(paths.daemon_log(), paths.log_dir().join("daemon.log"));
        assert!(paths.config_dir().ends_with("config"));
    }

    #[test]
    fn tau_launcher_matches_platform() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::for_root(tmp.path());
        let unix = paths.tau_boot_script(Platform::UnixDesktop);
        assert!(unix.ends_with("tau/boot.sh"));
        let win = paths.tau_boot_script(Platform::Windows);
        assert!(win.ends_with("tau/boot.bat"));
    }
}
