//! Boot-time log rotation.
//!
//! Every `*.log` in the log directory is copied into a timestamped
//! snapshot under `history/`, the canonical logs are truncated in place
//! (handles the children already hold stay valid), and old snapshots are
//! pruned. Rotation is cosmetic; nothing here may stop the boot.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::paths::CANONICAL_LOGS;

const MAX_HISTORY: usize = 10;

pub fn rotate(log_dir: &Path) {
    let history = log_dir.join("history");
    if let Err(e) = std::fs::create_dir_all(&history) {
        warn!(dir = %history.display(), error = %e, "cannot create log history dir; skipping rotation");
        return;
    }

    snapshot_logs(log_dir, &history);
    truncate_canonical(log_dir);
    prune_history(&history);
}

/// Copy existing logs into `history/<timestamp>/`. The snapshot dir is
/// only created once the first log file is found, so an empty log dir
/// produces no snapshot.
fn snapshot_logs(log_dir: &Path, history: &Path) {
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %log_dir.display(), error = %e, "cannot read log dir; skipping rotation");
            return;
        }
    };

    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let snapshot = history.join(stamp);
    let mut created = false;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }
        if !created {
            if let Err(e) = std::fs::create_dir_all(&snapshot) {
                warn!(dir = %snapshot.display(), error = %e, "cannot create snapshot dir");
                return;
            }
            created = true;
        }
        if let Some(name) = path.file_name() {
            if let Err(e) = std::fs::copy(&path, snapshot.join(name)) {
                warn!(file = %path.display(), error = %e, "cannot snapshot log file");
            }
        }
    }
}

/// Truncate logs that exist. Missing files are left missing.
fn truncate_canonical(log_dir: &Path) {
    for name in CANONICAL_LOGS {
        let path = log_dir.join(name);
        if !path.exists() {
            continue;
        }
        match std::fs::OpenOptions::new().write(true).truncate(true).open(&path) {
            Ok(_) => debug!(file = %path.display(), "truncated"),
            Err(e) => warn!(file = %path.display(), error = %e, "cannot truncate log file"),
        }
    }
}

/// Keep the newest `MAX_HISTORY` snapshots. The timestamp format sorts
/// lexicographically, so directory names double as sort keys.
fn prune_history(history: &Path) {
    let entries = match std::fs::read_dir(history) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %history.display(), error = %e, "cannot read history dir");
            return;
        }
    };

    let mut snapshots: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    if snapshots.len() <= MAX_HISTORY {
        return;
    }

    snapshots.sort();
    let excess = snapshots.len() - MAX_HISTORY;
    for old in snapshots.into_iter().take(excess) {
        match std::fs::remove_dir_all(&old) {
            Ok(()) => debug!(dir = %old.display(), "pruned old log snapshot"),
            Err(e) => warn!(dir = %old.display(), error = %e, "cannot prune log snapshot"),
        }
    }
}
