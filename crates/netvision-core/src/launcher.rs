//! Viewer tab opening.
//!
//! Several processes may decide "the viewer should be on screen now" at
//! almost the same moment (the supervisor after boot, the trigger on reuse).
//! A tiny lock file in the temp directory records the last open so rapid
//! repeats for the same URL are suppressed. The lock is advisory with
//! last-writer-wins semantics; the worst case under a true race is one
//! duplicate tab.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::now_millis;

/// How long a recorded open suppresses repeats.
pub const LOCK_EXPIRY: Duration = Duration::from_millis(10_000);

const LOCK_FILE: &str = "netvision-viewer.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub url: String,
    pub timestamp: i64,
}

pub struct TabGuard {
    path: PathBuf,
    expiry: Duration,
}

impl Default for TabGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl TabGuard {
    pub fn new() -> Self {
        Self {
            path: std::env::temp_dir().join(LOCK_FILE),
            expiry: LOCK_EXPIRY,
        }
    }

    pub fn with_path(path: PathBuf, expiry: Duration) -> Self {
        Self { path, expiry }
    }

    /// Decide whether the caller should open a tab for `url`, recording the
    /// decision. Returns `false` when a fresh record for the same URL
    /// already exists.
    pub fn should_open(&self, url: &str) -> bool {
        let now = now_millis();
        if let Some(record) = self.read() {
            let age = now - record.timestamp;
            if record.url == url && age >= 0 && (age as u128) < self.expiry.as_millis() {
                return false;
            }
        }
        self.write(&LockRecord {
            url: url.to_string(),
            timestamp: now,
        });
        true
    }

    fn read(&self) -> Option<LockRecord> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write(&self, record: &LockRecord) {
        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        if let Err(e) = std::fs::write(&self.path, payload) {
            // Advisory only; failing to record just risks a duplicate tab.
            debug!(path = %self.path.display(), error = %e, "Failed to write tab lock");
        }
    }
}

/// Open the viewer in the default browser unless a recent open suppresses
/// it.
pub fn open_viewer(guard: &TabGuard, url: &str) {
    if !guard.should_open(url) {
        debug!(url, "Viewer tab opened recently, skipping");
        return;
    }
    match open::that(url) {
        Ok(()) => info!(url, "Opened viewer tab"),
        Err(e) => warn!(url, error = %e, "Failed to open viewer tab"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_in(dir: &tempfile::TempDir, expiry: Duration) -> TabGuard {
        TabGuard::with_path(dir.path().join(LOCK_FILE), expiry)
    }

    #[test]
    fn test_second_open_within_window_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_in(&dir, Duration::from_secs(10));
        assert!(guard.should_open("http://localhost:5173"));
        assert!(!guard.should_open("http://localhost:5173"));
    }

    #[test]
    fn test_different_url_opens() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_in(&dir, Duration::from_secs(10));
        assert!(guard.should_open("http://localhost:5173"));
        assert!(guard.should_open("http://localhost:5174"));
    }

    #[test]
    fn test_expired_record_opens_again() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_in(&dir, Duration::from_millis(30));
        assert!(guard.should_open("http://localhost:5173"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(guard.should_open("http://localhost:5173"));
    }

    #[test]
    fn test_guards_share_state_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = guard_in(&dir, Duration::from_secs(10));
        let second = guard_in(&dir, Duration::from_secs(10));
        assert!(first.should_open("http://localhost:5173"));
        // A different process consulting the same lock backs off too.
        assert!(!second.should_open("http://localhost:5173"));
    }

    #[test]
    fn test_garbage_lock_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        std::fs::write(&path, "not json").unwrap();
        let guard = TabGuard::with_path(path, Duration::from_secs(10));
        assert!(guard.should_open("http://localhost:5173"));
    }
}
