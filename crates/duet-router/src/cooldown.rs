use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long local routing stays suppressed after repeated OOM events.
pub const COOLDOWN_MINUTES: i64 = 15;

/// The one piece of router state deliberately shared between independent
/// processes on disk, so every agent sharing the inference host observes the
/// same pressure window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub memory_pressure: bool,
    pub last_oom: DateTime<Utc>,
    pub consecutive_oom_count: u32,
    pub cooldown_until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CooldownState {
    /// No cooldown on record.
    Clear,
    /// A window was on record but its deadline passed; the file has been
    /// removed.
    Expired(CooldownRecord),
    /// The window is still open.
    Active(CooldownRecord),
}

pub struct CooldownGate {
    path: PathBuf,
}

impl CooldownGate {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn engage(&self, consecutive_oom_count: u32) -> CooldownRecord {
        let now = Utc::now();
        let record = CooldownRecord {
            memory_pressure: true,
            last_oom: now,
            consecutive_oom_count,
            cooldown_until: now + Duration::minutes(COOLDOWN_MINUTES),
        };
        match serde_json::to_string_pretty(&record) {
            Ok(data) => {
                if let Err(err) = std::fs::write(&self.path, data) {
                    tracing::warn!(
                        "could not write cooldown file {}: {}",
                        self.path.display(),
                        err
                    );
                }
            }
            Err(err) => tracing::warn!("could not serialize cooldown record: {}", err),
        }
        record
    }

    /// Read the shared window. Expiry is self-healing: a past deadline
    /// deletes the file so no external timer is needed.
    pub fn check(&self) -> CooldownState {
        if !self.path.exists() {
            return CooldownState::Clear;
        }
        let record: CooldownRecord = match std::fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
        {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(
                    "could not read cooldown file {}: {}",
                    self.path.display(),
                    err
                );
                return CooldownState::Clear;
            }
        };

        if Utc::now() > record.cooldown_until {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(
                    "could not remove expired cooldown file {}: {}",
                    self.path.display(),
                    err
                );
            }
            CooldownState::Expired(record)
        } else {
            CooldownState::Active(record)
        }
    }

    pub fn clear(&self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engage_writes_a_window_about_fifteen_minutes_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gate = CooldownGate::new(dir.path().join("cooldown.json"));

        let before = Utc::now();
        let record = gate.engage(3);
        let expected = before + Duration::minutes(COOLDOWN_MINUTES);
        let skew = (record.cooldown_until - expected).num_seconds().abs();
        assert!(skew <= 1, "cooldown_until off by {}s", skew);

        match gate.check() {
            CooldownState::Active(active) => {
                assert!(active.memory_pressure);
                assert_eq!(active.consecutive_oom_count, 3);
            }
            other => panic!("expected active window, got {:?}", other),
        }
    }

    #[test]
    fn expired_window_removes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cooldown.json");
        let gate = CooldownGate::new(&path);

        let past = Utc::now() - Duration::minutes(1);
        let record = CooldownRecord {
            memory_pressure: true,
            last_oom: past - Duration::minutes(COOLDOWN_MINUTES),
            consecutive_oom_count: 3,
            cooldown_until: past,
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        assert!(matches!(gate.check(), CooldownState::Expired(_)));
        assert!(!path.exists());
        assert!(matches!(gate.check(), CooldownState::Clear));
    }

    #[test]
    fn unreadable_window_reports_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cooldown.json");
        std::fs::write(&path, "not json").unwrap();
        let gate = CooldownGate::new(&path);
        assert!(matches!(gate.check(), CooldownState::Clear));
    }
}
