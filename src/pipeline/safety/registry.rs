use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;

use super::rules::{RuleError, RuleSet};
use crate::config::GuardConfig;

/// Holds the active rule set. Readers take an `Arc` snapshot and keep it for
/// the whole request; a reload swaps the pointer and never mutates a set in
/// place.
pub struct RuleRegistry {
    current: RwLock<Arc<RuleSet>>,
    path: Option<PathBuf>,
    loaded_mtime: Mutex<Option<SystemTime>>,
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl RuleRegistry {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
            path: None,
            loaded_mtime: Mutex::new(None),
        }
    }

    pub fn builtin() -> Result<Self, RuleError> {
        Ok(Self::new(RuleSet::builtin()?))
    }

    /// Load from a rule file that later reloads re-read.
    pub fn from_file(path: &Path) -> Result<Self, RuleError> {
        let mtime = modified_time(path);
        let rules = RuleSet::load(path)?;
        Ok(Self {
            current: RwLock::new(Arc::new(rules)),
            path: Some(path.to_path_buf()),
            loaded_mtime: Mutex::new(mtime),
        })
    }

    pub fn from_config(config: &GuardConfig) -> Result<Self, RuleError> {
        match &config.rules_path {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a new rule set. Requests already holding a snapshot keep
    /// evaluating against the old one.
    pub fn replace(&self, rules: RuleSet) {
        let next = Arc::new(rules);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Re-read the rule file. On error the previous rule set stays active.
    /// Returns `false` for registries without a backing file.
    pub fn reload(&self) -> Result<bool, RuleError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mtime = modified_time(path);
        let rules = RuleSet::load(path)?;
        let version = rules.version.clone();
        self.replace(rules);
        if let Ok(mut loaded) = self.loaded_mtime.lock() {
            *loaded = mtime;
        }
        tracing::info!(version = %version, "Rule set reloaded");
        Ok(true)
    }

    /// Reload only when the file's modification time changed.
    pub fn reload_if_modified(&self) -> Result<bool, RuleError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let current = modified_time(path);
        let unchanged = self
            .loaded_mtime
            .lock()
            .map(|loaded| *loaded == current)
            .unwrap_or(false);
        if unchanged {
            return Ok(false);
        }
        self.reload()
    }

    /// Poll the rule file every `interval` and reload on change. The watcher
    /// stops when the returned handle is dropped.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> RuleWatcher {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registry.reload_if_modified() {
                    tracing::warn!(error = %e, "Rule reload failed, keeping previous rule set");
                }
            }
        });
        RuleWatcher { handle }
    }
}

/// Handle to a running rule watcher task.
pub struct RuleWatcher {
    handle: JoinHandle<()>,
}

impl RuleWatcher {
    pub fn stop(self) {}
}

impl Drop for RuleWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Finding, Severity};

    fn rule_json(version: &str, threshold: f64, severity: &str) -> String {
        format!(
            r#"{{"version": "{version}", "rules": {{"alt": [
                {{"id": "elevated_alt", "high": {threshold}, "inclusive": false, "severity": "{severity}", "message": "ALT {{value}}"}}
            ]}}}}"#
        )
    }

    fn write_rules(path: &Path, json: &str) {
        std::fs::write(path, json).unwrap();
    }

    #[test]
    fn reload_swaps_atomically_and_keeps_old_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        write_rules(&path, &rule_json("1", 40.0, "warning"));

        let registry = RuleRegistry::from_file(&path).unwrap();
        let before = registry.snapshot();
        let finding = Finding::new("ALT", "50");
        assert_eq!(before.evaluate(&[finding.clone()])[0].severity, Severity::Warning);

        write_rules(&path, &rule_json("2", 40.0, "critical"));
        assert!(registry.reload().unwrap());

        assert_eq!(before.version, "1");
        assert_eq!(before.evaluate(&[finding.clone()])[0].severity, Severity::Warning);
        let after = registry.snapshot();
        assert_eq!(after.version, "2");
        assert_eq!(after.evaluate(&[finding])[0].severity, Severity::Critical);
    }

    #[test]
    fn failed_reload_keeps_previous_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        write_rules(&path, &rule_json("1", 40.0, "warning"));
        let registry = RuleRegistry::from_file(&path).unwrap();

        write_rules(&path, "{ broken");
        assert!(registry.reload().is_err());
        assert_eq!(registry.snapshot().version, "1");
        assert_eq!(registry.snapshot().rule_count(), 1);
    }

    #[test]
    fn builtin_registry_has_nothing_to_reload() {
        let registry = RuleRegistry::builtin().unwrap();
        assert!(!registry.reload().unwrap());
        assert!(!registry.reload_if_modified().unwrap());
        assert!(registry.path().is_none());
    }

    #[test]
    fn unchanged_file_is_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        write_rules(&path, &rule_json("1", 40.0, "warning"));
        let registry = RuleRegistry::from_file(&path).unwrap();
        assert!(!registry.reload_if_modified().unwrap());
    }

    #[tokio::test]
    async fn watcher_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        write_rules(&path, &rule_json("1", 40.0, "warning"));
        let registry = Arc::new(RuleRegistry::from_file(&path).unwrap());
        let watcher = registry.spawn_watcher(Duration::from_millis(20));

        // Pin a distinct mtime so coarse filesystem clocks still register a change.
        write_rules(&path, &rule_json("2", 40.0, "critical"));
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
        drop(file);

        let mut reloaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if registry.snapshot().version == "2" {
                reloaded = true;
                break;
            }
        }
        watcher.stop();
        assert!(reloaded);
    }
}
