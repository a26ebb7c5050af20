//! Dot-directory layout and small persisted settings.
//!
//! Mirrors the teacher's `SettingsManager`: one directory under the user's
//! home (overridable via `TETHER_HOME`), 0600 permissions on anything we
//! write there, and a couple of small JSON files underneath it.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolve the per-install dot-directory, default `~/.tether`.
pub fn tether_home() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TETHER_HOME") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| crate::error::TetherError::Internal("no home directory".into()))?;
    Ok(home.join(".tether"))
}

pub fn schedules_path(home: &Path) -> PathBuf {
    home.join("schedules.json")
}

pub fn runs_dir(home: &Path) -> PathBuf {
    home.join("runs")
}

pub fn preferences_path(home: &Path) -> PathBuf {
    home.join("preferences.json")
}

/// `{notificationsEnabled: bool}`, persisted as JSON under the dot-directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preferences {
    #[serde(rename = "notificationsEnabled")]
    pub notifications_enabled: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            notifications_enabled: false,
        }
    }
}

impl Preferences {
    pub fn load(home: &Path) -> Self {
        let path = preferences_path(home);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        std::fs::create_dir_all(home)?;
        let path = preferences_path(home);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        set_owner_only(&path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn preferences_round_trip() {
        let dir = TempDir::new().unwrap();
        let prefs = Preferences {
            notifications_enabled: true,
        };
        prefs.save(dir.path()).unwrap();
        let loaded = Preferences::load(dir.path());
        assert_eq!(loaded, prefs);
    }

    #[test]
    fn missing_preferences_file_yields_default() {
        let dir = TempDir::new().unwrap();
        let loaded = Preferences::load(dir.path());
        assert_eq!(loaded, Preferences::default());
    }
}
