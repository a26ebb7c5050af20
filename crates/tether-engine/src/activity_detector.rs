//! Activity Detector (§4.3): answers busy/idle/unknown for a working
//! directory by inspecting mtimes of external state files, without
//! touching the target process at all.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tether_core::types::ActivityStatus;

const BUSY_WINDOW: Duration = Duration::from_secs(30);

pub struct ActivityDetector {
    state_dir_for: Box<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>,
}

impl ActivityDetector {
    /// `state_dir_for` maps a working directory to the CLI's own on-disk
    /// state directory for that project, if one exists. The concrete
    /// layout is owned by the target CLI, not by this server.
    pub fn new(state_dir_for: impl Fn(&str) -> Option<PathBuf> + Send + Sync + 'static) -> Self {
        Self {
            state_dir_for: Box::new(state_dir_for),
        }
    }

    pub fn status_for(&self, cwd: &str) -> ActivityStatus {
        let Some(dir) = (self.state_dir_for)(cwd) else {
            return ActivityStatus::Unknown;
        };
        self.status_from_dir(&dir)
    }

    fn status_from_dir(&self, dir: &Path) -> ActivityStatus {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return ActivityStatus::Unknown;
        };

        let now = SystemTime::now();
        let mut ages = Vec::new();

        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            ages.push(now.duration_since(modified).unwrap_or(Duration::ZERO));
        }

        classify(&ages)
    }
}

/// Pure classification: any age under the busy window means busy, any
/// files at all but all stale means idle, no files means unknown.
fn classify(ages: &[Duration]) -> ActivityStatus {
    if ages.is_empty() {
        ActivityStatus::Unknown
    } else if ages.iter().any(|age| *age < BUSY_WINDOW) {
        ActivityStatus::Busy
    } else {
        ActivityStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(b"x").unwrap();
    }

    #[test]
    fn no_state_dir_is_unknown() {
        let detector = ActivityDetector::new(|_| None);
        assert_eq!(detector.status_for("/tmp/project"), ActivityStatus::Unknown);
    }

    #[test]
    fn empty_state_dir_is_unknown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let detector = ActivityDetector::new(move |_| Some(path.clone()));
        assert_eq!(detector.status_for("/tmp/project"), ActivityStatus::Unknown);
    }

    #[test]
    fn recent_file_is_busy() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "state.json");
        let path = dir.path().to_path_buf();
        let detector = ActivityDetector::new(move |_| Some(path.clone()));
        assert_eq!(detector.status_for("/tmp/project"), ActivityStatus::Busy);
    }

    #[test]
    fn classify_treats_any_recent_age_as_busy() {
        let ages = vec![Duration::from_secs(120), Duration::from_secs(5)];
        assert_eq!(classify(&ages), ActivityStatus::Busy);
    }

    #[test]
    fn classify_all_stale_is_idle() {
        let ages = vec![Duration::from_secs(120), Duration::from_secs(3600)];
        assert_eq!(classify(&ages), ActivityStatus::Idle);
    }

    #[test]
    fn classify_no_ages_is_unknown() {
        let ages: Vec<Duration> = Vec::new();
        assert_eq!(classify(&ages), ActivityStatus::Unknown);
    }
}
