//! What to resume after an unclean shutdown.

use crate::error::Result;
use crate::log_line::LineId;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartState {
    pub log_name: String,
    #[serde(default)]
    pub current: Option<LineId>,
    #[serde(default)]
    pub next: Option<LineId>,
    #[serde(default)]
    pub running: bool,
    pub saved_at: NaiveDateTime,
}

impl RestartState {
    /// Load a saved state; missing or corrupt files mean nothing to resume.
    pub fn load(path: &Path) -> Option<Self> {
        let data = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("ignoring corrupt restart file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write atomically via a temp file in the same directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn clear(path: &Path) {
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn state() -> RestartState {
        RestartState {
            log_name: "morning".into(),
            current: Some(4),
            next: Some(5),
            running: true,
            saved_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(6, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.json");
        state().save(&path).unwrap();
        assert_eq!(RestartState::load(&path), Some(state()));
        RestartState::clear(&path);
        assert_eq!(RestartState::load(&path), None);
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.json");
        fs::write(&path, "{").unwrap();
        assert_eq!(RestartState::load(&path), None);
    }
}
