// src/install/progress.rs

//! The `install_progress` breadcrumb
//!
//! While the live set is being swapped, a small JSON file records how far
//! the swap got so an interrupted activation can be finished after a crash
//! or reboot. The file is replaced atomically: written to
//! `install_progress.new`, flushed, synced, then renamed over the old one.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

/// Which half of the swap was in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStage {
    /// Stopping services and renaming the live set to `.old`
    Archive,
    /// Renaming `{name}{extension}` into the live names
    MoveNew,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapProgress {
    pub extension: String,
    pub stage: SwapStage,
}

impl SwapProgress {
    pub fn new(extension: &str, stage: SwapStage) -> Self {
        Self {
            extension: extension.to_string(),
            stage,
        }
    }

    /// Atomically replace the breadcrumb at `path`
    pub fn record(&self, path: &Path) -> Result<()> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".new");
        let tmp_path = Path::new(&tmp_name);

        let mut file = File::create(tmp_path)?;
        serde_json::to_writer(&mut file, self)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        fs::rename(tmp_path, path)?;
        debug!("Recorded swap stage {:?} at {}", self.stage, path.display());
        Ok(())
    }

    /// Read the breadcrumb, `None` when no swap is in progress
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents).map(Some).map_err(|e| {
            Error::InstallError(format!("Unexpected state to recover from {}: {e}", contents.trim()))
        })
    }

    pub fn clear(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("install_progress");

        assert_eq!(SwapProgress::load(&path).unwrap(), None);

        SwapProgress::new(".new", SwapStage::Archive).record(&path).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains(r#""stage":"archive""#));
        assert!(!temp.path().join("install_progress.new").exists());

        SwapProgress::new(".new", SwapStage::MoveNew).record(&path).unwrap();
        let loaded = SwapProgress::load(&path).unwrap().unwrap();
        assert_eq!(loaded.stage, SwapStage::MoveNew);
        assert_eq!(loaded.extension, ".new");

        SwapProgress::clear(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_unknown_stage_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("install_progress");
        fs::write(&path, r#"{"extension": ".new", "stage": "bogus"}"#).unwrap();

        let err = SwapProgress::load(&path).unwrap_err();
        assert!(matches!(err, Error::InstallError(_)));
        assert!(err.to_string().starts_with("Unexpected state to recover from"));
    }
}
