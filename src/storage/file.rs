//! JSON file stores with atomic replace

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{DatasetStore, SettingsStore};
use crate::error::{Result, SyncError};
use crate::types::{LocalDataset, Settings};

pub const DATASET_FILE: &str = "bookmarks.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// Write `bytes` to `path` via a temp file in the same directory and a rename
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SyncError::Io(e.error))?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Dataset and settings kept as two JSON files in a data directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dataset_path: PathBuf,
    settings_path: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `dir` using the default file names
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            dataset_path: dir.join(DATASET_FILE),
            settings_path: dir.join(SETTINGS_FILE),
        }
    }

    pub fn with_paths(dataset_path: PathBuf, settings_path: PathBuf) -> Self {
        Self {
            dataset_path,
            settings_path,
        }
    }

    pub fn dataset_path(&self) -> &Path {
        &self.dataset_path
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }
}

impl DatasetStore for JsonFileStore {
    fn load(&self) -> Result<LocalDataset> {
        match read_optional(&self.dataset_path)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(LocalDataset::default()),
        }
    }

    fn replace(&self, dataset: &LocalDataset) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(dataset)?;
        write_atomic(&self.dataset_path, &bytes)?;
        tracing::debug!(
            path = %self.dataset_path.display(),
            nodes = dataset.node_count(),
            "Local dataset replaced"
        );
        Ok(())
    }

    fn raw(&self) -> Result<Option<Vec<u8>>> {
        read_optional(&self.dataset_path)
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> Result<Settings> {
        match read_optional(&self.settings_path)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => {
                let settings = Settings::first_run();
                self.save(&settings)?;
                tracing::info!(
                    path = %self.settings_path.display(),
                    client = %settings.client.identifier,
                    "Created default settings"
                );
                Ok(settings)
            }
        }
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(settings)?;
        write_atomic(&self.settings_path, &bytes)
    }
}
