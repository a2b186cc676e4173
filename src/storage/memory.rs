//! In-memory stores

use parking_lot::RwLock;

use super::{DatasetStore, SettingsStore};
use crate::error::Result;
use crate::types::{LocalDataset, Settings};

/// Dataset and settings held in process memory.
///
/// The dataset is kept serialized so byte-level comparisons behave the same
/// as with the file store.
#[derive(Default)]
pub struct MemoryStore {
    dataset: RwLock<Option<Vec<u8>>>,
    settings: RwLock<Option<Settings>>,
    writes: RwLock<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(dataset: &LocalDataset, settings: Settings) -> Result<Self> {
        let store = Self::new();
        *store.dataset.write() = Some(serde_json::to_vec(dataset)?);
        *store.settings.write() = Some(settings);
        Ok(store)
    }

    /// Number of dataset replacements so far
    pub fn dataset_writes(&self) -> usize {
        *self.writes.read()
    }

    /// Apply a local mutation the way the bookmark model would
    pub fn mutate(&self, f: impl FnOnce(&mut LocalDataset), now_ms: i64) -> Result<LocalDataset> {
        let mut dataset = DatasetStore::load(self)?;
        f(&mut dataset);
        dataset.touch(now_ms);
        *self.dataset.write() = Some(serde_json::to_vec(&dataset)?);
        Ok(dataset)
    }
}

impl DatasetStore for MemoryStore {
    fn load(&self) -> Result<LocalDataset> {
        match self.dataset.read().as_deref() {
            Some(bytes) => Ok(serde_json::from_slice(bytes)?),
            None => Ok(LocalDataset::default()),
        }
    }

    fn replace(&self, dataset: &LocalDataset) -> Result<()> {
        let bytes = serde_json::to_vec(dataset)?;
        *self.dataset.write() = Some(bytes);
        *self.writes.write() += 1;
        Ok(())
    }

    fn raw(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.dataset.read().clone())
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<Settings> {
        if let Some(settings) = self.settings.read().clone() {
            return Ok(settings);
        }
        let settings = Settings::first_run();
        *self.settings.write() = Some(settings.clone());
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        *self.settings.write() = Some(settings.clone());
        Ok(())
    }
}
