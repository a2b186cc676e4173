//! Local persistence seams
//!
//! The bookmark model and the settings editor live outside this crate; the
//! engine only needs to read both and replace the dataset wholesale after a
//! restore.

use crate::error::Result;
use crate::types::{LocalDataset, Settings};

/// Access to the local bookmark dataset
pub trait DatasetStore: Send + Sync {
    /// Current dataset (empty when nothing was stored yet)
    fn load(&self) -> Result<LocalDataset>;

    /// Replace the stored dataset in a single write
    fn replace(&self, dataset: &LocalDataset) -> Result<()>;

    /// Serialized form as stored, for byte-level comparisons and export
    fn raw(&self) -> Result<Option<Vec<u8>>>;
}

/// Access to user settings
pub trait SettingsStore: Send + Sync {
    /// Current settings; the first call persists first-run defaults
    fn load(&self) -> Result<Settings>;

    fn save(&self, settings: &Settings) -> Result<()>;
}
