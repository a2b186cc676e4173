//! Local dataset and settings storage

mod backend;
mod file;
mod memory;

pub use backend::{DatasetStore, SettingsStore};
pub use file::{JsonFileStore, DATASET_FILE, SETTINGS_FILE};
pub use memory::MemoryStore;
