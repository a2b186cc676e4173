//! Conflict detection between local data and remote snapshots
//!
//! The engine never merges: the newest side by filename timestamp wins, and
//! replacing local data is always the user's call.

mod detector;

pub use detector::{ConflictDetector, RemoteCheck, NEWER_THRESHOLD_MS};
