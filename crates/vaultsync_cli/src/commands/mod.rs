//! CLI command implementations.

pub mod dump;
pub mod inspect;
pub mod verify;

use clap::ValueEnum;
use std::path::Path;
use vaultsync_store::{ChangeStore, StoreConfig};

/// How `inspect` and `dump` render their results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Aligned columns for a terminal.
    Text,
    /// Pretty-printed JSON for scripts.
    Json,
}

/// Opens an existing store for reading.
///
/// Replay runs without repair, so damaged or torn bytes are reported and
/// left exactly where they are.
pub(crate) fn open_existing(path: &Path) -> Result<ChangeStore, Box<dyn std::error::Error>> {
    let config = StoreConfig::default()
        .create_if_missing(false)
        .sync_on_write(false)
        .repair(false);
    Ok(ChangeStore::open(path, config)?)
}
