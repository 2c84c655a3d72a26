//! Inspect command implementation.

use serde::Serialize;
use super::OutputFormat;
use std::path::Path;
use vaultsync_store::{ChangeStore, RecoveryReport, StoreStats};

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Store-wide counters.
    pub stats: StoreStats,
    /// Sync state per owner.
    pub owners: Vec<OwnerState>,
    /// What replay found when the store was opened.
    pub recovery: RecoveryReport,
}

/// Sync state of a single owner.
#[derive(Debug, Serialize)]
pub struct OwnerState {
    /// Owner id.
    pub owner: String,
    /// Persisted remote cursor.
    pub cursor: u64,
    /// Records waiting for upload.
    pub pending: usize,
    /// Records the remote log rejected as conflicting.
    pub rejected: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_existing(path)?;
    let result = collect(path, &store)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn collect(path: &Path, store: &ChangeStore) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let owners = store
        .owners()
        .into_iter()
        .map(|owner| OwnerState {
            cursor: store.cursor(&owner).as_u64(),
            pending: store.pending_count(&owner),
            rejected: store.rejected(&owner).len(),
            owner: owner.to_string(),
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        stats: store.stats()?,
        owners,
        recovery: store.recovery_report().clone(),
    })
}

fn print_text_output(result: &InspectResult) {
    let stats = &result.stats;
    println!("Store: {}", result.path);
    println!();
    println!("Records:         {}", stats.records);
    println!("Pending upload:  {}", stats.pending);
    println!("Rejected:        {}", stats.rejected);
    println!("Changes log:     {} bytes", stats.changes_log_bytes);
    println!("Metadata log:    {} bytes", stats.meta_log_bytes);

    if !result.owners.is_empty() {
        println!();
        println!("{:<24} {:>10} {:>8} {:>8}", "OWNER", "CURSOR", "PENDING", "REJECTED");
        for owner in &result.owners {
            println!(
                "{:<24} {:>10} {:>8} {:>8}",
                owner.owner, owner.cursor, owner.pending, owner.rejected
            );
        }
    }

    let recovery = &result.recovery;
    println!();
    if recovery.is_clean() {
        println!("Recovery: clean");
    } else {
        for (name, log) in [("changes log", &recovery.changes), ("metadata log", &recovery.meta)] {
            println!(
                "Recovery: {name} has {} unreadable stretch(es) ({} byte(s)) and a {}-byte torn tail",
                log.skipped, log.skipped_bytes, log.torn_bytes
            );
        }
    }
}
