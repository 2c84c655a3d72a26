//! Dump command implementation.

use serde::Serialize;
use super::OutputFormat;
use std::path::Path;
use vaultsync_store::ChangeStore;

const PREVIEW_LEN: usize = 60;

/// Stored record representation for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Local sequence number.
    pub seq: u64,
    /// Record id.
    pub id: String,
    /// Payload.
    pub data: String,
    /// Id deleted by this record, if it is a tombstone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstone_of: Option<String>,
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    since: u64,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_existing(path)?;
    let records = read_records(&store, since, limit)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Text => {
            print_text_output(&records);
        }
    }

    Ok(())
}

fn read_records(
    store: &ChangeStore,
    since: u64,
    limit: Option<usize>,
) -> Result<Vec<RecordInfo>, Box<dyn std::error::Error>> {
    let max_records = limit.unwrap_or(usize::MAX);
    let mut records = Vec::new();

    for item in store.get_since(since) {
        if records.len() >= max_records {
            break;
        }
        match item {
            Ok(stored) => {
                let tombstone_of = stored.record.tombstone_target();
                let (id, data) = stored.record.into_parts();
                records.push(RecordInfo {
                    seq: stored.seq,
                    id,
                    data,
                    tombstone_of,
                });
            }
            Err(e) if e.is_record_damage() => {
                tracing::warn!(error = %e, "skipping unreadable record");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(records)
}

fn print_text_output(records: &[RecordInfo]) {
    if records.is_empty() {
        println!("No records");
        return;
    }

    println!("{:>8}  {:<24}  DATA", "SEQ", "ID");
    for record in records {
        let data = match &record.tombstone_of {
            Some(target) => format!("<tombstone of {target}>"),
            None => preview(&record.data),
        };
        println!("{:>8}  {:<24}  {}", record.seq, record.id, data);
    }
    println!();
    println!("{} record(s)", records.len());
}

fn preview(data: &str) -> String {
    if data.chars().count() <= PREVIEW_LEN {
        data.to_string()
    } else {
        let cut: String = data.chars().take(PREVIEW_LEN).collect();
        format!("{cut}...")
    }
}
