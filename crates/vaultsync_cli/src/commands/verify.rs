//! Verify command implementation.

use std::path::Path;
use vaultsync_store::{scan_dir, LogScan, ScanReport};

/// Outcome of checking one log.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Ok,
    /// Only an incomplete final frame; replay truncates it on the next open.
    TornTail,
    Corrupt,
}

fn verdict(scan: &LogScan) -> Verdict {
    if !scan.damaged.is_empty() {
        Verdict::Corrupt
    } else if scan.torn_bytes > 0 {
        Verdict::TornTail
    } else {
        Verdict::Ok
    }
}

/// Runs the verify command.
///
/// Nothing is repaired. Fails if either log holds an unreadable stretch.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let report = scan_dir(path)?;
    print_result("Changes log", &report.changes);
    print_result("Metadata log", &report.meta);

    println!();
    if passed(&report) {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

fn passed(report: &ScanReport) -> bool {
    verdict(&report.changes) != Verdict::Corrupt && verdict(&report.meta) != Verdict::Corrupt
}

fn print_result(name: &str, scan: &LogScan) {
    println!("{name}:");
    println!("  Size:           {} bytes", scan.size);
    println!("  Valid frames:   {}", scan.frames);
    println!(
        "  Damaged:        {} stretch(es), {} byte(s)",
        scan.damaged.len(),
        scan.damaged_bytes
    );
    for offset in &scan.damaged {
        println!("    - unreadable bytes from offset {offset}");
    }
    if scan.torn_bytes > 0 {
        println!(
            "  Torn tail:      {} byte(s), removed on next open",
            scan.torn_bytes
        );
    }
    let status = match verdict(scan) {
        Verdict::Ok => "ok",
        Verdict::TornTail => "ok (torn tail)",
        Verdict::Corrupt => "CORRUPT",
    };
    println!("  Status:         {status}");
}
