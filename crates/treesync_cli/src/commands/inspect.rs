//! Inspect command implementation.

use super::session::{Options, AUTHORITY_DIR, LOCAL_DIR};
use serde::Serialize;
use std::error::Error;
use std::path::Path;
use treesync_core::{inspect, store_files, LogStats};
use treesync_storage::FileBackend;

/// Statistics of one store under the CLI directory.
#[derive(Debug, Serialize)]
pub struct StoreReport {
    /// `local` or `authority`.
    pub name: &'static str,
    /// Store directory.
    pub path: String,
    /// Log statistics.
    pub stats: LogStats,
}

fn report(name: &'static str, path: &Path) -> Result<Option<StoreReport>, Box<dyn Error>> {
    let (wal_path, snapshot_path) = store_files(path);
    if !wal_path.exists() && !snapshot_path.exists() {
        return Ok(None);
    }
    let wal = FileBackend::open(&wal_path)?;
    let snapshot = FileBackend::open(&snapshot_path)?;
    Ok(Some(StoreReport {
        name,
        path: path.display().to_string(),
        stats: inspect(&wal, &snapshot)?,
    }))
}

/// Runs the inspect command. Reads the files without taking the store
/// locks.
pub fn run(options: &Options) -> Result<(), Box<dyn Error>> {
    let mut reports = Vec::new();
    for (name, dir) in [("local", LOCAL_DIR), ("authority", AUTHORITY_DIR)] {
        if let Some(found) = report(name, &options.store.join(dir))? {
            reports.push(found);
        }
    }
    if reports.is_empty() {
        return Err(format!("No store found at {:?}", options.store).into());
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    for report in &reports {
        let stats = &report.stats;
        println!("{} store: {}", report.name, report.path);
        println!("  WAL:       {} bytes, {} frames", stats.wal_bytes, stats.frames);
        println!(
            "  Records:   {} puts, {} deletes, {} outbound, {} commits, {} acks",
            stats.puts, stats.deletes, stats.outbound, stats.commits, stats.acks
        );
        println!(
            "  Snapshot:  {} bytes, {} nodes, {} pending",
            stats.snapshot_bytes, stats.snapshot_nodes, stats.snapshot_pending
        );
        if stats.torn_tail {
            println!("  Warning: log ends in a partial frame");
        }
    }
    Ok(())
}
