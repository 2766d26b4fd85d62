//! The `list` command: snapshots per project, newest first.

use crate::error::Result;
use crate::models::SnapshotInfo;

pub fn print_snapshots(snapshots: &[SnapshotInfo], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("No snapshots.");
        return Ok(());
    }

    println!("{:<24} {:<20} {:<17} LATEST", "PROJECT", "BRANCH", "TIMESTAMP");
    for s in snapshots {
        println!(
            "{:<24} {:<20} {:<17} {}",
            s.project,
            s.branch.as_deref().unwrap_or("-"),
            s.timestamp,
            if s.is_latest { "*" } else { "" }
        );
    }
    Ok(())
}
