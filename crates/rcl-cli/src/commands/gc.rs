use super::{json_pretty, store_err, Store, StoreOptions, EXIT_SUCCESS};
use rcl_core::shutdown_requested;
use rcl_store::GarbageCollector;

pub fn run(opts: &StoreOptions, dry_run: bool, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;
    let report = GarbageCollector::new(store.layout.clone())
        .collect_with_cancel(dry_run, shutdown_requested)
        .map_err(store_err)?;

    if json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "orphaned_snapshots": report.orphaned_snapshots,
            "stale_views": report.stale_views,
            "orphaned_blobs": report.orphaned_blobs,
            "removed_snapshots": report.removed_snapshots,
            "removed_views": report.removed_views,
            "removed_blobs": report.removed_blobs,
        });
        println!("{}", json_pretty(&payload)?);
    } else if dry_run {
        println!(
            "gc: would remove {} snapshots, {} views, {} blobs",
            report.orphaned_snapshots.len(),
            report.stale_views.len(),
            report.orphaned_blobs.len()
        );
        for key in report.orphaned_snapshots.iter().chain(&report.stale_views) {
            println!("  {key}");
        }
    } else {
        println!(
            "gc: removed {} snapshots, {} views, {} blobs",
            report.removed_snapshots, report.removed_views, report.removed_blobs
        );
    }
    Ok(EXIT_SUCCESS)
}
