use super::{json_pretty, store_err, Store, StoreOptions, EXIT_STORE_ERROR, EXIT_SUCCESS};
use rcl_store::verify_store_integrity;

pub fn run(opts: &StoreOptions, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;
    let report = verify_store_integrity(&store.layout).map_err(store_err)?;

    if json {
        let failed: Vec<_> = report
            .failed
            .iter()
            .map(|f| serde_json::json!({ "subject": f.subject, "reason": f.reason }))
            .collect();
        let payload = serde_json::json!({
            "blobs": { "checked": report.blobs_checked, "passed": report.blobs_passed },
            "snapshots": { "checked": report.snapshots_checked, "passed": report.snapshots_passed },
            "images": { "checked": report.images_checked, "passed": report.images_passed },
            "failed": failed,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "store integrity: {}/{} blobs, {}/{} snapshots, {}/{} images passed",
            report.blobs_passed,
            report.blobs_checked,
            report.snapshots_passed,
            report.snapshots_checked,
            report.images_passed,
            report.images_checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.subject, f.reason);
        }
    }

    if report.failed.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
