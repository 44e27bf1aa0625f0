use super::{colorize_kind, json_pretty, short_digest, store_err, Store, StoreOptions, EXIT_SUCCESS};
use rcl_store::Snapshotter;

pub fn run(opts: &StoreOptions, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;
    let mut snapshots = store.snapshotter.list().map_err(store_err)?;
    snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));

    if json {
        println!("{}", json_pretty(&snapshots)?);
    } else if snapshots.is_empty() {
        println!("no snapshots.");
    } else {
        println!("{:<24} {:<12} PARENT", "KEY", "KIND");
        for s in &snapshots {
            println!(
                "{:<24} {:<12} {}",
                short_digest(&s.key),
                colorize_kind(s.kind),
                s.parent.as_deref().map_or("-", short_digest)
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
