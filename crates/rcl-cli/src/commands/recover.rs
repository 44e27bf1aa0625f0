use super::{json_pretty, store_err, Store, StoreOptions, EXIT_SUCCESS};

pub fn run(opts: &StoreOptions, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;
    let rolled_back = store.snapshotter.recover().map_err(store_err)?;
    // Ownerless snapshots with no WAL entry are left for gc.
    let stale = store.snapshotter.stale().map_err(store_err)?;

    if json {
        let keys: Vec<&str> = stale.iter().map(|s| s.key.as_str()).collect();
        let payload = serde_json::json!({
            "rolled_back": rolled_back,
            "stale_views": keys,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("recover: rolled back {rolled_back} abandoned build(s)");
        if !stale.is_empty() {
            println!("{} stale view(s) remain; run `rcl gc` to remove them", stale.len());
        }
    }
    Ok(EXIT_SUCCESS)
}
