use super::{json_pretty, store_err, Store, StoreOptions, EXIT_SUCCESS};
use rcl_store::Snapshotter;

pub fn run(opts: &StoreOptions, key: &str, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;
    store.snapshotter.remove(key).map_err(store_err)?;

    if json {
        println!("{}", json_pretty(&serde_json::json!({ "removed": key }))?);
    } else {
        println!("removed snapshot {key}");
    }
    Ok(EXIT_SUCCESS)
}
