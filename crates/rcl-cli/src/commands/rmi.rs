use super::{json_pretty, store_err, Store, StoreOptions, EXIT_SUCCESS};

pub fn run(opts: &StoreOptions, image: &str, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;
    store.images.remove(image).map_err(store_err)?;

    if json {
        println!("{}", json_pretty(&serde_json::json!({ "removed": image }))?);
    } else {
        println!("removed image {image} (run `rcl gc` to reclaim its content)");
    }
    Ok(EXIT_SUCCESS)
}
