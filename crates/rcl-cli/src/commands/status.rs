use super::{json_pretty, Store, StoreOptions, EXIT_FAILURE, EXIT_SUCCESS};
use rcl_schema::chain_id;

/// Exits non-zero when the image is not unpacked.
pub fn run(opts: &StoreOptions, image: &str, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;
    let unpacker = store.unpacker();

    let diff_ids = unpacker.rootfs(image).map_err(|e| e.to_string())?;
    let unpacked = unpacker.is_unpacked(image).map_err(|e| e.to_string())?;
    let chain = chain_id(&diff_ids);
    let rootfs = chain
        .as_ref()
        .filter(|_| unpacked)
        .map(|c| store.snapshotter.fs_path(c.as_str()));

    if json {
        let payload = serde_json::json!({
            "image": image,
            "platform": store.platform.to_string(),
            "layers": diff_ids.len(),
            "chain_id": chain,
            "unpacked": unpacked,
            "rootfs": rootfs,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("image:     {image}");
        println!("platform:  {}", store.platform);
        println!("layers:    {}", diff_ids.len());
        if let Some(c) = &chain {
            println!("chain id:  {c}");
        }
        println!("unpacked:  {}", if unpacked { "yes" } else { "no" });
        if let Some(path) = &rootfs {
            println!("rootfs:    {}", path.display());
        }
    }

    Ok(if unpacked { EXIT_SUCCESS } else { EXIT_FAILURE })
}
