use super::{json_pretty, short_digest, store_err, Store, StoreOptions, EXIT_SUCCESS};

pub fn run(opts: &StoreOptions, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;
    let records = store.images.list().map_err(store_err)?;
    let unpacker = store.unpacker();

    if json {
        let entries: Vec<_> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "target": r.target,
                    "unpacked": matches!(unpacker.is_unpacked(&r.name), Ok(true)),
                    "updated_at": r.updated_at,
                })
            })
            .collect();
        println!("{}", json_pretty(&entries)?);
    } else if records.is_empty() {
        println!("no images.");
    } else {
        println!("{:<40} {:<20} UNPACKED", "NAME", "DIGEST");
        for r in &records {
            let unpacked = matches!(unpacker.is_unpacked(&r.name), Ok(true));
            println!(
                "{:<40} {:<20} {}",
                r.name,
                short_digest(r.target.digest.as_str()),
                if unpacked { "yes" } else { "no" }
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
