use super::{json_pretty, spin_fail, spin_ok, spinner, Store, StoreOptions, EXIT_SUCCESS};
use rcl_core::import_oci_layout;
use std::path::Path;

pub fn run(opts: &StoreOptions, dir: &Path, name: Option<&str>, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;

    let pb = (!json).then(|| spinner(&format!("importing {}...", dir.display())));
    let result = import_oci_layout(dir, &store.content, &store.images, name);
    let report = match result {
        Ok(r) => {
            if let Some(pb) = &pb {
                spin_ok(pb, &format!("imported {} blob(s)", r.blobs));
            }
            r
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "import failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        let payload = serde_json::json!({
            "images": report.images,
            "blobs": report.blobs,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        for image in &report.images {
            println!("{image}");
        }
    }
    Ok(EXIT_SUCCESS)
}
