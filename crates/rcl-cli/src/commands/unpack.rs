use super::{json_pretty, spin_fail, spin_ok, spinner, store_err, Store, StoreOptions, EXIT_SUCCESS};
use rcl_core::UnpackOptions;
use tracing::info;

pub fn run(opts: &StoreOptions, image: &str, check_platform: bool, json: bool) -> Result<u8, String> {
    let store = Store::open(opts)?;

    let recovered = store.snapshotter.recover().map_err(store_err)?;
    if recovered > 0 {
        info!("rolled back {recovered} abandoned build(s) before unpacking");
    }

    let unpack_opts = UnpackOptions {
        check_platform_supported: check_platform,
    };
    let pb = (!json).then(|| spinner(&format!("unpacking {image}...")));
    let report = match store.unpacker().unpack(image, &unpack_opts) {
        Ok(r) => {
            if let Some(pb) = &pb {
                let msg = if r.applied.is_empty() {
                    format!("{image} already unpacked")
                } else {
                    format!("unpacked {image} ({}/{} layers applied)", r.applied.len(), r.layers)
                };
                spin_ok(pb, &msg);
            }
            r
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "unpack failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        let payload = serde_json::json!({
            "image": report.image,
            "chain_id": report.chain_id,
            "applied": report.applied,
            "layers": report.layers,
            "rootfs": store.snapshotter.fs_path(report.chain_id.as_str()),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{}", report.chain_id);
    }
    Ok(EXIT_SUCCESS)
}
