use crate::CoreError;
use rcl_store::Mount;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::{debug, warn};

static MOUNT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Upper and lower branches extracted from union mount options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branches {
    pub upper: PathBuf,
    pub lower: Vec<PathBuf>,
}

/// Find the writable layer of an overlay mount.
///
/// Only `upperdir=` is required; `lowerdir=` is split on `:` when present.
pub fn overlay_branches(options: &[String]) -> Result<Branches, CoreError> {
    let mut upper = None;
    let mut lower = Vec::new();
    for o in options {
        if let Some(u) = o.strip_prefix("upperdir=") {
            upper = Some(PathBuf::from(u));
        } else if let Some(l) = o.strip_prefix("lowerdir=") {
            lower = l.split(':').map(PathBuf::from).collect();
        }
    }
    let upper = upper.ok_or_else(|| CoreError::Mount("upperdir not found".to_owned()))?;
    Ok(Branches { upper, lower })
}

/// Parse aufs `br:<upper>=rw[:<lower>=ro+wh]*` options.
pub fn aufs_branches(options: &[String]) -> Result<Branches, CoreError> {
    let mut upper: Option<PathBuf> = None;
    let mut lower = Vec::new();
    for o in options {
        let Some(branches) = o.strip_prefix("br:") else {
            continue;
        };
        for b in branches.split(':') {
            if let Some(rw) = b.strip_suffix("=rw") {
                if upper.is_some() {
                    return Err(CoreError::Mount("multiple rw branch found".to_owned()));
                }
                upper = Some(PathBuf::from(rw));
            } else if let Some(ro) = b.strip_suffix("=ro+wh") {
                if upper.is_none() {
                    return Err(CoreError::Mount("rw branch must be first".to_owned()));
                }
                lower.push(PathBuf::from(ro));
            } else {
                return Err(CoreError::Mount(format!("unhandled aufs suffix in '{b}'")));
            }
        }
    }
    let upper = upper.ok_or_else(|| CoreError::Mount("rw branch not found".to_owned()))?;
    Ok(Branches { upper, lower })
}

/// Whether this process runs inside a user namespace.
///
/// Overlay whiteouts are character devices, and `mknod` of those is refused
/// inside a user namespace, so the overlay fast path is skipped there.
pub fn running_in_userns() -> bool {
    static IN_USERNS: OnceLock<bool> = OnceLock::new();
    *IN_USERNS.get_or_init(|| match fs::read_to_string("/proc/self/uid_map") {
        Ok(map) => !is_initial_uid_map(&map),
        Err(_) => false,
    })
}

fn is_initial_uid_map(map: &str) -> bool {
    let fields: Vec<&str> = map.split_whitespace().collect();
    fields == ["0", "0", "4294967295"]
}

/// Check if a path is currently a mount point by inspecting /proc/mounts.
pub(crate) fn is_mounted(path: &Path) -> bool {
    let canonical = match fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    };
    match fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(&canonical)),
        Err(_) => false,
    }
}

/// A snapshot's mounts made visible at a local path for the guard's lifetime.
///
/// A single `bind` mount is used in place. Anything else is mounted with
/// `mount(8)` on a fresh directory under `scratch` and unmounted when the
/// guard drops, including during unwinding.
#[derive(Debug)]
pub struct TempMount {
    root: PathBuf,
    mounted: bool,
    created: bool,
}

impl TempMount {
    pub fn new(mounts: &[Mount], scratch: &Path) -> Result<Self, CoreError> {
        match mounts {
            [] => Err(CoreError::Mount("no mounts to attach".to_owned())),
            [m] if m.kind == "bind" => Ok(Self {
                root: PathBuf::from(&m.source),
                mounted: false,
                created: false,
            }),
            _ => Self::attach(mounts, scratch),
        }
    }

    fn attach(mounts: &[Mount], scratch: &Path) -> Result<Self, CoreError> {
        fs::create_dir_all(scratch)?;
        let n = MOUNT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = scratch.join(format!("mount-{}-{n}", std::process::id()));
        fs::create_dir(&root)?;
        let mut guard = Self {
            root,
            mounted: false,
            created: true,
        };
        for m in mounts {
            mount_one(m, &guard.root)?;
            guard.mounted = true;
        }
        debug!("mounted {} mount(s) at {}", mounts.len(), guard.root.display());
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

fn mount_one(m: &Mount, target: &Path) -> Result<(), CoreError> {
    let mut cmd = Command::new("mount");
    if m.kind != "bind" {
        cmd.args(["-t", &m.kind]);
    }
    if !m.options.is_empty() {
        cmd.args(["-o", &m.options.join(",")]);
    }
    cmd.arg(&m.source).arg(target);
    let output = cmd
        .stdout(Stdio::null())
        .output()
        .map_err(|e| CoreError::Mount(format!("failed to run mount: {e}")))?;
    if !output.status.success() {
        return Err(CoreError::Mount(format!(
            "mount -t {} {} {} failed: {}",
            m.kind,
            m.source,
            target.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

impl Drop for TempMount {
    fn drop(&mut self) {
        if self.mounted {
            let status = Command::new("umount")
                .arg(&self.root)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if !matches!(status, Ok(s) if s.success()) && is_mounted(&self.root) {
                warn!("failed to unmount {}", self.root.display());
                // Never remove a directory that still has a filesystem on it.
                return;
            }
        }
        if self.created {
            if let Err(e) = fs::remove_dir(&self.root) {
                warn!("failed to remove mount point {}: {e}", self.root.display());
            }
        }
    }
}
