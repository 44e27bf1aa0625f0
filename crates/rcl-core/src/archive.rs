//! Tar layer extraction with OCI whiteout handling.
//!
//! A layer is a tar stream of changes relative to its parent. Two special
//! names carry deletions: `.wh.<name>` removes `<name>` from the lower
//! layers, and `.wh..wh..opq` hides everything the lower layers put in its
//! directory. How those markers land on disk depends on the target:
//!
//! - [`WhiteoutMode::Apply`]: the target already holds the merged lower
//!   contents (native snapshots, temp mounts), so deletions are performed.
//! - [`WhiteoutMode::Overlay`]: the target is an overlayfs upper directory;
//!   markers become `0:0` character devices and `trusted.overlay.opaque=y`.
//! - [`WhiteoutMode::Passthrough`]: the target is an aufs branch, which reads
//!   `.wh.` files natively, so markers are written as regular entries.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutMode {
    Apply,
    Overlay,
    Passthrough,
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Normalize an archive path to a root-relative one, refusing anything that
/// could resolve outside the extraction root.
fn sanitize(path: &Path) -> io::Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(format!(
                    "archive entry escapes root: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Extract a tar stream into `root`, stopping at the end-of-archive marker.
///
/// Bytes after the marker are left unread in `reader`. Every entry, marker
/// included, must resolve to a directory inside `root`; a parent that is a
/// symlink pointing elsewhere fails the layer with `InvalidData`.
pub fn extract_tar<R: Read>(reader: R, root: &Path, mode: WhiteoutMode) -> io::Result<()> {
    fs::create_dir_all(root)?;
    let real_root = fs::canonicalize(root)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(can_chown());
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);

    // Paths this layer wrote, with their ancestors; opaque markers keep them.
    let mut written: HashSet<PathBuf> = HashSet::new();
    let mut opaque_dirs: Vec<PathBuf> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = sanitize(&entry.path()?)?;
        let Some(name) = rel.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        let dir = resolve_dir(&real_root, &parent)?;

        if mode != WhiteoutMode::Passthrough {
            if name == OPAQUE_WHITEOUT {
                mark_written(&mut written, &parent);
                match mode {
                    WhiteoutMode::Overlay => set_opaque_xattr(&dir)?,
                    _ => opaque_dirs.push(parent),
                }
                continue;
            }
            if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                if matches!(target, "" | "." | "..") {
                    return Err(invalid(format!(
                        "invalid whiteout entry: {}",
                        rel.display()
                    )));
                }
                let hidden = dir.join(target);
                remove_path(&hidden)?;
                if mode == WhiteoutMode::Overlay {
                    mknod_whiteout(&hidden)?;
                    mark_written(&mut written, &parent.join(target));
                }
                continue;
            }
        }

        let dest = dir.join(&name);
        let is_dir = entry.header().entry_type().is_dir();
        if let Ok(existing) = fs::symlink_metadata(&dest) {
            // Directories merge; anything else is replaced, which also keeps
            // writes from following a symlink left by a lower layer.
            if !(is_dir && existing.is_dir()) {
                remove_path(&dest)?;
            }
        }
        if !entry.unpack_in(&real_root)? {
            return Err(invalid(format!(
                "archive entry escapes root: {}",
                rel.display()
            )));
        }
        mark_written(&mut written, &rel);
    }

    // Later entries may have replaced a component, so resolve again.
    for rel in opaque_dirs {
        let dir = resolve_dir(&real_root, &rel)?;
        clear_lower(&dir, &rel, &written)?;
    }
    Ok(())
}

/// Walk `rel` below `real_root`, creating missing directories, and return
/// where it really lives. Symlinked components are followed only while they
/// stay inside `real_root`.
fn resolve_dir(real_root: &Path, rel: &Path) -> io::Result<PathBuf> {
    let mut cur = real_root.to_path_buf();
    for part in rel.components() {
        let next = cur.join(part);
        match fs::symlink_metadata(&next) {
            Ok(m) if m.file_type().is_symlink() => {
                let target = fs::canonicalize(&next).ok().filter(|t| t.starts_with(real_root));
                match target {
                    Some(t) if t.is_dir() => cur = t,
                    _ => {
                        return Err(invalid(format!(
                            "archive entry escapes root through symlink: {}",
                            rel.display()
                        )));
                    }
                }
            }
            Ok(m) if m.is_dir() => cur = next,
            Ok(_) => {
                return Err(invalid(format!(
                    "archive parent is not a directory: {}",
                    rel.display()
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&next)?;
                cur = next;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(cur)
}

/// Whether extracted entries can take the owners recorded in the archive.
#[allow(unsafe_code)]
pub fn can_chown() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    euid == 0 && !crate::mount::running_in_userns()
}

fn mark_written(written: &mut HashSet<PathBuf>, rel: &Path) {
    for ancestor in rel.ancestors() {
        if ancestor.as_os_str().is_empty() || !written.insert(ancestor.to_path_buf()) {
            break;
        }
    }
}

/// Remove everything under `dir` that this layer did not write.
fn clear_lower(dir: &Path, rel: &Path, written: &HashSet<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let child_rel = rel.join(entry.file_name());
        let child = entry.path();
        if written.contains(&child_rel) {
            if entry.file_type()?.is_dir() {
                clear_lower(&child, &child_rel, written)?;
            }
        } else {
            remove_path(&child)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| invalid(format!("path contains NUL byte: {}", path.display())))
}

#[allow(unsafe_code)]
fn mknod_whiteout(path: &Path) -> io::Result<()> {
    let c = c_path(path)?;
    // SAFETY: `c` is a valid NUL-terminated path that outlives the call;
    // mknod does not retain the pointer.
    let rc = unsafe { libc::mknod(c.as_ptr(), libc::S_IFCHR, libc::makedev(0, 0)) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[allow(unsafe_code)]
fn set_opaque_xattr(dir: &Path) -> io::Result<()> {
    let c = c_path(dir)?;
    let name = c_path(Path::new(OVERLAY_OPAQUE_XATTR))?;
    let value = b"y";
    // SAFETY: both strings are NUL-terminated and live across the call; the
    // value pointer and length describe the same live buffer.
    let rc = unsafe {
        libc::setxattr(
            c.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Where an artifact blob titled `title` lands under `root`, or `None` when
/// the title is empty or would leave the root.
pub fn artifact_target(root: &Path, title: &str) -> Option<PathBuf> {
    let rel = sanitize(Path::new(title)).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(rel))
}

/// Copy an artifact blob verbatim to `dest`, replacing any previous entry.
pub fn write_artifact<R: Read + ?Sized>(reader: &mut R, dest: &Path) -> io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_path(dest)?;
    let mut file = fs::File::create(dest)?;
    let n = io::copy(reader, &mut file)?;
    file.flush()?;
    file.sync_all()?;
    Ok(n)
}
