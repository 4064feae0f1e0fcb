//! Layer application onto a rootfs directory.
//!
//! Layers are applied bottom to top. Whiteouts are handled inline: a
//! `.wh.<name>` entry deletes `<name>` from lower layers, and `.wh..wh..opq`
//! empties its directory of everything not written by the current layer.

use boxforge_shared::constants::oci::{WHITEOUT_OPAQUE, WHITEOUT_PREFIX};
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use filetime::FileTime;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use walkdir::WalkDir;

/// Totals for one unpack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnpackStats {
    pub layers: usize,
    pub entries: u64,
    pub whiteouts: u64,
    pub bytes: u64,
}

struct DeferredDir {
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

/// Apply layer blobs in order onto `dest`.
pub fn unpack_layers(layer_blobs: &[PathBuf], dest: &Path) -> BoxforgeResult<UnpackStats> {
    let mut stats = UnpackStats::default();
    for blob in layer_blobs {
        let layer = apply_layer_blob(blob, dest)?;
        stats.layers += 1;
        stats.entries += layer.entries;
        stats.whiteouts += layer.whiteouts;
        stats.bytes += layer.bytes;
    }
    tracing::debug!(
        dest = %dest.display(),
        layers = stats.layers,
        entries = stats.entries,
        "Unpacked layers"
    );
    Ok(stats)
}

/// Apply one layer blob (gzip or plain tar, detected by magic bytes).
pub fn apply_layer_blob(blob: &Path, dest: &Path) -> BoxforgeResult<UnpackStats> {
    let open = || {
        fs::File::open(blob).map_err(|e| {
            BoxforgeError::Storage(format!("Failed to open layer {}: {}", blob.display(), e))
        })
    };

    let mut magic = [0u8; 2];
    let is_gzip = match open()?.read_exact(&mut magic) {
        Ok(()) => magic == [0x1f, 0x8b],
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => {
            return Err(BoxforgeError::Storage(format!(
                "Failed to read layer header {}: {}",
                blob.display(),
                e
            )));
        }
    };

    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(BufReader::new(open()?)))
    } else {
        Box::new(BufReader::new(open()?))
    };

    apply_layer(reader, dest)
}

/// Apply an uncompressed layer tar stream onto `dest`.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> BoxforgeResult<UnpackStats> {
    fs::create_dir_all(dest).map_err(|e| {
        BoxforgeError::Storage(format!("Failed to create {}: {}", dest.display(), e))
    })?;

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut stats = UnpackStats {
        layers: 1,
        ..Default::default()
    };
    let mut written: HashSet<PathBuf> = HashSet::new();
    let mut deferred_dirs: Vec<DeferredDir> = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| BoxforgeError::Storage(format!("Failed to read layer entries: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| BoxforgeError::Storage(format!("Failed to read layer entry: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| BoxforgeError::Storage(format!("Invalid entry path: {}", e)))?
            .into_owned();

        let Some(rel) = confined_path(&raw_path) else {
            tracing::warn!(path = %raw_path.display(), "Refusing layer entry outside the root");
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let full_path = dest.join(&rel);
        let entry_type = entry.header().entry_type();

        if entry_type == EntryType::Regular && apply_whiteout(&full_path, &written)? {
            stats.whiteouts += 1;
            continue;
        }

        match entry_type {
            EntryType::Directory => {
                remove_non_dir(&full_path)?;
                fs::create_dir_all(&full_path).map_err(|e| {
                    BoxforgeError::Storage(format!(
                        "Failed to create directory {}: {}",
                        full_path.display(),
                        e
                    ))
                })?;
                deferred_dirs.push(DeferredDir {
                    path: full_path.clone(),
                    mode: entry.header().mode().unwrap_or(0o755),
                    mtime: entry.header().mtime().unwrap_or(0),
                });
            }
            EntryType::Regular
            | EntryType::GNUSparse
            | EntryType::Continuous
            | EntryType::Link
            | EntryType::Symlink => {
                remove_existing(&full_path)?;
                stats.bytes += entry.header().size().unwrap_or(0);
                entry.unpack_in(dest).map_err(|e| {
                    BoxforgeError::Storage(format!("Failed to unpack {}: {}", rel.display(), e))
                })?;
            }
            EntryType::XGlobalHeader | EntryType::XHeader => continue,
            other => {
                tracing::debug!(path = %rel.display(), entry_type = ?other, "Skipping special entry");
                continue;
            }
        }

        stats.entries += 1;
        written.insert(full_path);
    }

    // Deepest first, so a read-only parent never blocks its children.
    deferred_dirs.sort_unstable_by(|a, b| b.path.cmp(&a.path));
    for dir in &deferred_dirs {
        if !dir.path.is_dir() {
            continue;
        }
        fs::set_permissions(&dir.path, fs::Permissions::from_mode(dir.mode & 0o7777)).map_err(
            |e| {
                BoxforgeError::Storage(format!(
                    "Failed to set permissions on {}: {}",
                    dir.path.display(),
                    e
                ))
            },
        )?;
        let mtime = FileTime::from_unix_time(dir.mtime as i64, 0);
        filetime::set_file_times(&dir.path, mtime, mtime).map_err(|e| {
            BoxforgeError::Storage(format!("Failed to set times on {}: {}", dir.path.display(), e))
        })?;
    }

    Ok(stats)
}

/// Strip leading `/` and `.` and resolve `..` lexically; `None` when the
/// path would climb above the root.
fn confined_path(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(c) => parts.push(c),
        }
    }
    Some(parts.into_iter().collect())
}

/// Handle whiteout markers. Returns true when `path` named one.
fn apply_whiteout(path: &Path, written: &HashSet<PathBuf>) -> BoxforgeResult<bool> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };
    let Some(parent) = path.parent() else {
        return Ok(false);
    };

    if name == WHITEOUT_OPAQUE {
        if parent.is_dir() {
            for entry in WalkDir::new(parent).min_depth(1) {
                // Entries below an already removed directory fail to read.
                let Ok(entry) = entry else { continue };
                if written.contains(entry.path()) {
                    continue;
                }
                remove_existing(entry.path())?;
                tracing::trace!(path = %entry.path().display(), "Opaque whiteout removed");
            }
        }
        return Ok(true);
    }

    if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
        let target = parent.join(target);
        remove_existing(&target)?;
        tracing::trace!(path = %target.display(), "Whiteout removed");
        return Ok(true);
    }

    Ok(false)
}

fn remove_existing(path: &Path) -> BoxforgeResult<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(BoxforgeError::Storage(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            )));
        }
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| BoxforgeError::Storage(format!("Failed to remove {}: {}", path.display(), e)))
}

fn remove_non_dir(path: &Path) -> BoxforgeResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => remove_existing(path),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Item<'a> {
        Dir(&'a str),
        File(&'a str, &'a str),
        Symlink(&'a str, &'a str),
    }

    fn layer(items: &[Item]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for item in items {
            let mut header = tar::Header::new_gnu();
            header.set_mtime(0);
            match item {
                Item::Dir(path) => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    builder.append_data(&mut header, path, io::empty()).unwrap();
                }
                Item::File(path, content) => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_mode(0o644);
                    header.set_size(content.len() as u64);
                    builder.append_data(&mut header, path, content.as_bytes()).unwrap();
                }
                Item::Symlink(path, target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn applies_files_dirs_and_symlinks() {
        let dest = tempfile::tempdir().unwrap();
        let tar = layer(&[
            Item::Dir("usr"),
            Item::Dir("usr/bin"),
            Item::File("usr/bin/python3", "elf"),
            Item::Symlink("usr/bin/python", "python3"),
        ]);

        let stats = apply_layer(&tar[..], dest.path()).unwrap();

        assert_eq!(stats.entries, 4);
        assert_eq!(fs::read_to_string(dest.path().join("usr/bin/python3")).unwrap(), "elf");
        assert_eq!(
            fs::read_link(dest.path().join("usr/bin/python")).unwrap(),
            PathBuf::from("python3")
        );
    }

    #[test]
    fn whiteout_deletes_lower_entry() {
        let dest = tempfile::tempdir().unwrap();
        apply_layer(&layer(&[Item::Dir("etc"), Item::File("etc/motd", "hi")])[..], dest.path()).unwrap();

        let stats = apply_layer(&layer(&[Item::File("etc/.wh.motd", "")])[..], dest.path()).unwrap();

        assert_eq!(stats.whiteouts, 1);
        assert!(!dest.path().join("etc/motd").exists());
        assert!(!dest.path().join("etc/.wh.motd").exists());
    }

    #[test]
    fn opaque_whiteout_keeps_only_current_layer() {
        let dest = tempfile::tempdir().unwrap();
        apply_layer(
            &layer(&[Item::Dir("src"), Item::File("src/base.py", "base")])[..],
            dest.path(),
        )
        .unwrap();

        apply_layer(
            &layer(&[
                Item::Dir("src"),
                Item::File("src/.wh..wh..opq", ""),
                Item::File("src/main.py", "app"),
            ])[..],
            dest.path(),
        )
        .unwrap();

        assert!(!dest.path().join("src/base.py").exists());
        assert!(!dest.path().join("src/.wh..wh..opq").exists());
        assert_eq!(fs::read_to_string(dest.path().join("src/main.py")).unwrap(), "app");
    }

    #[test]
    fn refuses_escaping_entries() {
        let outer = tempfile::tempdir().unwrap();
        let dest = outer.path().join("root");

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(3);
        header.set_mode(0o644);
        // set_path refuses "..", so write the raw name field.
        let name = b"../evil";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"bad"[..]).unwrap();
        let tar = builder.into_inner().unwrap();

        apply_layer(&tar[..], &dest).unwrap();
        assert!(!outer.path().join("evil").exists());
    }

    #[test]
    fn file_replaces_directory_from_lower_layer() {
        let dest = tempfile::tempdir().unwrap();
        apply_layer(&layer(&[Item::Dir("data"), Item::File("data/x", "1")])[..], dest.path()).unwrap();
        apply_layer(&layer(&[Item::File("data", "now a file")])[..], dest.path()).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("data")).unwrap(), "now a file");
    }

    #[test]
    fn detects_gzip_blobs() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let tar = layer(&[Item::File("hello.txt", "hello")]);
        let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar).unwrap();
        let blob = dir.path().join("blob");
        fs::write(&blob, gz.finish().unwrap()).unwrap();

        let dest = dir.path().join("rootfs");
        let stats = unpack_layers(&[blob], &dest).unwrap();
        assert_eq!(stats.layers, 1);
        assert_eq!(fs::read_to_string(dest.join("hello.txt")).unwrap(), "hello");
    }
}
