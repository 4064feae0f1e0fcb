//! Verbatim tree copy into a layer directory.
//!
//! Modelled on the containers/storage VFS `DirCopy`: walk the source without
//! following symlinks, recreate directories, regular files and symlinks, keep
//! permission bits and timestamps, and turn repeated inodes into hardlinks.
//! Ownership and xattrs are not copied; layer packing normalises them.

use boxforge_shared::constants::oci::WHITEOUT_OPAQUE;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use filetime::FileTime;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, symlink};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// File identifier for hardlink detection (device + inode)
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
struct FileId {
    dev: u64,
    ino: u64,
}

/// What a copy produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
    pub skipped: u64,
}

/// Copy directory `src` to `dst`, replacing anything already at `dst`.
///
/// `src` must be an existing directory. Parent directories of `dst` are
/// created as needed.
pub fn copy_tree(src: &Path, dst: &Path) -> BoxforgeResult<CopyStats> {
    let meta = fs::metadata(src).map_err(|e| {
        BoxforgeError::Config(format!("Input directory {} is not accessible: {}", src.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(BoxforgeError::Config(format!(
            "Input path is not a directory: {}",
            src.display()
        )));
    }

    remove_existing(dst)?;
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)?;
    }

    tracing::debug!(src = %src.display(), dst = %dst.display(), "Copying tree");

    let mut stats = CopyStats::default();
    if let Err(e) = dir_copy(src, dst, &mut stats) {
        let _ = fs::remove_dir_all(dst);
        return Err(e);
    }

    tracing::debug!(
        files = stats.files,
        dirs = stats.dirs,
        symlinks = stats.symlinks,
        bytes = stats.bytes,
        "Tree copied"
    );
    Ok(stats)
}

/// Copy a single regular file to `dst`, creating parents and replacing any
/// existing entry.
pub fn copy_file(src: &Path, dst: &Path) -> BoxforgeResult<u64> {
    let meta = fs::metadata(src).map_err(|e| {
        BoxforgeError::Config(format!("Input file {} is not accessible: {}", src.display(), e))
    })?;
    if !meta.is_file() {
        return Err(BoxforgeError::Config(format!(
            "Input path is not a regular file: {}",
            src.display()
        )));
    }

    remove_existing(dst)?;
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)?;
    }

    let bytes = copy_regular_file(src, dst)?;
    fs::set_permissions(dst, meta.permissions()).map_err(|e| {
        BoxforgeError::Storage(format!("Failed to set permissions on {}: {}", dst.display(), e))
    })?;
    if let (Ok(atime), Ok(mtime)) = (meta.accessed(), meta.modified()) {
        set_times(dst, atime, mtime)?;
    }
    Ok(bytes)
}

/// Drop an opaque whiteout marker into `dir` so lower layers' content below
/// it is hidden when the image is unpacked.
pub fn mark_opaque(dir: &Path) -> BoxforgeResult<()> {
    let marker = dir.join(WHITEOUT_OPAQUE);
    fs::write(&marker, b"").map_err(|e| {
        BoxforgeError::Storage(format!("Failed to write {}: {}", marker.display(), e))
    })
}

fn dir_copy(src_dir: &Path, dst_dir: &Path, stats: &mut CopyStats) -> BoxforgeResult<()> {
    let mut copied_files: HashMap<FileId, PathBuf> = HashMap::new();
    let mut dirs_to_set_mtimes: Vec<(PathBuf, SystemTime, SystemTime)> = Vec::new();

    for entry in WalkDir::new(src_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to walk directory {}: {}",
                src_dir.display(),
                e
            ))
        })?;

        let src_path = entry.path();
        let rel_path = src_path.strip_prefix(src_dir).map_err(|e| {
            BoxforgeError::Internal(format!("Failed to rebase path {}: {}", src_path.display(), e))
        })?;
        let dst_path = dst_dir.join(rel_path);

        let metadata = fs::symlink_metadata(src_path).map_err(|e| {
            BoxforgeError::Storage(format!("Failed to stat {}: {}", src_path.display(), e))
        })?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            create_dir_all(&dst_path)?;
            fs::set_permissions(&dst_path, metadata.permissions()).map_err(|e| {
                BoxforgeError::Storage(format!(
                    "Failed to set permissions on {}: {}",
                    dst_path.display(),
                    e
                ))
            })?;
            if let (Ok(atime), Ok(mtime)) = (metadata.accessed(), metadata.modified()) {
                dirs_to_set_mtimes.push((dst_path, atime, mtime));
            }
            stats.dirs += 1;
        } else if file_type.is_file() {
            let file_id = FileId {
                dev: metadata.dev(),
                ino: metadata.ino(),
            };

            if let Some(existing) = copied_files.get(&file_id) {
                fs::hard_link(existing, &dst_path).map_err(|e| {
                    BoxforgeError::Storage(format!(
                        "Failed to create hardlink {} -> {}: {}",
                        existing.display(),
                        dst_path.display(),
                        e
                    ))
                })?;
            } else {
                stats.bytes += copy_regular_file(src_path, &dst_path)?;
                fs::set_permissions(&dst_path, metadata.permissions()).map_err(|e| {
                    BoxforgeError::Storage(format!(
                        "Failed to set permissions on {}: {}",
                        dst_path.display(),
                        e
                    ))
                })?;
                if let (Ok(atime), Ok(mtime)) = (metadata.accessed(), metadata.modified()) {
                    set_times(&dst_path, atime, mtime)?;
                }
                copied_files.insert(file_id, dst_path);
            }
            stats.files += 1;
        } else if file_type.is_symlink() {
            let target = fs::read_link(src_path).map_err(|e| {
                BoxforgeError::Storage(format!(
                    "Failed to read symlink {}: {}",
                    src_path.display(),
                    e
                ))
            })?;
            symlink(&target, &dst_path).map_err(|e| {
                BoxforgeError::Storage(format!(
                    "Failed to create symlink {} -> {}: {}",
                    dst_path.display(),
                    target.display(),
                    e
                ))
            })?;
            stats.symlinks += 1;
        } else {
            // FIFOs, sockets and device nodes have no place in an app tree.
            tracing::warn!(path = %src_path.display(), "Skipping special file");
            stats.skipped += 1;
        }
    }

    // Parents last, so creating children does not bump their mtime again.
    for (dir_path, atime, mtime) in dirs_to_set_mtimes.iter().rev() {
        set_times(dir_path, *atime, *mtime)?;
    }

    Ok(())
}

fn copy_regular_file(src: &Path, dst: &Path) -> BoxforgeResult<u64> {
    fs::copy(src, dst).map_err(|e| {
        BoxforgeError::Storage(format!(
            "Failed to copy file {} -> {}: {}",
            src.display(),
            dst.display(),
            e
        ))
    })
}

fn remove_existing(path: &Path) -> BoxforgeResult<()> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| {
        BoxforgeError::Storage(format!("Failed to remove existing {}: {}", path.display(), e))
    })
}

fn create_dir_all(path: &Path) -> BoxforgeResult<()> {
    fs::create_dir_all(path).map_err(|e| {
        BoxforgeError::Storage(format!("Failed to create directory {}: {}", path.display(), e))
    })
}

fn set_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> BoxforgeResult<()> {
    filetime::set_file_times(
        path,
        FileTime::from_system_time(atime),
        FileTime::from_system_time(mtime),
    )
    .map_err(|e| BoxforgeError::Storage(format!("Failed to set times on {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn copies_nested_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("layer/src");

        fs::create_dir_all(src.join("pkg")).unwrap();
        fs::write(src.join("main.py"), "print('hi')").unwrap();
        fs::write(src.join("pkg/__init__.py"), "").unwrap();

        let stats = copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("main.py")).unwrap(), "print('hi')");
        assert!(dst.join("pkg/__init__.py").exists());
        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 2);
    }

    #[test]
    fn replaces_existing_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("new.py"), "new").unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("stale.py"), "old").unwrap();

        copy_tree(&src, &dst).unwrap();

        assert!(dst.join("new.py").exists());
        assert!(!dst.join("stale.py").exists());
    }

    #[test]
    fn preserves_mode_and_symlinks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(&src).unwrap();
        let script = src.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        symlink("run.sh", src.join("run")).unwrap();

        copy_tree(&src, &dst).unwrap();

        let mode = fs::metadata(dst.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read_link(dst.join("run")).unwrap(), Path::new("run.sh"));
    }

    #[test]
    fn keeps_hardlinks_together() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a"), "shared").unwrap();
        fs::hard_link(src.join("a"), src.join("b")).unwrap();

        copy_tree(&src, &dst).unwrap();

        let a = fs::metadata(dst.join("a")).unwrap();
        let b = fs::metadata(dst.join("b")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn missing_source_is_config_error() {
        let temp = TempDir::new().unwrap();
        let err = copy_tree(&temp.path().join("nope"), &temp.path().join("dst")).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn copy_file_creates_parents() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("requirements.txt");
        fs::write(&src, "requests==2.31.0\n").unwrap();

        let dst = temp.path().join("layer/deps/requirements.txt");
        let bytes = copy_file(&src, &dst).unwrap();

        assert_eq!(bytes, 17);
        assert_eq!(fs::read_to_string(dst).unwrap(), "requests==2.31.0\n");
    }

    #[test]
    fn opaque_marker_is_written() {
        let temp = TempDir::new().unwrap();
        mark_opaque(temp.path()).unwrap();
        assert!(temp.path().join(".wh..wh..opq").exists());
    }
}
