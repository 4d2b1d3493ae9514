//! Single-file operations used by the bulk tasks.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Moves `from` to `to`, falling back to copy + remove when a plain rename
/// crosses filesystems. Refuses to overwrite an existing target.
pub fn move_file(from: &Path, to: &Path) -> Result<PathBuf> {
    if to.exists() {
        bail!("target already exists: {}", to.display());
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(to.to_path_buf()),
        Err(e) if is_cross_device(&e) => {
            tracing::debug!("Cross-device move, copying {:?} -> {:?}", from, to);
            fs::copy(from, to)
                .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
            if let Err(e) = fs::remove_file(from) {
                // Leave the source untouched rather than keep two copies.
                let _ = fs::remove_file(to);
                return Err(e).with_context(|| format!("removing {}", from.display()));
            }
            Ok(to.to_path_buf())
        }
        Err(e) => Err(e).with_context(|| format!("moving {} to {}", from.display(), to.display())),
    }
}

fn is_cross_device(error: &io::Error) -> bool {
    #[cfg(unix)]
    {
        // EXDEV
        error.raw_os_error() == Some(18)
    }
    #[cfg(windows)]
    {
        // ERROR_NOT_SAME_DEVICE
        error.raw_os_error() == Some(17)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = error;
        false
    }
}

/// Deletes a file unless it is marked read-only and `force` is off.
pub fn delete_file(path: &Path, force: bool) -> Result<()> {
    let metadata =
        fs::symlink_metadata(path).with_context(|| format!("reading {}", path.display()))?;
    ensure_deletable(path, &metadata, force)?;
    fs::remove_file(path).with_context(|| format!("deleting {}", path.display()))
}

/// Returns an error when `path` is read-only and `force` is off.
pub fn ensure_deletable(path: &Path, metadata: &fs::Metadata, force: bool) -> Result<()> {
    if !force && metadata.permissions().readonly() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("{} is read-only", path.display()),
        )
        .into());
    }
    Ok(())
}

/// Marks a file read-only or writable.
pub fn set_readonly(path: &Path, readonly: bool) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(readonly);
    fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_move_file_refuses_existing_target() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        assert!(move_file(&a, &b).is_err());
        assert_eq!(fs::read_to_string(&b).unwrap(), "b");
        assert!(a.exists());
    }

    #[test]
    fn test_move_file_moves() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        fs::write(&a, "a").unwrap();

        assert_eq!(move_file(&a, &b).unwrap(), b);
        assert!(!a.exists());
        assert_eq!(fs::read_to_string(&b).unwrap(), "a");
    }

    #[test]
    fn test_delete_refuses_read_only_without_force() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.zip");
        fs::write(&a, "a").unwrap();
        set_readonly(&a, true).unwrap();

        let err = delete_file(&a, false).unwrap_err();
        let io_err = err.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
        assert!(a.exists());

        delete_file(&a, true).unwrap();
        assert!(!a.exists());
    }
}
