//! Local filesystem helpers
//!
//! Thin wrappers over `std::fs` that keep the failing path in the error and
//! separate "not found" and "permission denied" from other I/O failures.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Owner read/write permission bits
pub const PERMS_OWNER_RW: u32 = 0o600;

pub fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::from_io(path, e)),
    }
}

/// Remove a directory tree; a missing directory is not an error
pub fn delete_directory(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from_io(path, e)),
    }
}

pub fn create_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::from_io(path, e))
}

pub fn delete_file(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| Error::from_io(path, e))
}

/// Hard-link `from` to `to`
pub fn link_file(from: &Path, to: &Path) -> Result<()> {
    fs::hard_link(from, to).map_err(|e| {
        Error::from_io(
            to,
            std::io::Error::new(e.kind(), format!("link from {}: {}", from.display(), e)),
        )
    })
}

/// Names of the regular files directly inside `dir`
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::from_io(dir, e))? {
        let entry = entry.map_err(|e| Error::from_io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| Error::from_io(&entry.path(), e))?;
        if file_type.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Hex SHA-256 of the file content
pub fn content_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::from_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn set_permission(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::from_io(path, e))
}

pub fn file_size(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::from_io(path, e))
}

/// Delete every path, returning the first failure after trying all
pub fn batch_delete<P: AsRef<Path>>(paths: &[P]) -> Result<()> {
    let mut first_err = None;
    for path in paths {
        let path = path.as_ref();
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound && first_err.is_none() {
                first_err = Some(Error::from_io(path, e));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Write `bytes` through a temp file and rename it into place
pub fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| Error::from_io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| Error::from_io(&tmp, e))?;
        file.sync_all().map_err(|e| Error::from_io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| Error::from_io(path, e))
}

/// Total size of the regular files under `dir`
pub fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::from_io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::from_io(dir, e))?;
        let meta = entry.metadata().map_err(|e| Error::from_io(&entry.path(), e))?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Remove the parent of `path` if it has become empty
pub fn delete_parent_if_empty(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    match fs::read_dir(parent) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                fs::remove_dir(parent).map_err(|e| Error::from_io(parent, e))?;
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from_io(parent, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_list_files_skips_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.dat"), b"1").unwrap();
        fs::write(dir.path().join("a.dat"), b"1").unwrap();
        fs::create_dir(dir.path().join("_binlog")).unwrap();
        assert_eq!(list_files(dir.path()).unwrap(), vec!["a.dat", "b.dat"]);
    }

    #[test]
    fn test_content_hash_and_link() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"hello").unwrap();
        link_file(&a, &b).unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        assert_eq!(
            content_hash(&a).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(link_file(&a, &b).is_err());
    }

    #[test]
    fn test_not_found_is_structured() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(!exists(&missing).unwrap());
        assert!(matches!(file_size(&missing), Err(Error::NotFound(_))));
        assert!(matches!(delete_file(&missing), Err(Error::NotFound(_))));
        delete_directory(&missing).unwrap();
    }

    #[test]
    fn test_delete_parent_if_empty() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("15001");
        let tablet = parent.join("1234");
        create_directory(&tablet).unwrap();
        delete_directory(&tablet).unwrap();
        delete_parent_if_empty(&tablet).unwrap();
        assert!(!parent.exists());
    }

    #[test]
    fn test_dir_size_and_permission() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/x"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("y"), vec![0u8; 5]).unwrap();
        assert_eq!(dir_size(dir.path()).unwrap(), 15);

        use std::os::unix::fs::PermissionsExt;
        set_permission(&dir.path().join("y"), PERMS_OWNER_RW).unwrap();
        let mode = fs::metadata(dir.path().join("y")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
