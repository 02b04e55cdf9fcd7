//! File storage for committed transactions
//!
//! A committed file must be either completely present or absent after a
//! crash. `DiskStore` writes into a temporary file in the destination
//! directory, fsyncs it, and atomically renames it over the target.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;

/// Durable file write/read primitive used by the commit path
pub trait DurableStore: Send + Sync {
    /// Write `data` to `file_name`, returning only once the bytes are durable
    fn write_file(&self, file_name: &str, data: &[u8]) -> io::Result<()>;

    /// Read a previously written file
    fn read_file(&self, file_name: &str) -> io::Result<Vec<u8>>;
}

/// Stores files under a root directory
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    /// Directories under the root that clients may never touch
    reserved: Vec<PathBuf>,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reserved: Vec::new(),
        }
    }

    /// Refuse every name that resolves into `dir`
    pub fn reserve(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reserved.push(dir.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client-supplied name inside the root directory.
    ///
    /// Only plain relative paths are accepted. Hidden components (leading
    /// `.`) are refused, which also covers in-flight temp files. Anything
    /// rejected is reported as permission denied.
    fn resolve(&self, file_name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(file_name);
        let is_plain = !file_name.is_empty()
            && relative.components().all(|c| match c {
                Component::Normal(part) => !part.to_string_lossy().starts_with('.'),
                Component::CurDir => true,
                _ => false,
            });
        if !is_plain {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("invalid file name '{}'", file_name),
            ));
        }

        let path = self.root.join(relative);
        if self.reserved.iter().any(|dir| path.starts_with(dir)) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("'{}' is reserved for the server", file_name),
            ));
        }
        Ok(path)
    }
}

impl DurableStore for DiskStore {
    fn write_file(&self, file_name: &str, data: &[u8]) -> io::Result<()> {
        let path = self.resolve(file_name)?;
        let dir = path.parent().unwrap_or(&self.root);

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        // Make the rename itself durable
        #[cfg(unix)]
        fs::File::open(dir)?.sync_all()?;

        log::debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    fn read_file(&self, file_name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(file_name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let temp_dir = tempdir().unwrap();
        let store = DiskStore::new(temp_dir.path());

        store.write_file("hello.txt", b"hello world").unwrap();
        assert_eq!(store.read_file("hello.txt").unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn test_write_replaces_existing_file() {
        let temp_dir = tempdir().unwrap();
        let store = DiskStore::new(temp_dir.path());

        store.write_file("f", b"old contents").unwrap();
        store.write_file("f", b"new").unwrap();
        assert_eq!(store.read_file("f").unwrap(), b"new".to_vec());
    }

    #[test]
    fn test_write_empty_file() {
        let temp_dir = tempdir().unwrap();
        let store = DiskStore::new(temp_dir.path());

        store.write_file("empty", b"").unwrap();
        assert!(store.read_file("empty").unwrap().is_empty());
    }

    #[test]
    fn test_missing_directory_is_not_found() {
        let temp_dir = tempdir().unwrap();
        let store = DiskStore::new(temp_dir.path());

        let err = store.write_file("no/such/dir/file.txt", b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let temp_dir = tempdir().unwrap();
        let store = DiskStore::new(temp_dir.path().join("root"));

        for name in ["../escape.txt", "/etc/passwd", "a/../../b", ""] {
            let err = store.write_file(name, b"x").unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied, "name {:?}", name);
        }
    }

    #[test]
    fn test_rejects_hidden_components() {
        let temp_dir = tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".log")).unwrap();
        std::fs::write(temp_dir.path().join(".log/recovery.log"), b"log bytes").unwrap();
        let store = DiskStore::new(temp_dir.path());

        for name in [".log/recovery.log", ".hidden", "dir/.tmpXYZ", "./.log/recovery.log"] {
            assert_eq!(
                store.read_file(name).unwrap_err().kind(),
                io::ErrorKind::PermissionDenied,
                "name {:?}",
                name
            );
            assert_eq!(
                store.write_file(name, b"x").unwrap_err().kind(),
                io::ErrorKind::PermissionDenied,
                "name {:?}",
                name
            );
        }
        assert_eq!(
            std::fs::read(temp_dir.path().join(".log/recovery.log")).unwrap(),
            b"log bytes".to_vec()
        );
    }

    #[test]
    fn test_reserved_directory_is_off_limits() {
        let temp_dir = tempdir().unwrap();
        let log_dir = temp_dir.path().join("wal");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("recovery.log"), b"log bytes").unwrap();
        let store = DiskStore::new(temp_dir.path()).reserve(&log_dir);

        for name in ["wal/recovery.log", "./wal/recovery.log", "wal/new.txt"] {
            assert_eq!(
                store.read_file(name).unwrap_err().kind(),
                io::ErrorKind::PermissionDenied,
                "name {:?}",
                name
            );
            assert_eq!(
                store.write_file(name, b"x").unwrap_err().kind(),
                io::ErrorKind::PermissionDenied,
                "name {:?}",
                name
            );
        }

        store.write_file("walrus.txt", b"ok").unwrap();
        assert_eq!(store.read_file("walrus.txt").unwrap(), b"ok".to_vec());
    }

    #[test]
    fn test_read_missing_file() {
        let temp_dir = tempdir().unwrap();
        let store = DiskStore::new(temp_dir.path());
        assert_eq!(store.read_file("nope").unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
