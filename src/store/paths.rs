use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// The three files that make up one store, named from a single base path.
///
/// | File          | Contents                          |
/// |---------------|-----------------------------------|
/// | `<base>`      | header page and checkpoint images |
/// | `<base>-wal`  | write-ahead log                   |
/// | `<base>-shm`  | shared index                      |
///
/// Backup and restore tooling should treat the set as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    primary: PathBuf,
    wal: PathBuf,
    shm: PathBuf,
}

impl StorePaths {
    pub fn new(base: impl AsRef<Path>) -> Self {
        let primary = base.as_ref().to_path_buf();
        Self {
            wal: with_suffix(&primary, "-wal"),
            shm: with_suffix(&primary, "-shm"),
            primary,
        }
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn wal(&self) -> &Path {
        &self.wal
    }

    pub fn shm(&self) -> &Path {
        &self.shm
    }

    /// All three paths, primary first.
    pub fn files(&self) -> [&Path; 3] {
        [&self.primary, &self.wal, &self.shm]
    }

    /// Deletes exactly the three store files. Files that do not exist are
    /// skipped. The store must not be open.
    pub fn delete_files(&self) -> io::Result<()> {
        for path in self.files() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_derived_names() {
        let paths = StorePaths::new("/data/signal.sqlite");
        assert_eq!(paths.primary(), Path::new("/data/signal.sqlite"));
        assert_eq!(paths.wal(), Path::new("/data/signal.sqlite-wal"));
        assert_eq!(paths.shm(), Path::new("/data/signal.sqlite-shm"));
    }

    #[test]
    fn test_delete_files_only_touches_the_set() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path().join("store.db"));
        let bystander = dir.path().join("store.db-journal");

        std::fs::write(paths.primary(), b"p").unwrap();
        std::fs::write(paths.wal(), b"w").unwrap();
        std::fs::write(&bystander, b"x").unwrap();

        paths.delete_files().unwrap();
        for path in paths.files() {
            assert!(!path.exists());
        }
        assert!(bystander.exists());

        // Deleting again is not an error
        paths.delete_files().unwrap();
    }
}
