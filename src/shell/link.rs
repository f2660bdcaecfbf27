//! Library archives linked into the shared library path.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

/// Leading bytes of a ZIP (and therefore JAR) archive
const ZIP_MAGIC: [&[u8; 4]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no such library: {0}")]
    Missing(PathBuf),

    #[error("cannot read {0}: {1}")]
    Unreadable(PathBuf, #[source] io::Error),

    #[error("{0} is not a library archive")]
    NotArchive(PathBuf),

    #[error("{0} is already linked")]
    AlreadyLinked(PathBuf),
}

/// Whether `path` starts with a ZIP local, end, or spanned header
pub fn is_zip_archive(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(ZIP_MAGIC.iter().any(|m| **m == magic)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Archives linked so far, shared by every session
#[derive(Default)]
pub struct LibraryPath {
    entries: Mutex<Vec<PathBuf>>,
}

impl LibraryPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append an archive; returns its canonical path
    pub fn link(&self, path: &Path) -> Result<PathBuf, LinkError> {
        if !path.is_file() {
            return Err(LinkError::Missing(path.to_path_buf()));
        }
        let canonical = path
            .canonicalize()
            .map_err(|e| LinkError::Unreadable(path.to_path_buf(), e))?;
        match is_zip_archive(&canonical) {
            Ok(true) => {}
            Ok(false) => return Err(LinkError::NotArchive(canonical)),
            Err(e) => return Err(LinkError::Unreadable(canonical, e)),
        }

        let mut entries = self.entries.lock();
        if entries.contains(&canonical) {
            return Err(LinkError::AlreadyLinked(canonical));
        }
        entries.push(canonical.clone());
        Ok(canonical)
    }

    pub fn entries(&self) -> Vec<PathBuf> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_link_archive_once() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("lib.jar");
        fs::write(&jar, b"PK\x03\x04rest of archive").unwrap();

        let libs = LibraryPath::new();
        let linked = libs.link(&jar).unwrap();
        assert_eq!(libs.entries(), vec![linked]);
        assert!(matches!(libs.link(&jar), Err(LinkError::AlreadyLinked(_))));
    }

    #[test]
    fn test_rejects_non_archive() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("notes.txt");
        fs::write(&text, b"hello").unwrap();
        let short = dir.path().join("short.jar");
        fs::write(&short, b"PK").unwrap();

        let libs = LibraryPath::new();
        assert!(matches!(libs.link(&text), Err(LinkError::NotArchive(_))));
        assert!(matches!(libs.link(&short), Err(LinkError::NotArchive(_))));
        assert!(libs.entries().is_empty());
    }

    #[test]
    fn test_missing_file() {
        let libs = LibraryPath::new();
        let err = libs.link(Path::new("/definitely/not/here.jar")).unwrap_err();
        assert!(matches!(err, LinkError::Missing(_)));
    }

    #[test]
    fn test_empty_archive_magic() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.zip");
        fs::write(&empty, b"PK\x05\x06\0\0\0\0").unwrap();
        assert!(is_zip_archive(&empty).unwrap());
    }
}
