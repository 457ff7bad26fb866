//! Filesystem abstraction.
//!
//! The storage layer never touches the OS directly: everything goes through
//! [`VaultFs`], the seam where the encrypted filesystem plugs in. Two
//! implementations ship with this crate: [`LocalFs`] for plain on-disk
//! vaults and [`MemFs`] for tests.

use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A single directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File or directory name (no path components).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// File metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

/// Trait for the byte-addressable filesystem beneath a vault.
///
/// Implementations are assumed reliable and consistent; encryption, if any,
/// is transparent at this boundary.
pub trait VaultFs: Send + Sync {
    /// Reads the full content of a file.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Writes (creating or replacing) a file, creating parent directories.
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Lists the immediate entries of a directory.
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Returns metadata for a path.
    fn metadata(&self, path: &Path) -> Result<FileStat>;

    /// Checks whether a path exists.
    fn exists(&self, path: &Path) -> bool;
}

impl<T: VaultFs + ?Sized> VaultFs for Arc<T> {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        (**self).read_file(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        (**self).write_file(path, data)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        (**self).read_dir(path)
    }

    fn metadata(&self, path: &Path) -> Result<FileStat> {
        (**self).metadata(path)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }
}

/// Plain on-disk filesystem rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Creates a filesystem rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl VaultFs for LocalFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.full(path))?)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::write(full, data)?)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(self.full(path))? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn metadata(&self, path: &Path) -> Result<FileStat> {
        let meta = std::fs::metadata(self.full(path))?;
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.full(path).exists()
    }
}

/// In-memory filesystem used by tests across the workspace.
#[derive(Debug, Default)]
pub struct MemFs {
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemFs {
    /// Creates an empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(path: &Path) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such path: {}", path.display()),
        )
    }

    fn is_dir_of(files: &BTreeMap<PathBuf, Vec<u8>>, path: &Path) -> bool {
        files.keys().any(|k| k.starts_with(path) && k != path)
    }
}

impl VaultFs for MemFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Self::not_found(path).into())
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.files.write().insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let files = self.files.read();
        if !Self::is_dir_of(&files, path) {
            return Err(Self::not_found(path).into());
        }
        let mut entries: Vec<DirEntry> = Vec::new();
        for key in files.keys() {
            let Ok(rest) = key.strip_prefix(path) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            let name = first.as_os_str().to_string_lossy().into_owned();
            let is_dir = components.next().is_some();
            if !entries.iter().any(|e| e.name == name) {
                entries.push(DirEntry { name, is_dir });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn metadata(&self, path: &Path) -> Result<FileStat> {
        let files = self.files.read();
        if let Some(data) = files.get(path) {
            return Ok(FileStat {
                size: data.len() as u64,
                is_dir: false,
            });
        }
        if Self::is_dir_of(&files, path) {
            return Ok(FileStat {
                size: 0,
                is_dir: true,
            });
        }
        Err(Self::not_found(path).into())
    }

    fn exists(&self, path: &Path) -> bool {
        let files = self.files.read();
        files.contains_key(path) || Self::is_dir_of(&files, path)
    }
}
