//! Resource scanners: enumerate and read migration scripts by location
//!
//! A location is `scheme:path` (`file:migrations`, `memory:migrations`) or a
//! bare path, which means `file:`. The [`ScannerRegistry`] maps schemes to
//! scanners; it is built once at startup and handed to the repository.

use crate::migration::MigrationError;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub const FILE_SCHEME: &str = "file";
pub const MEMORY_SCHEME: &str = "memory";

/// Enumerates and reads script resources for one packaging scheme
pub trait ResourceScanner: Send + Sync {
    /// Names of all resources under `location`, as paths this scanner can read back
    ///
    /// The order is the scanner's own; duplicate resolution follows it.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the location cannot be enumerated.
    fn list_resources(&self, location: &str) -> io::Result<Vec<String>>;

    /// # Errors
    ///
    /// Returns an `io::Error` if the resource cannot be read.
    fn read_resource(&self, path: &str) -> io::Result<String>;
}

/// Scans a directory on the local filesystem (non-recursive, sorted by name)
#[derive(Debug, Clone)]
pub struct FileSystemScanner {
    base_dir: PathBuf,
}

impl FileSystemScanner {
    /// Scanner resolving locations relative to `base_dir`
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }
}

impl ResourceScanner for FileSystemScanner {
    fn list_resources(&self, location: &str) -> io::Result<Vec<String>> {
        let location = location.trim_end_matches('/');
        let dir = self.base_dir.join(location);
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| format!("{location}/{name}"))
            .collect())
    }

    fn read_resource(&self, path: &str) -> io::Result<String> {
        fs::read_to_string(self.base_dir.join(path))
    }
}

/// Scripts held in memory, enumerated in insertion order
///
/// Useful for scripts embedded with `include_str!` and for tests.
#[derive(Debug, Default)]
pub struct MemoryScanner {
    resources: RwLock<Vec<(String, String)>>,
}

impl MemoryScanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`MemoryScanner::insert`]
    #[must_use]
    pub fn with_script(self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    /// Add a script, or replace the content of an existing path in place
    pub fn insert(&self, path: impl Into<String>, content: impl Into<String>) {
        let path = path.into();
        let content = content.into();
        let mut resources = match self.resources.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match resources.iter_mut().find(|(p, _)| *p == path) {
            Some((_, existing)) => *existing = content,
            None => resources.push((path, content)),
        }
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        match self.resources.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ResourceScanner for MemoryScanner {
    fn list_resources(&self, location: &str) -> io::Result<Vec<String>> {
        let prefix = format!("{}/", location.trim_end_matches('/'));
        Ok(self
            .snapshot()
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| path.starts_with(&prefix))
            .collect())
    }

    fn read_resource(&self, path: &str) -> io::Result<String> {
        self.snapshot()
            .into_iter()
            .find(|(p, _)| p == path)
            .map(|(_, content)| content)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no resource at {path}")))
    }
}

/// Split a location into scheme and path; bare paths use the `file` scheme
pub fn split_location(location: &str) -> (&str, &str) {
    match location.split_once(':') {
        // single letters are drive prefixes, not schemes
        Some((scheme, path))
            if scheme.len() > 1 && scheme.bytes().all(|b| b.is_ascii_lowercase()) =>
        {
            (scheme, path)
        }
        _ => (FILE_SCHEME, location),
    }
}

/// Explicit scheme → scanner mapping
#[derive(Clone, Default)]
pub struct ScannerRegistry {
    scanners: HashMap<String, Arc<dyn ResourceScanner>>,
}

impl fmt::Debug for ScannerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<&String> = self.scanners.keys().collect();
        schemes.sort();
        f.debug_struct("ScannerRegistry").field("schemes", &schemes).finish()
    }
}

impl ScannerRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a `file` scanner rooted at `base_dir`
    pub fn filesystem(base_dir: impl AsRef<Path>) -> Self {
        Self::new().with_scanner(FILE_SCHEME, Arc::new(FileSystemScanner::new(base_dir)))
    }

    #[must_use]
    pub fn with_scanner(mut self, scheme: impl Into<String>, scanner: Arc<dyn ResourceScanner>) -> Self {
        self.register(scheme, scanner);
        self
    }

    pub fn register(&mut self, scheme: impl Into<String>, scanner: Arc<dyn ResourceScanner>) {
        self.scanners.insert(scheme.into(), scanner);
    }

    /// Scanner and path for a location or resource locator
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Location` if no scanner handles the scheme.
    pub fn resolve<'l>(&self, location: &'l str) -> Result<(&str, &'l str, &dyn ResourceScanner), MigrationError> {
        let (scheme, path) = split_location(location);
        let (registered, scanner) = self.scanners.get_key_value(scheme).ok_or_else(|| MigrationError::Location {
            location: location.to_string(),
            message: format!("no scanner registered for scheme '{scheme}'"),
        })?;
        Ok((registered.as_str(), path, scanner.as_ref()))
    }
}
