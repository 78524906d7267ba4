//! Virtual filesystem shared between host and guest.
//!
//! Renders exchange input and output with the kernel through files. The
//! [`VirtualFs`] trait is the contract; two implementations exist:
//! - [`MemFs`]: purely in memory, for instances that keep their filesystem
//!   inside the host process
//! - [`DirFs`]: a private host directory that is preopened into a WASI guest
//!   as `/` and removed on drop

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;
use tempfile::TempDir;
use tracing::debug;

use scad_wasm_common::ScadError;

/// File access on an instance's filesystem. Paths are absolute guest paths.
pub trait VirtualFs: Send + Sync {
    /// Create or replace a file, creating parent directories as needed.
    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), ScadError>;

    /// Read a whole file.
    fn read_file(&self, path: &str) -> Result<Vec<u8>, ScadError>;

    /// Remove a file. Fails if it does not exist.
    fn unlink(&self, path: &str) -> Result<(), ScadError>;

    /// Names of the entries directly inside `path`. Empty if the directory
    /// does not exist.
    fn list_dir(&self, path: &str) -> Result<Vec<String>, ScadError>;

    /// Size of a file in bytes.
    fn file_size(&self, path: &str) -> Result<u64, ScadError>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &str) -> bool {
        self.file_size(path).is_ok()
    }
}

/// Normalize a guest path to `/a/b/c`, rejecting `..`.
pub fn normalize_path(path: &str) -> Result<String, ScadError> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(ScadError::filesystem(
                    "resolve",
                    path,
                    "parent directory components are not allowed",
                ));
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Join a guest directory and a file name.
pub fn join_guest_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// In-memory filesystem.
#[derive(Debug, Default)]
pub struct MemFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemFs {
    /// Create an empty filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files stored.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Returns `true` if no files are stored.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }
}

impl VirtualFs for MemFs {
    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), ScadError> {
        let path = normalize_path(path)?;
        self.files.write().insert(path, data.to_vec());
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, ScadError> {
        let normalized = normalize_path(path)?;
        self.files
            .read()
            .get(&normalized)
            .cloned()
            .ok_or_else(|| ScadError::filesystem("read", path, "no such file"))
    }

    fn unlink(&self, path: &str) -> Result<(), ScadError> {
        let normalized = normalize_path(path)?;
        self.files
            .write()
            .remove(&normalized)
            .map(|_| ())
            .ok_or_else(|| ScadError::filesystem("unlink", path, "no such file"))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, ScadError> {
        let dir = normalize_path(path)?;
        let prefix = if dir == "/" { dir } else { format!("{dir}/") };

        let files = self.files.read();
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect();
        names.dedup();
        Ok(names)
    }

    fn file_size(&self, path: &str) -> Result<u64, ScadError> {
        let normalized = normalize_path(path)?;
        self.files
            .read()
            .get(&normalized)
            .map(|data| data.len() as u64)
            .ok_or_else(|| ScadError::filesystem("stat", path, "no such file"))
    }
}

/// Filesystem backed by a private host directory.
///
/// The directory is a [`TempDir`] and is removed recursively when the value
/// is dropped.
#[derive(Debug)]
pub struct DirFs {
    dir: TempDir,
}

impl DirFs {
    /// Create a fresh, uniquely named directory under the system temp dir.
    ///
    /// # Errors
    ///
    /// Returns `Filesystem` if the directory cannot be created.
    pub fn new_temp(prefix: &str) -> Result<Self, ScadError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir()
            .map_err(|e| ScadError::filesystem("mkdir", std::env::temp_dir().display().to_string(), e))?;

        debug!(root = %dir.path().display(), "Instance filesystem created");
        Ok(Self { dir })
    }

    /// Host directory mapped to the guest's `/`.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Map a guest path to a host path under the root.
    fn host_path(&self, path: &str) -> Result<PathBuf, ScadError> {
        let normalized = normalize_path(path)?;
        let relative = Path::new(normalized.trim_start_matches('/'));

        // normalize_path already rejects `..`; this guards against platform prefixes.
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ScadError::filesystem("resolve", path, "invalid path"));
        }
        Ok(self.root().join(relative))
    }
}

impl VirtualFs for DirFs {
    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), ScadError> {
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ScadError::filesystem("mkdir", path, e))?;
        }
        std::fs::write(&host, data).map_err(|e| ScadError::filesystem("write", path, e))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, ScadError> {
        let host = self.host_path(path)?;
        std::fs::read(&host).map_err(|e| ScadError::filesystem("read", path, e))
    }

    fn unlink(&self, path: &str) -> Result<(), ScadError> {
        let host = self.host_path(path)?;
        std::fs::remove_file(&host).map_err(|e| ScadError::filesystem("unlink", path, e))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, ScadError> {
        let host = self.host_path(path)?;
        let entries = match std::fs::read_dir(&host) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ScadError::filesystem("list", path, e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, path: &str) -> Result<u64, ScadError> {
        let host = self.host_path(path)?;
        let metadata = std::fs::metadata(&host).map_err(|e| ScadError::filesystem("stat", path, e))?;
        if metadata.is_file() {
            Ok(metadata.len())
        } else {
            Err(ScadError::filesystem("stat", path, "not a file"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/tmp//a.scad").unwrap(), "/tmp/a.scad");
        assert_eq!(normalize_path("tmp/./a").unwrap(), "/tmp/a");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert!(normalize_path("/tmp/../etc/passwd").is_err());
    }

    #[test]
    fn test_memfs_roundtrip_and_unlink() {
        let fs = MemFs::new();
        fs.write_file("/tmp/input_1.scad", b"cube(1);").unwrap();

        assert!(fs.exists("/tmp/input_1.scad"));
        assert_eq!(fs.read_file("/tmp/input_1.scad").unwrap(), b"cube(1);");
        assert_eq!(fs.file_size("/tmp/input_1.scad").unwrap(), 8);

        fs.unlink("/tmp/input_1.scad").unwrap();
        assert!(!fs.exists("/tmp/input_1.scad"));
        assert!(fs.unlink("/tmp/input_1.scad").is_err());
    }

    #[test]
    fn test_memfs_list_dir() {
        let fs = MemFs::new();
        fs.write_file("/tmp/a", b"1").unwrap();
        fs.write_file("/tmp/b", b"22").unwrap();
        fs.write_file("/tmp/sub/c", b"333").unwrap();
        fs.write_file("/fonts/x.ttf", b"").unwrap();

        assert_eq!(fs.list_dir("/tmp").unwrap(), vec!["a", "b", "sub"]);
        assert_eq!(fs.list_dir("/").unwrap(), vec!["fonts", "tmp"]);
        assert!(fs.list_dir("/missing").unwrap().is_empty());
    }

    #[test]
    fn test_dirfs_maps_into_root_and_cleans_up() {
        let fs = DirFs::new_temp("scad-wasm-test").unwrap();
        let root = fs.root().to_path_buf();

        fs.write_file("/tmp/output_1.stl", b"solid").unwrap();
        assert!(root.join("tmp/output_1.stl").is_file());
        assert_eq!(fs.list_dir("/tmp").unwrap(), vec!["output_1.stl"]);
        assert_eq!(fs.file_size("/tmp/output_1.stl").unwrap(), 5);
        assert!(fs.file_size("/tmp").is_err());
        assert!(fs.list_dir("/nothing").unwrap().is_empty());

        fs.unlink("/tmp/output_1.stl").unwrap();
        assert!(!fs.exists("/tmp/output_1.stl"));

        drop(fs);
        assert!(!root.exists());
    }

    #[test]
    fn test_dirfs_rejects_escape() {
        let fs = DirFs::new_temp("scad-wasm-test").unwrap();
        assert!(fs.write_file("/../escape", b"x").is_err());
    }

    #[test]
    fn test_join_guest_path() {
        assert_eq!(join_guest_path("/tmp/", "a.scad"), "/tmp/a.scad");
        assert_eq!(join_guest_path("/fonts", "/b.ttf"), "/fonts/b.ttf");
    }
}
