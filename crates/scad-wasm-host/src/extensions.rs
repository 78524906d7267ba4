//! Optional kernel extensions: fonts and the MCAD library.
//!
//! An extension is a directory next to the module containing a
//! `manifest.json`:
//!
//! ```json
//! { "mount": "/fonts", "files": ["fonts.conf", "LiberationSans-Regular.ttf"] }
//! ```
//!
//! Applying an extension fetches the manifest and every listed file through
//! the asset cache and writes them into the instance filesystem under the
//! mount point. Failures are reported as `OptionalAssetUnavailable`; the
//! loader logs them and carries on. A manifest is applied whole or not at
//! all: files written before a failure are unlinked again.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cache::AssetFetchCache;
use scad_wasm_common::ScadError;
use scad_wasm_core::vfs::join_guest_path;
use scad_wasm_core::{LocateFile, VirtualFs, WasmInstance};

/// A named asset bundle mounted into the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    /// Name used in logs and errors.
    pub name: &'static str,
    /// Directory under the module root.
    pub dir: &'static str,
    /// Mount point when the manifest names none.
    pub default_mount: &'static str,
}

/// Fonts used by `text()`.
pub const FONTS: Extension = Extension {
    name: "fonts",
    dir: "fonts",
    default_mount: "/fonts",
};

/// The MCAD library.
pub const MCAD: Extension = Extension {
    name: "mcad",
    dir: "mcad",
    default_mount: "/libraries/MCAD",
};

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    mount: Option<String>,
    files: Vec<String>,
}

/// Result of applying an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedExtension {
    pub mount: String,
    pub files: usize,
    pub bytes: u64,
}

impl Extension {
    fn unavailable(&self, reason: impl ToString) -> ScadError {
        ScadError::OptionalAssetUnavailable {
            asset: self.name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Fetch the extension's files and write them into `instance`.
    pub async fn apply(
        &self,
        cache: &AssetFetchCache,
        locate: &LocateFile,
        instance: &dyn WasmInstance,
    ) -> Result<AppliedExtension, ScadError> {
        let manifest_url = locate.locate(&format!("{}/manifest.json", self.dir));
        let manifest = cache
            .fetch_with_cache(&manifest_url)
            .await
            .map_err(|e| self.unavailable(e))?;
        let manifest: Manifest = serde_json::from_slice(&manifest.body)
            .map_err(|e| self.unavailable(format!("invalid manifest: {e}")))?;

        let mount = manifest
            .mount
            .unwrap_or_else(|| self.default_mount.to_string());

        let mut written = Vec::with_capacity(manifest.files.len());
        let bytes = match self
            .mount_files(cache, locate, instance.fs(), &mount, &manifest.files, &mut written)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                rollback(self.name, instance.fs(), &written);
                return Err(e);
            }
        };

        info!(
            extension = self.name,
            mount = %mount,
            files = manifest.files.len(),
            bytes,
            "Extension applied"
        );

        Ok(AppliedExtension {
            mount,
            files: manifest.files.len(),
            bytes,
        })
    }

    /// Fetch and write each file, recording every path written.
    async fn mount_files(
        &self,
        cache: &AssetFetchCache,
        locate: &LocateFile,
        fs: &dyn VirtualFs,
        mount: &str,
        files: &[String],
        written: &mut Vec<String>,
    ) -> Result<u64, ScadError> {
        let mut bytes = 0u64;

        for file in files {
            let url = locate.locate(&format!("{}/{file}", self.dir));
            let asset = cache
                .fetch_with_cache(&url)
                .await
                .map_err(|e| self.unavailable(e))?;

            let path = join_guest_path(mount, file);
            fs.write_file(&path, &asset.body)
                .map_err(|e| self.unavailable(e))?;

            debug!(extension = self.name, path = %path, size = asset.size(), "Extension file mounted");
            bytes += asset.size() as u64;
            written.push(path);
        }

        Ok(bytes)
    }
}

fn rollback(extension: &str, fs: &dyn VirtualFs, written: &[String]) {
    for path in written {
        if let Err(e) = fs.unlink(path) {
            warn!(extension, path = %path, error = %e, "Extension file not rolled back");
        }
    }
    if !written.is_empty() {
        debug!(extension, files = written.len(), "Partial extension rolled back");
    }
}
