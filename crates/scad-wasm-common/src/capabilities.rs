//! Static capability descriptor.
//!
//! [`Capabilities`] can be queried without initializing anything; it
//! describes what this build is able to do once a module is loaded.

use serde::{Deserialize, Serialize};

/// Maximum size of a single input or output file accepted by a render.
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Output formats understood by the render executor, by name.
pub const OUTPUT_FORMATS: &[&str] = &["stl", "binstl", "off"];

/// Feature descriptor consumed by diagnostics UIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(rename = "supportsWASM")]
    pub supports_wasm: bool,
    #[serde(rename = "supportsFonts")]
    pub supports_fonts: bool,
    #[serde(rename = "supportsMCAD")]
    pub supports_mcad: bool,
    #[serde(rename = "supportsManifold")]
    pub supports_manifold: bool,
    #[serde(rename = "outputFormats")]
    pub output_formats: Vec<String>,
    #[serde(rename = "maxFileSize")]
    pub max_file_size: u64,
    /// Whether renders can be offloaded to a background worker.
    #[serde(rename = "supportsWebWorkers")]
    pub supports_offload: bool,
}

impl Capabilities {
    /// Capabilities of this build.
    pub fn current() -> Self {
        Self {
            supports_wasm: true,
            supports_fonts: true,
            supports_mcad: true,
            supports_manifold: true,
            output_formats: OUTPUT_FORMATS.iter().map(ToString::to_string).collect(),
            max_file_size: MAX_FILE_SIZE,
            supports_offload: true,
        }
    }
}
