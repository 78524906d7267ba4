//! Module path resolution.
//!
//! The kernel may be served from many places depending on how it is
//! deployed. [`ModulePathResolver`] picks a primary root and expands a file
//! name into an ordered, duplicate-free list of candidate locations. It does
//! no I/O; the loader tries candidates in order.

use tracing::debug;

use scad_wasm_common::EnvironmentSignals;
use scad_wasm_core::join_url;

/// Root used when nothing else is known.
pub const DEFAULT_BASE_PATH: &str = "./wasm";

/// Local development servers, tried after the primary root.
const DEV_SERVER_ROOTS: &[&str] = &[
    "http://localhost:8000/wasm",
    "http://127.0.0.1:8000/wasm",
    "http://localhost:8888/files/wasm",
];

/// Roots relative to the package.
const PACKAGE_ROOTS: &[&str] = &["./wasm", "../wasm"];

/// Common build output directories.
const BUILD_ROOTS: &[&str] = &["./dist/wasm", "./build/wasm", "./target/wasm"];

/// Resolves where the kernel and its assets live.
#[derive(Debug, Clone, Default)]
pub struct ModulePathResolver {
    base_url: Option<String>,
    signals: EnvironmentSignals,
}

impl ModulePathResolver {
    /// Create a resolver from deployment signals.
    pub fn new(signals: EnvironmentSignals) -> Self {
        Self {
            base_url: None,
            signals,
        }
    }

    /// Use `base_url` as the primary root, overriding every signal.
    #[must_use]
    pub fn with_primary(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = (!base_url.trim().is_empty()).then_some(base_url);
        self
    }

    /// The primary root.
    ///
    /// Priority: explicit base URL, embedded widget assets, notebook server,
    /// local directory, then [`DEFAULT_BASE_PATH`].
    pub fn resolve_base_path(&self) -> String {
        let resolved = if let Some(base) = &self.base_url {
            base.clone()
        } else if let Some(widget) = &self.signals.widget_asset_url {
            widget.clone()
        } else if let Some(origin) = &self.signals.notebook_origin {
            join_url(origin, "files/wasm")
        } else if let Some(dir) = &self.signals.local_dir {
            dir.display().to_string()
        } else {
            DEFAULT_BASE_PATH.to_string()
        };

        trim_root(&resolved).to_string()
    }

    /// Every root to try, primary first, without duplicates.
    pub fn candidate_roots(&self) -> Vec<String> {
        let primary = self.resolve_base_path();
        let mut roots: Vec<String> = Vec::new();

        let all = std::iter::once(primary.as_str())
            .chain(DEV_SERVER_ROOTS.iter().copied())
            .chain(PACKAGE_ROOTS.iter().copied())
            .chain(BUILD_ROOTS.iter().copied());

        for root in all {
            let root = trim_root(root);
            if !roots.iter().any(|r| r == root) {
                roots.push(root.to_string());
            }
        }

        debug!(primary = %primary, count = roots.len(), "Candidate roots resolved");
        roots
    }

    /// Every location to try for `filename`, in order.
    pub fn candidate_paths(&self, filename: &str) -> Vec<String> {
        self.candidate_roots()
            .iter()
            .map(|root| join_url(root, filename))
            .collect()
    }
}

fn trim_root(root: &str) -> &str {
    let trimmed = root.trim().trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_base_path() {
        let resolver = ModulePathResolver::default();
        assert_eq!(resolver.resolve_base_path(), "./wasm");
    }

    #[test]
    fn test_priority() {
        let signals = EnvironmentSignals {
            widget_asset_url: Some("https://widget.example.com/static/".into()),
            notebook_origin: Some("http://localhost:8888".into()),
            local_dir: Some(PathBuf::from("/opt/scad")),
        };

        let resolver = ModulePathResolver::new(signals.clone());
        assert_eq!(resolver.resolve_base_path(), "https://widget.example.com/static");

        let resolver = resolver.with_primary("https://cdn.example.com/wasm");
        assert_eq!(resolver.resolve_base_path(), "https://cdn.example.com/wasm");

        let resolver = ModulePathResolver::new(EnvironmentSignals {
            widget_asset_url: None,
            ..signals
        });
        assert_eq!(resolver.resolve_base_path(), "http://localhost:8888/files/wasm");

        let resolver = ModulePathResolver::new(EnvironmentSignals {
            local_dir: Some(PathBuf::from("/opt/scad")),
            ..Default::default()
        });
        assert_eq!(resolver.resolve_base_path(), "/opt/scad");
    }

    #[test]
    fn test_empty_primary_is_ignored() {
        let resolver = ModulePathResolver::default().with_primary("  ");
        assert_eq!(resolver.resolve_base_path(), "./wasm");
    }

    #[test]
    fn test_candidate_order_without_duplicates() {
        let resolver = ModulePathResolver::default();
        let roots = resolver.candidate_roots();

        assert_eq!(
            roots,
            vec![
                "./wasm",
                "http://localhost:8000/wasm",
                "http://127.0.0.1:8000/wasm",
                "http://localhost:8888/files/wasm",
                "../wasm",
                "./dist/wasm",
                "./build/wasm",
                "./target/wasm",
            ]
        );
    }

    #[test]
    fn test_candidate_paths_start_with_primary() {
        let resolver = ModulePathResolver::default().with_primary("https://cdn.example.com/wasm/");
        let paths = resolver.candidate_paths("openscad.wasm");

        assert_eq!(paths[0], "https://cdn.example.com/wasm/openscad.wasm");
        assert_eq!(paths[1], "http://localhost:8000/wasm/openscad.wasm");
        assert_eq!(paths.len(), 9);
    }
}
