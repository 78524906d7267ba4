//! Render execution against a kernel instance.
//!
//! [`RenderExecutor::render_to_source`] turns CAD source text into mesh bytes:
//!
//! 1. Create a [`RenderContext`] with a unique request id and scratch paths
//! 2. Write the source to the input path
//! 3. Build the argument list (see [`build_arguments`])
//! 4. Invoke the entry point under a timeout
//! 5. Read the output; an empty or oversized artifact is a failure
//! 6. Unlink both scratch files whatever happened
//!
//! Cleanup runs from a drop guard, so scratch files are also removed when the
//! caller abandons the render future.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::instance::{InstanceProvider, WasmInstance};
use crate::vfs::join_guest_path;
use scad_wasm_common::{RenderConfig, ScadError};

/// Extension of the scratch input file.
pub const SOURCE_EXTENSION: &str = "scad";

/// Mesh formats the kernel can export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// ASCII STL.
    Stl,
    /// Binary STL.
    #[default]
    BinStl,
    /// Object File Format.
    Off,
}

impl OutputFormat {
    /// Extension of the scratch output file.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Stl | Self::BinStl => "stl",
            Self::Off => "off",
        }
    }

    /// Explicit export flag, when the extension alone is ambiguous.
    pub fn export_flag(self) -> Option<&'static str> {
        match self {
            Self::BinStl => Some("--export-format=binstl"),
            Self::Stl | Self::Off => None,
        }
    }

    /// Name used in configuration and capability listings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stl => "stl",
            Self::BinStl => "binstl",
            Self::Off => "off",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ScadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stl" | "asciistl" => Ok(Self::Stl),
            "binstl" => Ok(Self::BinStl),
            "off" => Ok(Self::Off),
            other => Err(ScadError::invalid_config(format!(
                "Unsupported output format '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for a single render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    /// Enable the manifold geometry kernel.
    #[serde(default)]
    pub enable_manifold: bool,

    /// Output mesh format.
    #[serde(default)]
    pub output_format: OutputFormat,

    /// Timeout in milliseconds; the executor default applies when `None`.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
}

impl RenderOptions {
    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Per-render identifiers and scratch paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    /// Unique request identifier (`<unix-millis>-<random>`).
    pub request_id: String,
    /// Scratch path the source is written to.
    pub input_path: String,
    /// Scratch path the kernel writes its output to.
    pub output_path: String,
}

impl RenderContext {
    /// Create a context with a fresh request id.
    pub fn new(scratch_dir: &str, format: OutputFormat) -> Self {
        let request_id = generate_request_id();
        let input_path = join_guest_path(
            scratch_dir,
            &format!("input_{request_id}.{SOURCE_EXTENSION}"),
        );
        let output_path = join_guest_path(
            scratch_dir,
            &format!("output_{request_id}.{}", format.extension()),
        );

        Self {
            request_id,
            input_path,
            output_path,
        }
    }
}

/// Whether `name` is a scratch file created by a render.
pub fn is_scratch_file(name: &str) -> bool {
    name.starts_with("input_") || name.starts_with("output_")
}

/// Generate a collision-resistant request id: timestamp plus random suffix.
fn generate_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}-{}", &random[..8])
}

/// Build the entry-point arguments.
///
/// Order is fixed: input path, feature flags, export format, then `-o` and
/// the output path.
pub fn build_arguments(context: &RenderContext, options: &RenderOptions) -> Vec<String> {
    let mut args = vec![context.input_path.clone()];

    if options.enable_manifold {
        args.push("--enable=manifold".to_string());
    }

    if let Some(flag) = options.output_format.export_flag() {
        args.push(flag.to_string());
    }

    args.push("-o".to_string());
    args.push(context.output_path.clone());
    args
}

/// Removes scratch files when dropped.
struct ScratchGuard {
    instance: Arc<dyn WasmInstance>,
    paths: [String; 2],
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            // Best effort: the file may never have been created.
            if let Err(e) = self.instance.fs().unlink(path) {
                debug!(path = %path, error = %e, "Scratch file not removed");
            }
        }
    }
}

/// Executes renders against the instance supplied by an [`InstanceProvider`].
pub struct RenderExecutor {
    provider: Arc<dyn InstanceProvider>,
    config: RenderConfig,
    render_count: AtomicU64,
    failure_count: AtomicU64,
}

impl RenderExecutor {
    /// Create an executor.
    pub fn new(provider: Arc<dyn InstanceProvider>, config: RenderConfig) -> Self {
        Self {
            provider,
            config,
            render_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    /// Render `source` and return the output bytes.
    ///
    /// # Errors
    ///
    /// - `NotInitialized` when no instance is ready
    /// - `Render` wrapping `EntryPointFailure`, `Timeout`, `EmptyOutput`,
    ///   `FileTooLarge` or a filesystem/trap error otherwise
    #[instrument(skip(self, source), fields(source_len = source.len(), format = %options.output_format))]
    pub async fn render_to_source(
        &self,
        source: &str,
        options: &RenderOptions,
    ) -> Result<Vec<u8>, ScadError> {
        let instance = self
            .provider
            .current_instance()
            .ok_or(ScadError::NotInitialized)?;

        let render_number = self.render_count.fetch_add(1, Ordering::Relaxed) + 1;
        let context = RenderContext::new(&self.config.scratch_dir, options.output_format);
        let start = Instant::now();

        debug!(
            request_id = %context.request_id,
            render_number,
            "Render started"
        );

        let result = {
            let _cleanup = ScratchGuard {
                instance: Arc::clone(&instance),
                paths: [context.input_path.clone(), context.output_path.clone()],
            };
            self.execute(instance.as_ref(), &context, source, options)
                .await
        };

        let duration_ms = start.elapsed().as_millis();
        match result {
            Ok(bytes) => {
                info!(
                    request_id = %context.request_id,
                    output_bytes = bytes.len(),
                    duration_ms,
                    "Render completed"
                );
                Ok(bytes)
            }
            Err(error) => {
                self.failure_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request_id = %context.request_id,
                    error = %error,
                    duration_ms,
                    "Render failed"
                );
                Err(ScadError::render(context.request_id, error))
            }
        }
    }

    async fn execute(
        &self,
        instance: &dyn WasmInstance,
        context: &RenderContext,
        source: &str,
        options: &RenderOptions,
    ) -> Result<Vec<u8>, ScadError> {
        let limit = self.config.max_file_size;
        let source_len = source.len() as u64;
        if source_len > limit {
            return Err(ScadError::file_too_large("Source", source_len, limit));
        }

        instance
            .fs()
            .write_file(&context.input_path, source.as_bytes())?;

        let args = build_arguments(context, options);
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.timeout_ms);

        let exit_code =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), instance.invoke(&args))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(ScadError::timeout("render", timeout_ms)),
            };

        if exit_code != 0 {
            return Err(ScadError::EntryPointFailure { exit_code });
        }

        let empty = || ScadError::EmptyOutput {
            path: context.output_path.clone(),
        };

        let output_len = instance
            .fs()
            .file_size(&context.output_path)
            .map_err(|_| empty())?;
        if output_len == 0 {
            return Err(empty());
        }
        if output_len > limit {
            return Err(ScadError::file_too_large("Output", output_len, limit));
        }

        instance
            .fs()
            .read_file(&context.output_path)
            .map_err(|_| empty())
    }

    /// Number of renders started.
    pub fn render_count(&self) -> u64 {
        self.render_count.load(Ordering::Relaxed)
    }

    /// Number of renders that failed.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// The executor's defaults.
    pub fn config(&self) -> &RenderConfig {
        &self.config
    }
}

impl std::fmt::Debug for RenderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderExecutor")
            .field("render_count", &self.render_count())
            .field("timeout_ms", &self.config.timeout_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RenderContext {
        RenderContext {
            request_id: "1-abc".into(),
            input_path: "/tmp/input_1-abc.scad".into(),
            output_path: "/tmp/output_1-abc.stl".into(),
        }
    }

    #[test]
    fn test_arguments_full() {
        let options = RenderOptions {
            enable_manifold: true,
            output_format: OutputFormat::BinStl,
            timeout_ms: None,
        };

        assert_eq!(
            build_arguments(&context(), &options),
            vec![
                "/tmp/input_1-abc.scad",
                "--enable=manifold",
                "--export-format=binstl",
                "-o",
                "/tmp/output_1-abc.stl",
            ]
        );
    }

    #[test]
    fn test_arguments_minimal() {
        let options = RenderOptions {
            enable_manifold: false,
            output_format: OutputFormat::Stl,
            timeout_ms: None,
        };

        assert_eq!(
            build_arguments(&context(), &options),
            vec!["/tmp/input_1-abc.scad", "-o", "/tmp/output_1-abc.stl"]
        );
    }

    #[test]
    fn test_context_paths() {
        let ctx = RenderContext::new("/tmp", OutputFormat::Off);

        assert!(ctx.input_path.starts_with("/tmp/input_"));
        assert!(ctx.input_path.ends_with(".scad"));
        assert!(ctx.output_path.starts_with("/tmp/output_"));
        assert!(ctx.output_path.ends_with(".off"));
        assert!(ctx.input_path.contains(&ctx.request_id));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RenderContext::new("/tmp", OutputFormat::BinStl);
        let b = RenderContext::new("/tmp", OutputFormat::BinStl);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("binstl".parse::<OutputFormat>().unwrap(), OutputFormat::BinStl);
        assert_eq!("STL".parse::<OutputFormat>().unwrap(), OutputFormat::Stl);
        assert!("obj".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::default(), OutputFormat::BinStl);
    }

    #[test]
    fn test_options_json_shape() {
        let options: RenderOptions =
            serde_json::from_str(r#"{"enableManifold":true,"outputFormat":"binstl","timeout":1000}"#)
                .unwrap();

        assert!(options.enable_manifold);
        assert_eq!(options.output_format, OutputFormat::BinStl);
        assert_eq!(options.timeout_ms, Some(1000));
    }

    #[test]
    fn test_scratch_file_names() {
        assert!(is_scratch_file("input_1-a.scad"));
        assert!(is_scratch_file("output_1-a.stl"));
        assert!(!is_scratch_file("fonts.conf"));
    }
}
