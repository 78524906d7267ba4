//! Error types for scad-wasm.
//!
//! This module defines the error hierarchy using `thiserror`:
//! - [`ScadError`]: Top-level errors surfaced by the loader, executor and dispatcher
//! - [`FetchError`]: Failures while fetching an asset over HTTP or from disk
//!
//! Every variant carries owned strings rather than foreign error values so
//! that one outcome can be cloned and handed to every caller waiting on a
//! shared initialization.

use std::error::Error as StdError;

use thiserror::Error;

/// Top-level scad-wasm errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScadError {
    /// No candidate base path yielded a fetchable module.
    #[error("Failed to load {file} from any of {attempts} candidate paths: {last_error}")]
    PathResolutionExhausted {
        /// The file that was being located.
        file: String,
        /// Number of candidate URLs tried.
        attempts: usize,
        /// The failure reported by the last candidate.
        last_error: String,
    },

    /// An optional asset (fonts, MCAD) could not be loaded.
    #[error("Optional asset '{asset}' unavailable: {reason}")]
    OptionalAssetUnavailable {
        /// Name of the extension.
        asset: String,
        /// Description of the failure.
        reason: String,
    },

    /// The WebAssembly runtime failed to start.
    #[error("Failed to instantiate WASM module: {reason}")]
    InstantiationFailure {
        /// Description of the failure.
        reason: String,
    },

    /// A render was attempted before a ready instance existed.
    #[error("WASM module not initialized; call initialize() first")]
    NotInitialized,

    /// The entry point returned a non-zero exit status.
    #[error("Entry point exited with code {exit_code}")]
    EntryPointFailure {
        /// The exit code returned by the entry point.
        exit_code: i32,
    },

    /// A render or offload call exceeded its allotted time.
    #[error("Operation '{operation}' timed out after {duration_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout in milliseconds.
        duration_ms: u64,
    },

    /// The entry point reported success but produced no output bytes.
    #[error("Render produced no output at {path}")]
    EmptyOutput {
        /// The output path that was empty or missing.
        path: String,
    },

    /// A render input or output exceeded the size limit.
    #[error("{what} is {size} bytes, over the {limit} byte limit")]
    FileTooLarge {
        /// Which file was too large (`Source` or `Output`).
        what: String,
        /// Its size in bytes.
        size: u64,
        /// The configured limit in bytes.
        limit: u64,
    },

    /// The offload channel is unusable.
    #[error("Offload transport failure: {reason}")]
    TransportFailure {
        /// Description of the failure.
        reason: String,
    },

    /// A render failed; `source` carries the original cause.
    #[error("Render {request_id} failed: {source}")]
    Render {
        /// The per-call request identifier.
        request_id: String,
        /// The underlying failure.
        #[source]
        source: Box<ScadError>,
    },

    /// A virtual filesystem operation failed.
    #[error("Filesystem {operation} failed for '{path}': {reason}")]
    Filesystem {
        /// The operation (write, read, unlink, list).
        operation: String,
        /// The guest path involved.
        path: String,
        /// Description of the failure.
        reason: String,
    },

    /// Fetching an asset failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A WebAssembly trap or host error occurred during invocation.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// An offloaded command failed inside the worker.
    #[error("Offloaded command failed: {message}")]
    Remote {
        /// The worker's error message.
        message: String,
    },

    /// A malformed offload message was received.
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Description of the protocol error.
        reason: String,
    },
}

/// Errors from fetching assets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The server (or filesystem) answered with a non-success status.
    #[error("Fetch of {url} failed with status {status}")]
    Status {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The request could not be completed at all.
    #[error("Fetch of {url} failed: {reason}")]
    Network {
        /// The URL that was requested.
        url: String,
        /// Description of the failure.
        reason: String,
    },

    /// The URL could not be interpreted.
    #[error("Invalid asset URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Description of the problem.
        reason: String,
    },
}

impl FetchError {
    /// The URL this error refers to.
    pub fn url(&self) -> &str {
        match self {
            Self::Status { url, .. } | Self::Network { url, .. } | Self::InvalidUrl { url, .. } => {
                url
            }
        }
    }
}

impl ScadError {
    /// Create a new `InstantiationFailure` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::InstantiationFailure {
            reason: reason.into(),
        }
    }

    /// Create a new `Filesystem` error.
    pub fn filesystem(
        operation: impl Into<String>,
        path: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Filesystem {
            operation: operation.into(),
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new `Timeout` error.
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Create a new `FileTooLarge` error.
    pub fn file_too_large(what: impl Into<String>, size: u64, limit: u64) -> Self {
        Self::FileTooLarge {
            what: what.into(),
            size,
            limit,
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `TransportFailure` error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::TransportFailure {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `Remote` error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a new `Protocol` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Wrap a render failure with the request it belongs to.
    pub fn render(request_id: impl Into<String>, source: ScadError) -> Self {
        Self::Render {
            request_id: request_id.into(),
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through `Render` wrappers.
    pub fn root_cause(&self) -> &ScadError {
        match self {
            Self::Render { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns `true` if the failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout { .. })
    }

    /// Returns `true` if a later `initialize()` may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::PathResolutionExhausted { .. }
                | Self::Fetch(_)
                | Self::Timeout { .. }
                | Self::TransportFailure { .. }
        )
    }
}

/// Render an error together with its `source()` chain, one cause per line.
///
/// Used as the `stack` field of offload responses.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        current = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScadError::EntryPointFailure { exit_code: 1 };
        assert_eq!(err.to_string(), "Entry point exited with code 1");

        let err = ScadError::NotInitialized;
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn test_render_wrapper_keeps_cause() {
        let err = ScadError::render("abc", ScadError::EntryPointFailure { exit_code: 1 });

        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("exit"));
        assert_eq!(
            err.root_cause(),
            &ScadError::EntryPointFailure { exit_code: 1 }
        );
    }

    #[test]
    fn test_error_from_fetch() {
        let fetch_err = FetchError::Status {
            url: "http://x/openscad.wasm".into(),
            status: 404,
        };
        let err: ScadError = fetch_err.clone().into();

        assert!(matches!(err, ScadError::Fetch(_)));
        assert_eq!(fetch_err.url(), "http://x/openscad.wasm");
    }

    #[test]
    fn test_file_too_large_display() {
        let err = ScadError::file_too_large("Output", 11, 10);
        assert_eq!(err.to_string(), "Output is 11 bytes, over the 10 byte limit");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_is_timeout() {
        assert!(ScadError::timeout("render", 100).is_timeout());
        assert!(ScadError::render("id", ScadError::timeout("render", 100)).is_timeout());
        assert!(!ScadError::NotInitialized.is_timeout());
    }

    #[test]
    fn test_is_retryable() {
        assert!(
            ScadError::PathResolutionExhausted {
                file: "openscad.wasm".into(),
                attempts: 3,
                last_error: "404".into(),
            }
            .is_retryable()
        );
        assert!(!ScadError::instantiation("bad magic").is_retryable());
    }

    #[test]
    fn test_error_chain() {
        let err = ScadError::render("id-1", ScadError::EmptyOutput { path: "/tmp/o".into() });
        let chain = error_chain(&err);

        assert!(chain.starts_with("Render id-1 failed"));
        assert!(chain.contains("caused by: Render produced no output at /tmp/o"));
    }
}
