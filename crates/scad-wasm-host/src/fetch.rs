//! Asset fetching over HTTP and from the local filesystem.
//!
//! [`Fetcher`] is the seam the cache fetches through. [`HttpFetcher`]
//! dispatches on the location:
//! - `http://` and `https://` go through a pooled `reqwest` client
//! - `file://` URLs and plain paths are read with `tokio::fs`
//!
//! A missing local file is reported like an HTTP 404 so that path fallback
//! treats both kinds of candidate the same way.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use scad_wasm_common::{FetchError, ScadError};

/// Retrieves the bytes at a location.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`. Only a success status yields bytes.
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Where a location string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    /// An `http(s)` URL.
    Remote(Url),
    /// A file on the local filesystem.
    Local(PathBuf),
}

impl AssetLocation {
    /// Classify `location`.
    pub fn parse(location: &str) -> Result<Self, FetchError> {
        match Url::parse(location) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(Self::Remote(url)),
                "file" => url
                    .to_file_path()
                    .map(Self::Local)
                    .map_err(|()| FetchError::InvalidUrl {
                        url: location.to_string(),
                        reason: "file URL has no local path".into(),
                    }),
                scheme => Err(FetchError::InvalidUrl {
                    url: location.to_string(),
                    reason: format!("unsupported scheme '{scheme}'"),
                }),
            },
            // Relative references like `./wasm/openscad.wasm` are local paths.
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(Self::Local(PathBuf::from(location)))
            }
            Err(e) => Err(FetchError::InvalidUrl {
                url: location.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Fetcher for HTTP(S) URLs and local files.
pub struct HttpFetcher {
    /// HTTP client (shared, connection pooled).
    client: Client,

    /// Number of fetches attempted.
    request_count: AtomicU64,
}

impl HttpFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ScadError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("scad-wasm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScadError::invalid_config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client))
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            request_count: AtomicU64::new(0),
        }
    }

    /// Number of fetches attempted.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    async fn fetch_remote(&self, url: Url) -> Result<Bytes, FetchError> {
        let location = url.to_string();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network {
                url: location.clone(),
                reason: if e.is_timeout() {
                    "request timed out".into()
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: location,
                status: status.as_u16(),
            });
        }

        response.bytes().await.map_err(|e| FetchError::Network {
            url: location,
            reason: e.to_string(),
        })
    }

    async fn fetch_local(path: PathBuf, location: &str) -> Result<Bytes, FetchError> {
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                Err(FetchError::Status {
                    url: location.to_string(),
                    status: 404,
                })
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(FetchError::Status {
                url: location.to_string(),
                status: 403,
            }),
            Err(e) => Err(FetchError::Network {
                url: location.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        debug!(url = %url, "Fetching asset");

        let body = match AssetLocation::parse(url)? {
            AssetLocation::Remote(remote) => self.fetch_remote(remote).await?,
            AssetLocation::Local(path) => Self::fetch_local(path, url).await?,
        };

        info!(url = %url, body_size = body.len(), "Asset fetched");
        Ok(body)
    }
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("request_count", &self.request_count())
            .finish_non_exhaustive()
    }
}
