//! Module and dataset sources.
//!
//! A location is either an HTTP(S) URL or a local path. Dataset requests
//! ask for JSON and bypass caches.

use permbridge_core::{BindingStage, BridgeError, BridgeResult, JsonDataset};
use reqwest::header::{ACCEPT, CACHE_CONTROL, PRAGMA};
use reqwest::{Client, Url};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Location parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    /// Empty location string
    #[error("Empty location")]
    Empty,

    /// Scheme other than http, https, or file
    #[error("Unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    /// URL did not parse
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// Location as given
        url: String,
        /// Parser message
        reason: String,
    },
}

/// Where a module or dataset comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// HTTP or HTTPS URL
    Http(Url),
    /// Local file
    File(PathBuf),
}

impl FromStr for Location {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocationError::Empty);
        }

        match s.split_once("://") {
            Some((scheme, _)) if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => {
                Url::parse(s)
                    .map(Self::Http)
                    .map_err(|e| LocationError::InvalidUrl {
                        url: s.to_string(),
                        reason: e.to_string(),
                    })
            }
            Some((scheme, path)) if scheme.eq_ignore_ascii_case("file") => {
                Ok(Self::File(PathBuf::from(path)))
            }
            Some((scheme, _)) => Err(LocationError::UnsupportedScheme(scheme.to_string())),
            None => Ok(Self::File(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{url}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Fetches bytes from locations
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: Client,
}

impl SourceFetcher {
    /// Create a fetcher with an optional request timeout
    ///
    /// # Errors
    ///
    /// Returns a binding failure if the HTTP client cannot be built
    pub fn new(timeout: Option<Duration>) -> BridgeResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            BridgeError::binding(BindingStage::FetchModule, format!("http client: {e}"))
        })?;
        Ok(Self { client })
    }

    /// Fetch the module binary
    ///
    /// # Errors
    ///
    /// Returns a binding failure at the fetch-module stage
    pub async fn fetch_module(&self, location: &Location) -> BridgeResult<Vec<u8>> {
        let bytes = self.fetch(location, BindingStage::FetchModule).await?;
        tracing::debug!(location = %location, bytes = bytes.len(), "fetched module");
        Ok(bytes)
    }

    /// Fetch and parse the dataset
    ///
    /// # Errors
    ///
    /// Returns a binding failure at the fetch-dataset stage, or at the
    /// parse-dataset stage if the body is not a JSON object
    pub async fn fetch_dataset(&self, location: &Location) -> BridgeResult<JsonDataset> {
        let bytes = self.fetch(location, BindingStage::FetchDataset).await?;
        let dataset = JsonDataset::from_slice(&bytes)?;
        tracing::debug!(location = %location, entries = dataset.len(), "fetched dataset");
        Ok(dataset)
    }

    async fn fetch(&self, location: &Location, stage: BindingStage) -> BridgeResult<Vec<u8>> {
        let failed = |e: &dyn fmt::Display| BridgeError::binding(stage, format!("{location}: {e}"));

        match location {
            Location::File(path) => tokio::fs::read(path).await.map_err(|e| failed(&e)),
            Location::Http(url) => {
                let mut request = self.client.get(url.clone());
                if stage == BindingStage::FetchDataset {
                    request = request
                        .header(ACCEPT, "application/json")
                        .header(CACHE_CONTROL, "no-cache")
                        .header(PRAGMA, "no-cache");
                }
                let response = request
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|e| failed(&e))?;
                let body = response.bytes().await.map_err(|e| failed(&e))?;
                Ok(body.to_vec())
            }
        }
    }
}
