//! Remote endpoints for companion updates.

use std::path::Path;
use std::time::Duration;

use super::{RemoteVersion, UpdateError};

/// Name of the archive published next to the version descriptor.
pub const ARCHIVE_NAME: &str = "latest.zip";

/// Default connect timeout for remote calls.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default total timeout for remote calls.
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a companion's version descriptor and archive come from.
pub trait UpdateSource: Send + Sync {
    /// Fetches the remote version descriptor.
    fn fetch_version(&self) -> Result<RemoteVersion, UpdateError>;

    /// Downloads the release archive to `dest`.
    fn download_archive(&self, dest: &Path) -> Result<(), UpdateError>;
}

/// HTTP(S) update source rooted at a base URL.
///
/// The descriptor is read from `<base>/version` and the archive from
/// `<base>/latest.zip`.
pub struct HttpUpdateSource {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpUpdateSource {
    /// Creates a source with the default timeouts.
    pub fn new(base_url: impl Into<String>) -> Result<Self, UpdateError> {
        Self::with_timeouts(base_url, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TOTAL_TIMEOUT)
    }

    /// Creates a source with explicit timeouts.
    ///
    /// Fails if the HTTP client cannot be built; a client without the
    /// requested timeouts is never substituted.
    pub fn with_timeouts(
        base_url: impl Into<String>,
        connect: Duration,
        total: Duration,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("addonhost/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect)
            .timeout(total)
            .build()
            .map_err(|e| UpdateError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Returns the base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, name: &str) -> Result<reqwest::blocking::Response, UpdateError> {
        let url = format!("{}/{}", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| UpdateError::Network(format!("GET {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        Ok(response)
    }
}

impl UpdateSource for HttpUpdateSource {
    fn fetch_version(&self) -> Result<RemoteVersion, UpdateError> {
        let body = self
            .get("version")?
            .text()
            .map_err(|e| UpdateError::Network(format!("Failed to read response: {}", e)))?;

        RemoteVersion::parse(&body)
    }

    fn download_archive(&self, dest: &Path) -> Result<(), UpdateError> {
        let bytes = self
            .get(ARCHIVE_NAME)?
            .bytes()
            .map_err(|e| UpdateError::Network(format!("Failed to read response: {}", e)))?;

        std::fs::write(dest, &bytes)?;
        Ok(())
    }
}
