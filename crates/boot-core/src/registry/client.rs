//! Upstream registry client.
//!
//! Fetches crate metadata, raw index entries, and `.crate` archives over
//! HTTP. Redirects are followed; any non-2xx response is an error. Only the
//! `fetch` path uses the network; bootstrap builds run entirely against the
//! local cache.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tracing::info;

use crate::USER_AGENT;
use crate::registry::index;

/// Default API root for crate metadata and downloads.
pub const CRATES_API: &str = "https://crates.io/api/v1/crates";

/// Errors produced by the registry client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The request failed or the server answered non-2xx.
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A fetched archive could not be written to the cache.
    #[error("failed to store archive: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP client for the upstream registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    api_root: String,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    /// Client against the default registry.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            api_root: CRATES_API.to_string(),
        }
    }

    /// Client against a different API root (mirrors, test servers).
    pub fn with_api_root(api_root: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_root: api_root.into(),
        }
    }

    /// Fetch the registry's metadata object for a crate: one entry per
    /// published version.
    pub async fn crate_metadata(&self, name: &str) -> Result<serde_json::Value, ClientError> {
        let url = format!("{}/{name}", self.api_root);
        let response = self.get(&url).await?;
        Ok(response.json().await?)
    }

    /// Fetch the raw line-oriented index entry for a crate from an index
    /// tree served at `index_root`.
    pub async fn index_entry(&self, index_root: &str, name: &str) -> Result<String, ClientError> {
        let url = format!("{index_root}/{}", index::index_rel(name));
        let response = self.get(&url).await?;
        Ok(response.text().await?)
    }

    /// Download the `.crate` archive for one published version.
    pub async fn download_crate(&self, name: &str, version: &str) -> Result<Bytes, ClientError> {
        let url = format!("{}/{name}/{version}/download", self.api_root);
        let response = self.get(&url).await?;
        Ok(response.bytes().await?)
    }

    /// Download a `.crate` archive into the cache directory under the name
    /// the archive store expects, returning its path.
    pub async fn fetch_crate_archive(
        &self,
        name: &str,
        version: &str,
        cache_dir: &Path,
    ) -> Result<PathBuf, ClientError> {
        let bytes = self.download_crate(name, version).await?;
        std::fs::create_dir_all(cache_dir)?;
        let dest = cache_dir.join(format!("{name}-{version}.crate"));
        std::fs::write(&dest, &bytes)?;
        info!("fetched {name}-{version}.crate ({} bytes)", bytes.len());
        Ok(dest)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_download_crate() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/demo/1.0.0/download")
            .with_status(200)
            .with_body("archive-bytes")
            .create_async()
            .await;

        let client = RegistryClient::with_api_root(server.url());
        let bytes = client.download_crate("demo", "1.0.0").await.unwrap();
        assert_eq!(&bytes[..], b"archive-bytes");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_crate_archive_writes_cache_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/demo/1.0.0/download")
            .with_status(200)
            .with_body("archive-bytes")
            .create_async()
            .await;

        let cache = tempdir().unwrap();
        let client = RegistryClient::with_api_root(server.url());
        let dest = client
            .fetch_crate_archive("demo", "1.0.0", cache.path())
            .await
            .unwrap();

        assert_eq!(dest, cache.path().join("demo-1.0.0.crate"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive-bytes");
    }

    #[tokio::test]
    async fn test_crate_metadata() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/demo")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"crate":{"name":"demo"},"versions":[{"num":"1.0.0"}]}"#)
            .create_async()
            .await;

        let client = RegistryClient::with_api_root(server.url());
        let metadata = client.crate_metadata("demo").await.unwrap();
        assert_eq!(metadata["crate"]["name"], "demo");
    }

    #[tokio::test]
    async fn test_index_entry_uses_fanout_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/de/mo/demo")
            .with_status(200)
            .with_body("{\"vers\":\"1.0.0\"}\n")
            .create_async()
            .await;

        let client = RegistryClient::new();
        let entry = client.index_entry(&server.url(), "demo").await.unwrap();
        assert!(entry.contains("1.0.0"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_2xx_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ghost/0.1.0/download")
            .with_status(404)
            .create_async()
            .await;

        let client = RegistryClient::with_api_root(server.url());
        let err = client.download_crate("ghost", "0.1.0").await.unwrap_err();
        assert!(matches!(err, ClientError::Http(_)), "{err}");
    }
}
