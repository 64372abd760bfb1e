//! Fetching source media.

use crate::errors::{BuildError, BuildResult};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fetches a URL into a local file.
#[async_trait]
pub trait Downloader: Send + Sync + fmt::Debug {
    /// Writes the content at `url` to `dest`. Returns the byte count.
    async fn download(&self, url: &str, dest: &Path) -> BuildResult<u64>;
}

/// Returns the local path for `file://` URLs and plain paths.
#[must_use]
pub fn local_source(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    (!url.contains("://")).then(|| PathBuf::from(url))
}

/// Copies local files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDownloader;

#[async_trait]
impl Downloader for FileDownloader {
    async fn download(&self, url: &str, dest: &Path) -> BuildResult<u64> {
        let source = local_source(url).ok_or_else(|| BuildError::Download {
            url: url.to_string(),
            reason: "not a local path".into(),
        })?;
        tokio::fs::copy(&source, dest)
            .await
            .map_err(|e| BuildError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Streams HTTP(S) downloads to disk.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpDownloader {
    /// Creates a downloader with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path) -> BuildResult<u64> {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let failed = |reason: String| BuildError::Download {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| failed(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(url, bytes = written, "download finished");
        Ok(written)
    }
}

/// Dispatches on the URL scheme.
#[derive(Debug, Clone, Default)]
pub struct DefaultDownloader {
    file: FileDownloader,
    #[cfg(feature = "http")]
    http: HttpDownloader,
}

impl DefaultDownloader {
    /// Creates the default downloader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Downloader for DefaultDownloader {
    async fn download(&self, url: &str, dest: &Path) -> BuildResult<u64> {
        if local_source(url).is_some() {
            return self.file.download(url, dest).await;
        }
        #[cfg(feature = "http")]
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.http.download(url, dest).await;
        }
        Err(BuildError::Download {
            url: url.to_string(),
            reason: "unsupported URL scheme".into(),
        })
    }
}
