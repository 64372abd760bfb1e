//! Local download cache.

use super::checksum::{sha256_hex, Checksum};
use super::download::{local_source, Downloader};
use crate::errors::{BuildError, BuildResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A directory of downloaded media, keyed by the SHA-256 of the source URL.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    /// Creates a cache rooted at `dir`. The directory is created on first use.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `url` is cached: `<sha256(url)>.<ext>`.
    #[must_use]
    pub fn path_for(&self, url: &str) -> PathBuf {
        let mut name = sha256_hex(url);
        if let Some(ext) = extension_of(url) {
            name.push('.');
            name.push_str(&ext);
        }
        self.dir.join(name)
    }

    /// Returns a verified local copy of `url`.
    ///
    /// Local sources are verified in place and never copied. A cached copy
    /// is verified and reused unless `overwrite` is set; an overwritten or
    /// mismatching copy is deleted and downloaded again.
    pub async fn fetch(
        &self,
        url: &str,
        checksum: &Checksum,
        overwrite: bool,
        downloader: &dyn Downloader,
    ) -> BuildResult<PathBuf> {
        if let Some(path) = local_source(url) {
            if !path.exists() {
                return Err(BuildError::Download {
                    url: url.to_string(),
                    reason: "file does not exist".into(),
                });
            }
            verify(checksum, &path).await?;
            return Ok(path);
        }

        let target = self.path_for(url);
        if target.exists() {
            if overwrite {
                info!(path = %target.display(), "removing cached copy before download");
                tokio::fs::remove_file(&target).await?;
            } else {
                match verify(checksum, &target).await {
                    Ok(()) => {
                        debug!(url, path = %target.display(), "using cached download");
                        return Ok(target);
                    }
                    Err(BuildError::Checksum { actual, .. }) => {
                        warn!(path = %target.display(), actual, "cached copy fails verification");
                        tokio::fs::remove_file(&target).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let partial = target.with_extension("part");
        info!(url, "downloading");
        if let Err(e) = downloader.download(url, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        if let Err(e) = verify(checksum, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &target).await?;
        Ok(target)
    }
}

async fn verify(checksum: &Checksum, path: &Path) -> BuildResult<()> {
    if matches!(checksum, Checksum::None) {
        return Ok(());
    }
    let checksum = checksum.clone();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || checksum.verify(&path))
        .await
        .map_err(|e| BuildError::Io(std::io::Error::other(e.to_string())))?
}

fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 8).then(|| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingDownloader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Downloader for CountingDownloader {
        async fn download(&self, _url: &str, dest: &Path) -> BuildResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, b"hello").await?;
            Ok(5)
        }
    }

    const URL: &str = "https://mirror.example.com/ubuntu.iso?mirror=1";

    #[test]
    fn test_cache_name_is_url_hash_with_extension() {
        let cache = LocalCache::new("/cache");
        let path = cache.path_for(URL);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("{}.iso", sha256_hex(URL)));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let downloader = CountingDownloader::default();

        let first = cache.fetch(URL, &Checksum::None, false, &downloader).await.unwrap();
        let second = cache.fetch(URL, &Checksum::None, false, &downloader).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overwrite_downloads_again() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let downloader = CountingDownloader::default();

        cache.fetch(URL, &Checksum::None, false, &downloader).await.unwrap();
        cache.fetch(URL, &Checksum::None, true, &downloader).await.unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_nothing_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let downloader = CountingDownloader::default();
        let wrong: Checksum = format!("sha256:{}", "0".repeat(64)).parse().unwrap();

        let err = cache.fetch(URL, &wrong, false, &downloader).await.unwrap_err();
        assert!(matches!(err, BuildError::Checksum { .. }));
        assert!(!cache.path_for(URL).exists());
    }

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn test_corrupted_cached_copy_is_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let downloader = CountingDownloader::default();
        std::fs::write(cache.path_for(URL), b"corrupted").unwrap();
        let checksum: Checksum = format!("sha256:{HELLO_SHA256}").parse().unwrap();

        let path = cache.fetch(URL, &checksum, false, &downloader).await.unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_verified_cached_copy_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let downloader = CountingDownloader::default();
        std::fs::write(cache.path_for(URL), b"hello").unwrap();
        let checksum: Checksum = format!("sha256:{HELLO_SHA256}").parse().unwrap();

        cache.fetch(URL, &checksum, false, &downloader).await.unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_local_source_is_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("local.iso");
        std::fs::write(&iso, b"hello").unwrap();
        let cache = LocalCache::new(dir.path().join("cache"));
        let downloader = CountingDownloader::default();

        let path = cache
            .fetch(iso.to_str().unwrap(), &Checksum::None, false, &downloader)
            .await
            .unwrap();
        assert_eq!(path, iso);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }
}
