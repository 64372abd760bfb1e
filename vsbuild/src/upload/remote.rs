//! Remote media cache on a datastore.

use crate::driver::{Datastore, Host};
use crate::errors::{BuildError, BuildResult};
use crate::utils::DatastorePath;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A file placed (or found) on a datastore for this build.
#[derive(Debug, Clone)]
pub struct UploadedObject {
    /// Local source file.
    pub local: PathBuf,
    /// Remote location.
    pub remote: DatastorePath,
    /// The datastore holding it.
    pub datastore: Datastore,
    /// False when the file already existed and was reused.
    pub uploaded_by_run: bool,
}

/// Uploads files into a datastore directory, reusing files that are
/// already there unless `overwrite` is set.
#[derive(Debug, Clone)]
pub struct RemoteCache<'a> {
    datastore: &'a Datastore,
    directory: String,
    overwrite: bool,
    host: Option<&'a Host>,
}

impl<'a> RemoteCache<'a> {
    /// Creates a cache in `directory` on `datastore`.
    #[must_use]
    pub fn new(datastore: &'a Datastore, directory: impl Into<String>) -> Self {
        Self {
            datastore,
            directory: directory.into().trim_matches('/').to_string(),
            overwrite: false,
            host: None,
        }
    }

    /// Replaces existing remote files.
    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Routes the upload through a specific host.
    #[must_use]
    pub fn with_host(mut self, host: Option<&'a Host>) -> Self {
        self.host = host;
        self
    }

    /// Remote path a local file maps to.
    pub fn remote_path(&self, local: &Path) -> BuildResult<String> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                BuildError::Validation(format!("'{}' has no file name", local.display()))
            })?;
        Ok(if self.directory.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{file_name}", self.directory)
        })
    }

    /// Makes `local` available on the datastore.
    pub async fn upload(&self, local: &Path) -> BuildResult<UploadedObject> {
        let relative = self.remote_path(local)?;
        let record = |uploaded_by_run| UploadedObject {
            local: local.to_path_buf(),
            remote: self.datastore.path(&relative),
            datastore: self.datastore.clone(),
            uploaded_by_run,
        };

        if self.datastore.file_exists(&relative).await? {
            if !self.overwrite {
                debug!(remote = %self.datastore.path(&relative), "remote cache hit, skipping upload");
                return Ok(record(false));
            }
            info!(remote = %self.datastore.path(&relative), "replacing remote file");
            self.datastore.delete(&relative).await?;
        } else if !self.directory.is_empty() && !self.datastore.file_exists(&self.directory).await? {
            self.datastore.make_directory(&self.directory).await?;
        }

        self.datastore.upload(local, &relative, self.host).await?;
        info!(remote = %self.datastore.path(&relative), "uploaded");
        Ok(record(true))
    }
}

/// Deletes `object` if this run uploaded it. Pre-existing files are kept.
pub async fn remove_uploaded(object: &UploadedObject) -> BuildResult<()> {
    if !object.uploaded_by_run {
        return Ok(());
    }
    object.datastore.delete(&object.remote.path).await?;
    info!(remote = %object.remote, "deleted uploaded file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedApi;

    #[tokio::test]
    async fn test_second_upload_is_skipped() {
        let sim = SimulatedApi::new();
        let driver = sim.connect().await;
        let ds = driver.find_datastore("datastore1").await.unwrap();
        let cache = RemoteCache::new(&ds, "vsbuild_cache");

        let first = cache.upload(Path::new("/tmp/ubuntu.iso")).await.unwrap();
        let second = cache.upload(Path::new("/tmp/ubuntu.iso")).await.unwrap();

        assert_eq!(first.remote, second.remote);
        assert!(first.uploaded_by_run);
        assert!(!second.uploaded_by_run);
        assert_eq!(sim.upload_calls(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_deletes_and_reuploads() {
        let sim = SimulatedApi::new();
        sim.put_file("datastore1", "vsbuild_cache/ubuntu.iso");
        let driver = sim.connect().await;
        let ds = driver.find_datastore("datastore1").await.unwrap();

        let uploaded = RemoteCache::new(&ds, "vsbuild_cache")
            .with_overwrite(true)
            .upload(Path::new("/tmp/ubuntu.iso"))
            .await
            .unwrap();

        assert!(uploaded.uploaded_by_run);
        assert_eq!(sim.upload_calls(), 1);
        assert_eq!(sim.deleted_files(), vec!["[datastore1] vsbuild_cache/ubuntu.iso".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_created() {
        let sim = SimulatedApi::new();
        let driver = sim.connect().await;
        let ds = driver.find_datastore("datastore1").await.unwrap();

        RemoteCache::new(&ds, "fresh/dir")
            .upload(Path::new("/tmp/a.flp"))
            .await
            .unwrap();
        assert!(sim.file_exists("datastore1", "fresh/dir"));
        assert!(sim.file_exists("datastore1", "fresh/dir/a.flp"));
    }

    #[tokio::test]
    async fn test_remove_keeps_preexisting_files() {
        let sim = SimulatedApi::new();
        sim.put_file("datastore1", "cache/a.iso");
        let driver = sim.connect().await;
        let ds = driver.find_datastore("datastore1").await.unwrap();

        let reused = RemoteCache::new(&ds, "cache").upload(Path::new("a.iso")).await.unwrap();
        remove_uploaded(&reused).await.unwrap();

        assert!(sim.file_exists("datastore1", "cache/a.iso"));
    }
}
