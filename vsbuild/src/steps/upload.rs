//! Media download and datastore upload.

use super::{try_step, Step};
use crate::config::IsoConfig;
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::errors::{BuildError, BuildResult};
use crate::upload::{remove_uploaded, Checksum, Downloader, LocalCache, RemoteCache};
use crate::utils::DatastorePath;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Fetches `iso_urls` into the local cache, publishing `iso_path`.
#[derive(Debug)]
pub struct StepDownload {
    iso: IsoConfig,
    downloader: Arc<dyn Downloader>,
}

impl StepDownload {
    /// Creates the step.
    #[must_use]
    pub fn new(iso: IsoConfig, downloader: Arc<dyn Downloader>) -> Self {
        Self { iso, downloader }
    }
}

#[async_trait]
impl Step for StepDownload {
    fn name(&self) -> &str {
        "download"
    }

    async fn run(&self, ctx: &RunContext, state: &mut StateBag) -> StepAction {
        let checksum: Checksum = try_step!(state, self.name(), self.iso.iso_checksum.parse());
        let cache = LocalCache::new(&self.iso.cache_dir);

        for url in &self.iso.iso_urls {
            if ctx.is_cancelled() {
                return StepAction::Halt;
            }
            let path = try_step!(
                state,
                self.name(),
                cache
                    .fetch(url, &checksum, self.iso.local_cache_overwrite, self.downloader.as_ref())
                    .await
            );
            state.push_iso_path(path);
        }
        StepAction::Continue
    }
}

/// Places media on a datastore.
///
/// Uploads every local ISO, the generated CD image and the floppy image
/// through the remote cache, and publishes `iso_remote_path`, `cd_path`,
/// `uploaded_floppy_path` and the `uploaded` records. Configured datastore
/// ISO paths are published as they are.
///
/// Files uploaded by this run are deleted on cleanup when the run halted or
/// was cancelled, and after a successful run when `remote_cache_cleanup` is
/// set. Files that were already on the datastore are never deleted.
#[derive(Debug)]
pub struct StepRemoteUpload {
    iso: IsoConfig,
    cd_image: Option<PathBuf>,
    floppy_image: Option<PathBuf>,
}

impl StepRemoteUpload {
    /// Creates the step.
    #[must_use]
    pub fn new(iso: IsoConfig) -> Self {
        Self {
            iso,
            cd_image: None,
            floppy_image: None,
        }
    }

    /// Uploads a locally generated CD image.
    #[must_use]
    pub fn with_cd_image(mut self, path: Option<PathBuf>) -> Self {
        self.cd_image = path;
        self
    }

    /// Uploads a local floppy image.
    #[must_use]
    pub fn with_floppy_image(mut self, path: Option<PathBuf>) -> Self {
        self.floppy_image = path;
        self
    }

    async fn upload_all(&self, state: &mut StateBag) -> BuildResult<()> {
        for path in &self.iso.iso_paths {
            let remote: DatastorePath = path.parse().map_err(BuildError::Validation)?;
            state.push_iso_remote_path(remote);
        }

        let needs_upload = !state.iso_paths().is_empty()
            || self.cd_image.is_some()
            || self.floppy_image.is_some();
        if !needs_upload {
            return Ok(());
        }

        let driver = state.require_driver()?.clone();
        let datastore = match &self.iso.remote_cache_datastore {
            Some(name) => driver.find_datastore(name).await?,
            None => state.require_placement()?.datastore.clone(),
        };
        let host = state.compute().and_then(|c| c.host.clone());
        let cache = RemoteCache::new(&datastore, &self.iso.remote_cache_path)
            .with_overwrite(self.iso.remote_cache_overwrite)
            .with_host(host.as_ref());

        let local_isos = state.iso_paths().to_vec();
        for local in &local_isos {
            let object = cache.upload(local).await?;
            state.push_iso_remote_path(object.remote.clone());
            state.push_uploaded(object);
        }

        if let Some(image) = &self.cd_image {
            let object = cache.upload(image).await?;
            state.set_cd_path(object.remote.clone());
            state.push_uploaded(object);
        }

        if let Some(image) = &self.floppy_image {
            let object = cache.upload(image).await?;
            state.set_floppy_path(image.clone());
            state.set_uploaded_floppy_path(object.remote.clone());
            state.push_uploaded(object);
        }
        Ok(())
    }
}

#[async_trait]
impl Step for StepRemoteUpload {
    fn name(&self) -> &str {
        "remote_upload"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        try_step!(state, self.name(), self.upload_all(state).await);
        StepAction::Continue
    }

    async fn cleanup(&self, _ctx: &RunContext, state: &mut StateBag) -> BuildResult<()> {
        if !state.should_teardown() && !self.iso.remote_cache_cleanup {
            return Ok(());
        }

        let mut first_error = None;
        for object in state.uploaded() {
            if let Err(e) = remove_uploaded(object).await {
                warn!(remote = %object.remote, error = %e, "failed to delete uploaded file");
                first_error.get_or_insert(e);
            }
        }
        if first_error.is_none() {
            info!(count = state.uploaded().len(), "remote cache cleaned");
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{resolve_datastore, DatastoreTarget, PlacementHints};
    use crate::testing::SimulatedApi;
    use crate::upload::FileDownloader;
    use std::io::Write;

    async fn uploaded_state(sim: &SimulatedApi) -> StateBag {
        let driver = sim.connect().await;
        let placement = resolve_datastore(
            &driver,
            &DatastoreTarget::Direct("datastore1".into()),
            &PlacementHints::default(),
        )
        .await
        .unwrap();
        let mut state = StateBag::new();
        state.set_driver(driver);
        state.set_placement(placement);
        state.push_iso_path(PathBuf::from("/cache/ubuntu.iso"));
        state
    }

    #[tokio::test]
    async fn test_download_publishes_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("seed.iso");
        std::fs::File::create(&source).unwrap().write_all(b"iso").unwrap();

        let iso = IsoConfig {
            iso_urls: vec![source.display().to_string()],
            cache_dir: dir.path().join("cache"),
            ..IsoConfig::default()
        };
        let step = StepDownload::new(iso, Arc::new(FileDownloader));
        let mut state = StateBag::new();

        assert_eq!(step.run(&RunContext::new("t"), &mut state).await, StepAction::Continue);
        assert_eq!(state.iso_paths(), &[source]);
    }

    #[tokio::test]
    async fn test_bad_checksum_halts() {
        let iso = IsoConfig {
            iso_urls: vec!["https://example.com/a.iso".into()],
            iso_checksum: "crc32:abcd".into(),
            ..IsoConfig::default()
        };
        let step = StepDownload::new(iso, Arc::new(FileDownloader));
        let mut state = StateBag::new();

        assert_eq!(step.run(&RunContext::new("t"), &mut state).await, StepAction::Halt);
        assert!(state.error().is_some());
    }

    #[tokio::test]
    async fn test_upload_records_and_skips_existing() {
        let sim = SimulatedApi::new();
        sim.put_file("datastore1", "vsbuild_cache/ubuntu.iso");
        let mut state = uploaded_state(&sim).await;
        let step = StepRemoteUpload::new(IsoConfig::default());

        assert_eq!(step.run(&RunContext::new("t"), &mut state).await, StepAction::Continue);

        assert_eq!(sim.upload_calls(), 0);
        assert_eq!(state.iso_remote_paths()[0].to_string(), "[datastore1] vsbuild_cache/ubuntu.iso");
        assert!(!state.uploaded()[0].uploaded_by_run);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_own_uploads_on_halt() {
        let sim = SimulatedApi::new();
        sim.put_file("datastore1", "vsbuild_cache/existing.iso");
        let mut state = uploaded_state(&sim).await;
        state.push_iso_path(PathBuf::from("/cache/existing.iso"));
        let step = StepRemoteUpload::new(IsoConfig::default());
        let ctx = RunContext::new("t");

        step.run(&ctx, &mut state).await;
        state.mark_halted();
        step.cleanup(&ctx, &mut state).await.unwrap();

        assert_eq!(sim.deleted_files(), vec!["[datastore1] vsbuild_cache/ubuntu.iso".to_string()]);
        assert!(sim.file_exists("datastore1", "vsbuild_cache/existing.iso"));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_uploads_after_success() {
        let sim = SimulatedApi::new();
        let mut state = uploaded_state(&sim).await;
        let step = StepRemoteUpload::new(IsoConfig::default());
        let ctx = RunContext::new("t");

        step.run(&ctx, &mut state).await;
        step.cleanup(&ctx, &mut state).await.unwrap();

        assert!(sim.deleted_files().is_empty());
    }

    #[tokio::test]
    async fn test_configured_datastore_paths_need_no_driver() {
        let iso = IsoConfig {
            iso_paths: vec!["[datastore1] iso/ubuntu.iso".into()],
            ..IsoConfig::default()
        };
        let step = StepRemoteUpload::new(iso);
        let mut state = StateBag::new();

        assert_eq!(step.run(&RunContext::new("t"), &mut state).await, StepAction::Continue);
        assert_eq!(state.iso_remote_paths().len(), 1);
    }
}
