//! Builds a VM from a [`BuildConfig`].
//!
//! [`Builder`] validates the configuration, assembles the step list for an
//! ISO install or a clone, runs it and turns the final state into a
//! [`BuildOutcome`].
//!
//! ```rust,ignore
//! use vsbuild::prelude::*;
//!
//! let config = BuildConfig::from_file(Path::new("build.json"))?;
//! let outcome = Builder::new(config, api)
//!     .with_provisioner(Arc::new(ShellProvisioner::new(vec!["apt-get update".into()])))
//!     .with_communicator(ssh)
//!     .run()
//!     .await?;
//! if let Some(artifact) = outcome.artifact() {
//!     println!("built {artifact}");
//! }
//! ```

mod artifact;

use crate::cancellation::CancellationToken;
use crate::config::{BuildConfig, SourceConfig};
use crate::context::{RunContext, StateBag};
use crate::core::{Artifact, RunStatus};
use crate::driver::ManagementApi;
use crate::errors::{BuildError, BuildResult};
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::provision::{Communicator, Provisioner};
use crate::steps::{
    StepAddCdrom, StepAddFloppy, StepBootCommand, StepBootOrder, StepCloneVm,
    StepCollectMetadata, StepConfigureHardware, StepConnect, StepConvertToTemplate,
    StepCreateSnapshot, StepCreateVm, StepDownload, StepImportToContentLibrary,
    StepPowerOn, StepProvision, StepRemoteUpload, StepRemoveMedia, StepResolvePlacement,
    StepShutdown, StepWaitForIp,
};
use crate::upload::{DefaultDownloader, Downloader};
use artifact::assemble_artifact;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// How a build ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// Every step completed.
    Completed(Artifact),
    /// The build was cancelled. Cleanup has already run.
    Cancelled,
}

impl BuildOutcome {
    /// The artifact of a completed build.
    #[must_use]
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Completed(artifact) => Some(artifact),
            Self::Cancelled => None,
        }
    }

    /// True if the build was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Runs one build against a management API.
pub struct Builder {
    config: BuildConfig,
    api: Arc<dyn ManagementApi>,
    downloader: Arc<dyn Downloader>,
    provisioners: Vec<Arc<dyn Provisioner>>,
    communicator: Option<Arc<dyn Communicator>>,
    events: Arc<dyn EventSink>,
    token: Arc<CancellationToken>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("vm_name", &self.config.vm_name)
            .field("clone", &self.config.is_clone())
            .field("provisioners", &self.provisioners.len())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Creates a builder with the default downloader, no provisioners and
    /// a no-op event sink.
    #[must_use]
    pub fn new(config: BuildConfig, api: Arc<dyn ManagementApi>) -> Self {
        Self {
            config,
            api,
            downloader: Arc::new(DefaultDownloader::new()),
            provisioners: Vec::new(),
            communicator: None,
            events: Arc::new(NoOpEventSink),
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// Replaces the ISO downloader.
    #[must_use]
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = downloader;
        self
    }

    /// Appends a provisioner. Provisioners run in the order added.
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioners.push(provisioner);
        self
    }

    /// Sets the guest command channel.
    #[must_use]
    pub fn with_communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = Some(communicator);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The token that cancels this build.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Assembles the steps for the configured source.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Pipeline`] if the step list is invalid.
    pub fn pipeline(&self) -> BuildResult<Pipeline> {
        let config = &self.config;
        let vm_name = config.vm_name.as_str();
        let kind = if config.is_clone() { "clone" } else { "iso" };

        let builder = PipelineBuilder::new(kind)
            .step(StepConnect::new(Arc::clone(&self.api), config.connection.clone()))
            .step(StepResolvePlacement::new(
                vm_name,
                config.location.clone(),
                config.datastore_target(),
            ))
            .step(StepDownload::new(config.iso.clone(), Arc::clone(&self.downloader)))
            .step(
                StepRemoteUpload::new(config.iso.clone())
                    .with_cd_image(config.cdrom.cd_image.clone())
                    .with_floppy_image(config.floppy.floppy_image.clone()),
            );

        let builder = match &config.source {
            SourceConfig::Iso(create) => builder.step(StepCreateVm::new(
                vm_name,
                create.clone(),
                config.hardware.clone(),
                config.keep_on_error,
            )),
            SourceConfig::Clone(clone) => {
                builder.step(StepCloneVm::new(vm_name, clone.clone(), config.keep_on_error))
            }
        };

        let has_floppy =
            config.floppy.floppy_img_path.is_some() || config.floppy.floppy_image.is_some();
        let builder = builder
            .step(StepConfigureHardware::new(config.hardware.clone(), config.is_clone()))
            .step(StepAddCdrom::new(config.cdrom.cdrom_type.clone()))
            .step(StepAddFloppy::new(config.floppy.floppy_img_path.clone()))
            .step(StepBootOrder::new(config.boot.boot_order.clone()))
            .step(StepPowerOn::new())
            .step(StepBootCommand::new(vm_name, config.boot.clone()))
            .step(StepWaitForIp::new(config.wait_ip.clone()))
            .step(StepProvision::new(
                vm_name,
                self.provisioners.clone(),
                self.communicator.clone(),
            ))
            .step(StepShutdown::new(config.shutdown.clone(), self.communicator.clone()))
            .step(StepRemoveMedia::new(config.cdrom.remove_cdrom, has_floppy))
            .step(StepCreateSnapshot::new(config.create_snapshot, config.snapshot_name.clone()))
            .step(StepConvertToTemplate::new(config.convert_to_template))
            .step(StepCollectMetadata::new());

        let builder = match &config.content_library {
            Some(library) => builder.step(StepImportToContentLibrary::new(vm_name, library.clone())),
            None => builder,
        };

        Ok(builder.build()?)
    }

    /// Validates the configuration, runs the build and assembles the
    /// artifact.
    ///
    /// Cleanup has run by the time this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] for an invalid configuration without
    /// contacting the management API. A failed build returns the first
    /// error recorded by a step.
    pub async fn run(&self) -> BuildResult<BuildOutcome> {
        self.config.validate()?;
        let pipeline = self.pipeline()?;

        let ctx = RunContext::new(&self.config.vm_name)
            .with_token(Arc::clone(&self.token))
            .with_event_sink(Arc::clone(&self.events));
        let mut state = StateBag::new();
        info!(vm = %self.config.vm_name, pipeline = pipeline.name(), "build started");

        let summary = pipeline.run(&ctx, &mut state).await;
        for failure in &summary.cleanup_failures {
            warn!(step = %failure.step, error = %failure.error, "resource may need manual cleanup");
        }

        match summary.status {
            RunStatus::Completed => {
                let artifact = assemble_artifact(&self.config, &state)?;
                info!(artifact = %artifact, elapsed = ?summary.elapsed, "build completed");
                Ok(BuildOutcome::Completed(artifact))
            }
            RunStatus::Cancelled => {
                let reason = self.token.reason();
                info!(
                    vm = %self.config.vm_name,
                    reason = reason.as_deref().unwrap_or("unspecified"),
                    "build cancelled"
                );
                Ok(BuildOutcome::Cancelled)
            }
            RunStatus::Halted => Err(state.take_error().unwrap_or_else(|| {
                let step = summary.steps_run.last().cloned().unwrap_or_default();
                BuildError::Validation("halted without reporting an error".into()).in_step(step)
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContentLibraryConfig;
    use crate::core::BUILDER_ID;
    use crate::driver::{Operation, PublishEvent};
    use crate::events::{CollectingEventSink, STEP_CLEANUP_FAILED};
    use crate::provision::ShellProvisioner;
    use crate::testing::{clone_config, iso_config, RecordingCommunicator, SimulatedApi};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn builder(sim: &SimulatedApi, config: BuildConfig) -> Builder {
        Builder::new(config, Arc::new(sim.clone()))
    }

    #[test]
    fn test_iso_pipeline_steps() {
        let sim = SimulatedApi::new();
        let pipeline = builder(&sim, iso_config("ubuntu")).pipeline().unwrap();

        assert_eq!(pipeline.name(), "iso");
        assert_eq!(
            pipeline.step_names(),
            vec![
                "connect",
                "resolve_placement",
                "download",
                "remote_upload",
                "create_vm",
                "configure_hardware",
                "add_cdrom",
                "add_floppy",
                "boot_order",
                "power_on",
                "boot_command",
                "wait_ip",
                "provision",
                "shutdown",
                "remove_media",
                "create_snapshot",
                "convert_to_template",
                "collect_metadata",
            ]
        );
    }

    #[test]
    fn test_clone_pipeline_with_library() {
        let sim = SimulatedApi::new();
        let config = clone_config("ubuntu", "base").with_content_library(ContentLibraryConfig {
            library: "golden".into(),
            ..ContentLibraryConfig::default()
        });
        let pipeline = builder(&sim, config).pipeline().unwrap();

        assert_eq!(pipeline.name(), "clone");
        assert!(pipeline.step_names().contains(&"clone_vm"));
        assert_eq!(pipeline.step_names().last(), Some(&"import_to_content_library"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_iso_build_completes() {
        let sim = SimulatedApi::new();
        let config = iso_config("ubuntu").with_label("team", "platform");

        let outcome = builder(&sim, config).run().await.unwrap();

        let artifact = outcome.artifact().unwrap();
        assert_eq!(artifact.name(), "ubuntu");
        assert_eq!(artifact.builder_id(), BUILDER_ID);
        assert_eq!(artifact.location().datastore.as_deref(), Some("datastore1"));
        assert_eq!(artifact.labels()["team"], "platform");
        assert_eq!(artifact.labels()["datastore"], "datastore1");
        assert!(artifact.labels().contains_key("vm_uuid"));
        assert!(!artifact.is_template());
        assert!(sim.vm_exists("ubuntu"));
        assert_eq!(sim.logout_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_to_template_with_provisioning() {
        let sim = SimulatedApi::new();
        sim.add_vm("base", true);
        let comm = Arc::new(RecordingCommunicator::new());
        let mut config = clone_config("ubuntu", "base")
            .with_convert_to_template(true)
            .with_snapshot("base-line");
        config.wait_ip.disable = false;
        config.wait_ip.ip_settle_timeout = Duration::ZERO;
        let sim_for_power = sim.clone();
        let setter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            sim_for_power.set_guest_ip("ubuntu", Some("10.0.0.5"));
        });

        let outcome = builder(&sim, config)
            .with_provisioner(Arc::new(ShellProvisioner::new(vec!["apt-get update".into()])))
            .with_communicator(comm.clone())
            .run()
            .await
            .unwrap();
        setter.await.unwrap();

        let artifact = outcome.artifact().unwrap();
        assert!(artifact.is_template());
        assert_eq!(artifact.labels()["template"], "true");
        assert_eq!(comm.commands(), vec![("10.0.0.5".to_string(), "apt-get update".to_string())]);
        assert!(sim
            .submitted()
            .iter()
            .any(|op| matches!(op, Operation::CreateSnapshot { name, .. } if name == "base-line")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_library_destination_in_artifact() {
        let sim = SimulatedApi::new();
        sim.add_library("golden", &["ds-b"]);
        sim.publish_events(vec![PublishEvent::Completed]);
        let config = iso_config("ubuntu").with_content_library(ContentLibraryConfig {
            library: "golden".into(),
            name: Some("ubuntu-2404".into()),
            ..ContentLibraryConfig::default()
        });

        let outcome = builder(&sim, config).run().await.unwrap();

        let artifact = outcome.artifact().unwrap();
        assert_eq!(
            artifact.labels()["content_library_destination"],
            "golden/ubuntu-2404"
        );
        assert_eq!(artifact.content_library().unwrap().library, "golden");
        assert_eq!(sim.library_items().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_after_import_leaves_nothing_to_clean() {
        let sim = SimulatedApi::new();
        sim.add_library("golden", &["ds-b"]);
        let events = Arc::new(CollectingEventSink::new());
        let mut config = iso_config("ubuntu").with_content_library(ContentLibraryConfig {
            library: "golden".into(),
            destroy: true,
            ..ContentLibraryConfig::default()
        });
        config.boot.boot_order = Some("disk,cdrom".into());

        let outcome = builder(&sim, config)
            .with_event_sink(events.clone())
            .run()
            .await
            .unwrap();

        assert!(outcome.artifact().is_some());
        assert!(!sim.vm_exists("ubuntu"));
        assert_eq!(sim.library_items().len(), 1);
        assert!(events.events_of_type(STEP_CLEANUP_FAILED).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_connecting() {
        let sim = SimulatedApi::new();
        let config = BuildConfig::new("ubuntu");

        let err = builder(&sim, config).run().await.unwrap_err();

        assert!(matches!(err, BuildError::Config(_)));
        assert!(sim.submitted().is_empty());
        assert_eq!(sim.logout_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_build_returns_first_error_and_cleans_up() {
        let sim = SimulatedApi::new();
        let events = Arc::new(CollectingEventSink::new());

        let err = builder(&sim, clone_config("ubuntu", "missing-template"))
            .with_event_sink(events.clone())
            .run()
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("step 'clone_vm' failed"), "{err}");
        assert!(!sim.vm_exists("ubuntu"));
        assert_eq!(sim.logout_calls(), 1);
        assert_eq!(events.events_of_type("step.halted").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_destroys_vm() {
        let sim = SimulatedApi::new();
        sim.ignore_guest_shutdown();

        let err = builder(&sim, iso_config("ubuntu")).run().await.unwrap_err();

        assert!(err.root().is_timeout(), "{err}");
        assert!(!sim.vm_exists("ubuntu"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_on_error_leaves_vm() {
        let sim = SimulatedApi::new();
        sim.ignore_guest_shutdown();
        let config = iso_config("ubuntu").with_keep_on_error(true);

        builder(&sim, config).run().await.unwrap_err();

        assert!(sim.vm_exists("ubuntu"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let sim = SimulatedApi::new();
        let builder = builder(&sim, iso_config("ubuntu"));
        builder.token().cancel("operator abort");

        let outcome = builder.run().await.unwrap();

        assert!(outcome.is_cancelled());
        assert!(outcome.artifact().is_none());
        assert!(sim.submitted().is_empty());
        assert_eq!(builder.token().reason().as_deref(), Some("operator abort"));
    }
}
