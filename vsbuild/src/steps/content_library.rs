//! Capture into a content library.

use super::{halt, try_step, Step};
use crate::config::ContentLibraryConfig;
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::driver::{CatalogClient, ImportSpec, ManagedObjectRef};
use crate::errors::BuildResult;
use async_trait::async_trait;
use tracing::{info, warn};

/// Captures the VM into a content library.
///
/// Publishes `content_library_item_uuid` as soon as the import succeeds and
/// `content_library_datastore`. Optionally publishes the item to subscribers
/// and destroys the source VM. The catalog session is always closed; a
/// failed logout is only logged.
///
/// If the run halts or is cancelled after the import, cleanup deletes the
/// item again.
#[derive(Debug)]
pub struct StepImportToContentLibrary {
    vm_name: String,
    library: ContentLibraryConfig,
}

struct Imported {
    item_id: String,
    datastore: String,
}

impl StepImportToContentLibrary {
    /// Creates the step.
    #[must_use]
    pub fn new(vm_name: impl Into<String>, library: ContentLibraryConfig) -> Self {
        Self {
            vm_name: vm_name.into(),
            library,
        }
    }

    /// Name of the library item.
    #[must_use]
    pub fn item_name(&self) -> &str {
        self.library.name.as_deref().unwrap_or(&self.vm_name)
    }

    async fn target_datastore(
        &self,
        state: &StateBag,
        library_datastores: &[String],
    ) -> BuildResult<Option<(String, ManagedObjectRef)>> {
        let driver = state.require_driver()?;
        let named = self
            .library
            .datastore
            .as_ref()
            .or_else(|| library_datastores.first());
        if let Some(name) = named {
            let datastore = driver.find_datastore(name).await?;
            return Ok(Some((name.clone(), datastore.reference().clone())));
        }
        Ok(state.placement().map(|p| {
            (
                p.datastore.name().to_string(),
                p.datastore.reference().clone(),
            )
        }))
    }

    async fn import(&self, state: &StateBag, client: &CatalogClient) -> BuildResult<Imported> {
        let vm = state.require_vm()?;
        let library = client.find_library(&self.library.library).await?;
        let (datastore_name, datastore) = self
            .target_datastore(state, &library.datastores)
            .await?
            .unzip();
        let compute = state.compute();

        let spec = ImportSpec {
            name: self.item_name().to_string(),
            description: self.library.description.clone(),
            ovf: self.library.ovf,
            datastore,
            folder: compute.map(|c| c.folder.reference().clone()),
            resource_pool: compute.map(|c| c.resource_pool.reference().clone()),
            host: compute.and_then(|c| c.host.as_ref().map(|h| h.reference().clone())),
        };
        let item_id = client.import_vm(vm, &library.id, spec).await?;

        Ok(Imported {
            item_id,
            datastore: datastore_name.unwrap_or_default(),
        })
    }

    /// Publishes and destroys as configured. Returns false if the publish
    /// watch was cancelled.
    async fn finish(
        &self,
        ctx: &RunContext,
        state: &mut StateBag,
        client: &CatalogClient,
        item_id: &str,
    ) -> BuildResult<bool> {
        if self.library.publish
            && !client
                .publish(item_id, self.library.publish_timeout, ctx.publish_watch())
                .await?
        {
            return Ok(false);
        }

        if self.library.destroy {
            let vm = state.require_vm()?.clone();
            info!(vm = %vm.reference(), "destroying VM after import");
            vm.power_off().await?;
            vm.destroy().await?;
            state.set_vm_destroyed();
        }
        Ok(true)
    }
}

#[async_trait]
impl Step for StepImportToContentLibrary {
    fn name(&self) -> &str {
        "import_to_content_library"
    }

    async fn run(&self, ctx: &RunContext, state: &mut StateBag) -> StepAction {
        if self.library.skip_import {
            warn!(library = %self.library.library, "content library import skipped");
            return StepAction::Continue;
        }
        let driver = try_step!(state, self.name(), state.require_driver()).clone();
        let client = try_step!(state, self.name(), driver.catalog_login().await);

        let imported = match self.import(state, &client).await {
            Ok(imported) => imported,
            Err(e) => {
                client.close().await;
                return halt(state, self.name(), e);
            }
        };
        state.set_content_library_item_uuid(imported.item_id.clone());
        state.set_content_library_datastore(imported.datastore);

        let finished = self.finish(ctx, state, &client, &imported.item_id).await;
        client.close().await;

        if try_step!(state, self.name(), finished) {
            StepAction::Continue
        } else {
            StepAction::Halt
        }
    }

    async fn cleanup(&self, _ctx: &RunContext, state: &mut StateBag) -> BuildResult<()> {
        if !state.should_teardown() {
            return Ok(());
        }
        let Some(item_id) = state.content_library_item_uuid() else {
            return Ok(());
        };
        let driver = state.require_driver()?;
        warn!(item = %item_id, "deleting library item of unfinished build");
        let client = driver.catalog_login().await?;
        let result = client.delete_item(item_id).await;
        client.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunStatus;
    use crate::driver::{Operation, PublishEvent};
    use crate::pipeline::PipelineBuilder;
    use crate::steps::StepConnect;
    use crate::testing::{iso_config, SimulatedApi};
    use std::sync::Arc;
    use std::time::Duration;

    async fn vm_state(sim: &SimulatedApi) -> StateBag {
        let vm_ref = sim.add_vm("ubuntu", false);
        let driver = sim.connect().await;
        let mut state = StateBag::new();
        state.set_vm(driver.vm(vm_ref));
        state.set_driver(driver);
        state
    }

    fn library() -> ContentLibraryConfig {
        ContentLibraryConfig {
            library: "golden".into(),
            ..ContentLibraryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_import_uses_library_datastore() {
        let sim = SimulatedApi::new();
        sim.add_library("golden", &["ds-b"]);
        let mut state = vm_state(&sim).await;

        let action = StepImportToContentLibrary::new("ubuntu", library())
            .run(&RunContext::new("ubuntu"), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert!(state.content_library_item_uuid().is_some());
        assert_eq!(state.content_library_datastore().unwrap(), "ds-b");
        assert_eq!(sim.catalog_logout_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_library_halts_and_logs_out() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;

        let action = StepImportToContentLibrary::new("ubuntu", library())
            .run(&RunContext::new("ubuntu"), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(state.error().unwrap().to_string().contains("golden"));
        assert_eq!(sim.catalog_logout_calls(), 1);
    }

    #[tokio::test]
    async fn test_logout_failure_keeps_import() {
        let sim = SimulatedApi::new();
        sim.add_library("golden", &["ds-b"]);
        sim.fail_catalog_logout();
        let mut state = vm_state(&sim).await;

        let action = StepImportToContentLibrary::new("ubuntu", library())
            .run(&RunContext::new("ubuntu"), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert!(state.error().is_none());
    }

    #[tokio::test]
    async fn test_publish_then_destroy() {
        let sim = SimulatedApi::new();
        sim.add_library("golden", &["ds-b"]);
        sim.publish_events(vec![PublishEvent::Progress { percent: 50 }, PublishEvent::Completed]);
        let mut state = vm_state(&sim).await;
        let config = ContentLibraryConfig {
            publish: true,
            destroy: true,
            publish_timeout: Duration::from_secs(60),
            ..library()
        };

        let action = StepImportToContentLibrary::new("ubuntu", config)
            .run(&RunContext::new("ubuntu"), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert!(!sim.vm_exists("ubuntu"));
        assert!(state.vm_destroyed());
        assert!(sim
            .submitted()
            .iter()
            .any(|op| matches!(op, Operation::PublishLibraryItem { .. })));
    }

    #[tokio::test]
    async fn test_failed_publish_deletes_imported_item() {
        let sim = SimulatedApi::new();
        sim.add_library("golden", &["ds-b"]);
        sim.publish_events(vec![PublishEvent::Failed {
            message: "subscriber offline".into(),
        }]);
        let mut state = vm_state(&sim).await;
        let config = ContentLibraryConfig {
            publish: true,
            destroy: true,
            publish_timeout: Duration::from_secs(60),
            ..library()
        };
        let pipeline = PipelineBuilder::new("capture")
            .step(StepImportToContentLibrary::new("ubuntu", config))
            .build()
            .unwrap();

        let summary = pipeline.run(&RunContext::new("ubuntu"), &mut state).await;

        assert_eq!(summary.status, RunStatus::Halted);
        assert!(summary.cleanup_failures.is_empty(), "{:?}", summary.cleanup_failures);
        assert!(state.error().unwrap().to_string().contains("subscriber offline"));
        assert!(state.content_library_item_uuid().is_some());
        assert!(sim.library_items().is_empty());
        assert!(sim.vm_exists("ubuntu"));
        assert_eq!(sim.catalog_logout_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_publish_deletes_imported_item() {
        let sim = SimulatedApi::new();
        sim.add_library("golden", &["ds-b"]);
        sim.publish_events(vec![PublishEvent::Progress { percent: 10 }]);
        let vm_ref = sim.add_vm("ubuntu", false);
        let mut state = StateBag::new();
        state.set_vm(sim.connect().await.vm(vm_ref));
        let config = ContentLibraryConfig {
            publish: true,
            publish_timeout: Duration::from_secs(600),
            ..library()
        };
        let pipeline = PipelineBuilder::new("capture")
            .step(StepConnect::new(Arc::new(sim.clone()), iso_config("ubuntu").connection))
            .step(StepImportToContentLibrary::new("ubuntu", config))
            .build()
            .unwrap();
        let ctx = RunContext::new("ubuntu");
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel("operator abort");
        });

        let summary = pipeline.run(&ctx, &mut state).await;

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(summary.cleanup_failures.is_empty(), "{:?}", summary.cleanup_failures);
        assert!(state.error().is_none());
        assert!(sim.library_items().is_empty());
        assert_eq!(sim.logout_calls(), 1);
    }

    #[tokio::test]
    async fn test_successful_import_is_kept() {
        let sim = SimulatedApi::new();
        sim.add_library("golden", &["ds-b"]);
        let mut state = vm_state(&sim).await;
        let pipeline = PipelineBuilder::new("capture")
            .step(StepImportToContentLibrary::new("ubuntu", library()))
            .build()
            .unwrap();

        let summary = pipeline.run(&RunContext::new("ubuntu"), &mut state).await;

        assert!(summary.is_success());
        assert_eq!(sim.library_items().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_import() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let config = ContentLibraryConfig {
            skip_import: true,
            ..library()
        };

        let action = StepImportToContentLibrary::new("ubuntu", config)
            .run(&RunContext::new("ubuntu"), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert!(sim.submitted().is_empty());
    }
}
