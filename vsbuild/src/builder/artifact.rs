//! Turns the final state of a successful run into an [`Artifact`].

use crate::config::BuildConfig;
use crate::context::StateBag;
use crate::core::{Artifact, LibraryDestination, Location};
use crate::errors::BuildResult;
use crate::metadata::LabelWriter;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Assembles the artifact of a completed run.
///
/// Labels are merged in order: metadata collected by the run, the content
/// library destination, then the configured labels. Later entries win.
pub(crate) fn assemble_artifact(config: &BuildConfig, state: &StateBag) -> BuildResult<Artifact> {
    let vm = state.require_vm()?;

    let destination = match (&config.content_library, state.content_library_item_uuid()) {
        (Some(library), Some(item_id)) => Some(LibraryDestination {
            library: library.library.clone(),
            item: library.name.clone().unwrap_or_else(|| config.vm_name.clone()),
            item_id: item_id.clone(),
        }),
        _ => None,
    };

    let mut labels = BTreeMap::new();
    let mut writer = LabelWriter::new(&mut labels);
    writer.extend(state.labels());
    if let Some(destination) = &destination {
        writer.write_content_library(destination);
    }
    writer.extend(&config.labels);

    let location = Location {
        datacenter: config.connection.datacenter.clone(),
        folder: config.location.folder.clone(),
        cluster: config.location.cluster.clone(),
        host: config.location.host.clone(),
        resource_pool: config.location.resource_pool.clone(),
        datastore: state
            .placement()
            .map(|p| p.datastore.name().to_string())
            .or_else(|| labels.get("datastore").cloned()),
    };

    let mut files = state.generated_files().to_vec();
    if let Some(dir) = &config.output_directory {
        files.extend(list_output_directory(dir));
    }

    let mut artifact = Artifact::new(&config.vm_name, vm.reference().clone(), location)
        .with_template(state.template())
        .with_labels(labels)
        .with_files(files);
    if let Some(destination) = destination {
        artifact = artifact.with_content_library(destination);
    }
    Ok(artifact)
}

fn list_output_directory(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "cannot list output directory"),
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContentLibraryConfig;
    use crate::testing::{iso_config, SimulatedApi};
    use pretty_assertions::assert_eq;

    async fn vm_state(sim: &SimulatedApi) -> StateBag {
        let vm_ref = sim.add_vm("ubuntu", false);
        let driver = sim.connect().await;
        let mut state = StateBag::new();
        state.set_vm(driver.vm(vm_ref));
        state
    }

    #[tokio::test]
    async fn test_label_precedence() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        state.labels_mut().insert("num_cpu".into(), "1".into());
        state.labels_mut().insert("owner".into(), "collected".into());
        state.set_content_library_item_uuid("item-1".into());
        let config = iso_config("ubuntu")
            .with_label("owner", "platform")
            .with_content_library(ContentLibraryConfig {
                library: "golden".into(),
                ..ContentLibraryConfig::default()
            });

        let artifact = assemble_artifact(&config, &state).unwrap();

        assert_eq!(artifact.labels()["owner"], "platform");
        assert_eq!(artifact.labels()["num_cpu"], "1");
        assert_eq!(artifact.labels()["content_library_destination"], "golden/ubuntu");
        assert_eq!(artifact.content_library().unwrap().item_id, "item-1");
    }

    #[tokio::test]
    async fn test_lists_output_directory() {
        let sim = SimulatedApi::new();
        let state = vm_state(&sim).await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.log"), "b").unwrap();
        std::fs::write(dir.path().join("a.ovf"), "a").unwrap();
        std::fs::create_dir_all(dir.path().join("disks/empty")).unwrap();
        std::fs::write(dir.path().join("disks/ubuntu-disk-0.vmdk"), "d").unwrap();
        let config = iso_config("ubuntu").with_output_directory(dir.path());

        let artifact = assemble_artifact(&config, &state).unwrap();

        assert_eq!(
            artifact.files(),
            &[
                dir.path().join("a.ovf"),
                dir.path().join("b.log"),
                dir.path().join("disks/ubuntu-disk-0.vmdk"),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_output_directory_is_skipped() {
        let sim = SimulatedApi::new();
        let state = vm_state(&sim).await;
        let config = iso_config("ubuntu").with_output_directory("/nonexistent/vsbuild-output");

        let artifact = assemble_artifact(&config, &state).unwrap();

        assert!(artifact.files().is_empty());
        assert_eq!(artifact.location().datacenter.as_deref(), Some("dc1"));
    }

    #[test]
    fn test_requires_vm() {
        let err = assemble_artifact(&iso_config("ubuntu"), &StateBag::new()).unwrap_err();
        assert!(err.to_string().contains("'vm'"));
    }
}
