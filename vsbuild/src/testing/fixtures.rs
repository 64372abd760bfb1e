//! Configurations that validate against the [`super::SimulatedApi`]
//! inventory.

use crate::config::{
    BuildConfig, CloneConfig, ConnectionConfig, CreateConfig, DiskConfig, LocationConfig,
    NicConfig, ShutdownConfig, SourceConfig, WaitIpConfig,
};
use std::time::Duration;

fn connection() -> ConnectionConfig {
    ConnectionConfig {
        vcenter_server: "vcsim.local".into(),
        username: "builder".into(),
        password: "builder".into(),
        datacenter: Some("dc1".into()),
        task_poll_interval: Duration::from_millis(10),
        task_timeout: Duration::from_secs(60),
        ..ConnectionConfig::default()
    }
}

/// An ISO build of `vm_name` on `cluster1` and `datastore1` with one thin
/// disk and one adapter on `VM Network`.
///
/// The IP wait is disabled and shutdown waits at most 10 seconds.
#[must_use]
pub fn iso_config(vm_name: &str) -> BuildConfig {
    BuildConfig::new(vm_name)
        .with_connection(connection())
        .with_location(LocationConfig {
            cluster: Some("cluster1".into()),
            datastore: Some("datastore1".into()),
            ..LocationConfig::default()
        })
        .with_source(SourceConfig::Iso(CreateConfig {
            guest_os_type: "ubuntu64Guest".into(),
            disk_controller_type: vec!["pvscsi".into()],
            storage: vec![DiskConfig {
                disk_size_mb: 16 * 1024,
                ..DiskConfig::default()
            }],
            network_adapters: vec![NicConfig {
                network: "VM Network".into(),
                ..NicConfig::default()
            }],
            ..CreateConfig::default()
        }))
        .with_wait_ip(WaitIpConfig {
            disable: true,
            ..WaitIpConfig::default()
        })
        .with_shutdown(ShutdownConfig {
            shutdown_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            ..ShutdownConfig::default()
        })
}

/// A clone of `template` named `vm_name`, otherwise like [`iso_config`].
#[must_use]
pub fn clone_config(vm_name: &str, template: &str) -> BuildConfig {
    iso_config(vm_name).with_source(SourceConfig::Clone(CloneConfig {
        template: template.into(),
        ..CloneConfig::default()
    }))
}
