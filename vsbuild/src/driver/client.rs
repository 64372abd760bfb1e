//! The connected driver and its submit-then-await protocol.

use super::api::{
    Credentials, ManagedObjectRef, ManagementApi, ObjectKind, Operation, PlacementRequest,
    PropertyMap, SessionId, TaskState,
};
use super::inventory::{Cluster, Datastore, Folder, Host, Network, ResourcePool, StoragePod};
use super::spec::CreateSpec;
use super::vm::VirtualMachine;
use crate::cancellation::{poll_until, CancellationToken, WaitOutcome};
use crate::errors::{BuildError, BuildResult, RemoteError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for remote task waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// How often a submitted task is polled.
    pub task_poll_interval: Duration,
    /// Upper bound for a single remote task.
    pub task_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            task_poll_interval: Duration::from_millis(500),
            task_timeout: Duration::from_secs(3600),
        }
    }
}

struct DriverInner {
    api: Arc<dyn ManagementApi>,
    session: SessionId,
    credentials: Credentials,
    datacenter: Option<ManagedObjectRef>,
    settings: DriverSettings,
    token: Arc<CancellationToken>,
    teardown_token: CancellationToken,
    tearing_down: AtomicBool,
}

/// A logged-in handle to the management plane.
///
/// Cheap to clone; every clone shares the session and the run's cancellation
/// token. Mutations go through [`Driver::execute`], which submits the
/// operation and waits for its task.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("server", &self.inner.credentials.server)
            .field("datacenter", &self.inner.datacenter)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Logs in and resolves the datacenter, if one is named.
    pub async fn connect(
        api: Arc<dyn ManagementApi>,
        credentials: Credentials,
        datacenter: Option<&str>,
        settings: DriverSettings,
        token: Arc<CancellationToken>,
    ) -> BuildResult<Self> {
        let session = api.login(&credentials).await?;
        info!(server = %credentials.server, user = %credentials.username, "connected to management API");

        let datacenter = match datacenter.filter(|dc| !dc.is_empty()) {
            Some(name) => {
                let lookup = match api.find(ObjectKind::Datacenter, name).await {
                    Ok(found) => single(found, ObjectKind::Datacenter, name),
                    Err(e) => Err(e.into()),
                };
                match lookup {
                    Ok(reference) => Some(reference),
                    Err(e) => {
                        if let Err(logout) = api.logout(&session).await {
                            warn!(error = %logout, "logout after failed datacenter lookup failed");
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        Ok(Self {
            inner: Arc::new(DriverInner {
                api,
                session,
                credentials,
                datacenter,
                settings,
                token,
                teardown_token: CancellationToken::new(),
                tearing_down: AtomicBool::new(false),
            }),
        })
    }

    /// Closes the main session.
    pub async fn logout(&self) -> BuildResult<()> {
        self.inner.api.logout(&self.inner.session).await?;
        debug!("management API session closed");
        Ok(())
    }

    /// The underlying API.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn ManagementApi> {
        &self.inner.api
    }

    /// Login material, reused by the catalog sub-protocol.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    /// The resolved datacenter.
    #[must_use]
    pub fn datacenter(&self) -> Option<&ManagedObjectRef> {
        self.inner.datacenter.as_ref()
    }

    /// Task wait tunables.
    #[must_use]
    pub fn settings(&self) -> DriverSettings {
        self.inner.settings
    }

    /// The token task waits observe.
    ///
    /// This is the run's token until [`Driver::begin_teardown`], after which
    /// waits are no longer cut short by the run's cancellation.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        if self.inner.tearing_down.load(Ordering::Acquire) {
            &self.inner.teardown_token
        } else {
            &self.inner.token
        }
    }

    /// Switches every clone of this driver to teardown mode.
    ///
    /// Cleanup runs after a cancelled run still has to power off and destroy
    /// what the run created.
    pub fn begin_teardown(&self) {
        if !self.inner.tearing_down.swap(true, Ordering::AcqRel) {
            debug!("driver entering teardown");
        }
    }

    /// Submits `operation` and waits for its task to finish.
    ///
    /// A task that ends in error becomes [`BuildError::Remote`] carrying the
    /// remote message. Cancellation while waiting yields
    /// [`BuildError::Cancelled`].
    pub async fn execute(&self, operation: Operation) -> BuildResult<Option<serde_json::Value>> {
        let name = operation.name();
        let api = &self.inner.api;
        let task = api.submit(operation).await?;
        debug!(operation = name, task = %task.id, "task submitted");

        let settings = self.inner.settings;
        let task_ref = &task;
        let outcome = poll_until(
            self.token(),
            settings.task_timeout,
            settings.task_poll_interval,
            move || async move {
                let info = api.task_info(task_ref).await.map_err(BuildError::from)?;
                let state: BuildResult<Option<Option<serde_json::Value>>> = match info.state {
                    TaskState::Success => Ok(Some(info.result)),
                    TaskState::Error => Err(RemoteError::task_failed(
                        info.error
                            .unwrap_or_else(|| format!("{name} failed without a message")),
                    )
                    .into()),
                    TaskState::Queued | TaskState::Running => Ok(None),
                };
                state
            },
        )
        .await?;

        match outcome {
            WaitOutcome::Ready(result) => {
                debug!(operation = name, task = %task.id, "task completed");
                Ok(result)
            }
            WaitOutcome::TimedOut => Err(BuildError::timeout(
                format!("task {name}"),
                settings.task_timeout,
            )),
            WaitOutcome::Cancelled => Err(BuildError::Cancelled {
                operation: name.to_string(),
            }),
        }
    }

    /// Reads properties of `object`. An empty `paths` slice fetches all.
    pub async fn properties(
        &self,
        object: &ManagedObjectRef,
        paths: &[&str],
    ) -> BuildResult<PropertyMap> {
        let paths: Vec<String> = paths.iter().map(|p| (*p).to_string()).collect();
        Ok(self.inner.api.retrieve_properties(object, &paths).await?)
    }

    /// Reads and decodes a single property. Absent properties decode as null.
    pub async fn property<T: DeserializeOwned>(
        &self,
        object: &ManagedObjectRef,
        path: &str,
    ) -> BuildResult<T> {
        let mut props = self.properties(object, &[path]).await?;
        let value = props.remove(path).unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| {
            BuildError::Serialization(format!("property '{path}' of {object}: {e}"))
        })
    }

    /// Reads the `name` property of `object`.
    pub async fn object_name(&self, object: &ManagedObjectRef) -> BuildResult<String> {
        self.property(object, "name").await
    }

    /// Finds every object of `kind` matching `name`.
    pub async fn find_all(&self, kind: ObjectKind, name: &str) -> BuildResult<Vec<ManagedObjectRef>> {
        Ok(self.inner.api.find(kind, name).await?)
    }

    /// Finds exactly one object of `kind` named `name`.
    pub async fn find_one(&self, kind: ObjectKind, name: &str) -> BuildResult<ManagedObjectRef> {
        single(self.find_all(kind, name).await?, kind, name)
    }

    /// Wraps a VM reference.
    #[must_use]
    pub fn vm(&self, reference: ManagedObjectRef) -> VirtualMachine {
        VirtualMachine::new(self.clone(), reference)
    }

    /// Finds a VM or template by name.
    pub async fn find_vm(&self, name: &str) -> BuildResult<VirtualMachine> {
        let reference = self.find_one(ObjectKind::VirtualMachine, name).await?;
        Ok(self.vm(reference))
    }

    /// Wraps a datastore reference, reading its name.
    pub async fn datastore(&self, reference: ManagedObjectRef) -> BuildResult<Datastore> {
        let name = self.object_name(&reference).await?;
        Ok(Datastore::new(self.clone(), reference, name))
    }

    /// Finds a datastore by name.
    pub async fn find_datastore(&self, name: &str) -> BuildResult<Datastore> {
        let reference = self.find_one(ObjectKind::Datastore, name).await?;
        Ok(Datastore::new(self.clone(), reference, name))
    }

    /// Finds a datastore cluster by name.
    pub async fn find_storage_pod(&self, name: &str) -> BuildResult<StoragePod> {
        let reference = self.find_one(ObjectKind::StoragePod, name).await?;
        Ok(StoragePod::new(self.clone(), reference, name))
    }

    /// Finds a VM folder. An empty path means the datacenter's root VM folder.
    pub async fn find_folder(&self, path: &str) -> BuildResult<Folder> {
        let path = if path.is_empty() { "vm" } else { path };
        let reference = self.find_one(ObjectKind::Folder, path).await?;
        Ok(Folder::new(reference, path))
    }

    /// Finds a host by name.
    pub async fn find_host(&self, name: &str) -> BuildResult<Host> {
        let reference = self.find_one(ObjectKind::Host, name).await?;
        Ok(Host::new(self.clone(), reference, name))
    }

    /// Finds a cluster by name.
    pub async fn find_cluster(&self, name: &str) -> BuildResult<Cluster> {
        let reference = self.find_one(ObjectKind::Cluster, name).await?;
        Ok(Cluster::new(self.clone(), reference, name))
    }

    /// Finds a resource pool by path.
    pub async fn find_resource_pool(&self, path: &str) -> BuildResult<ResourcePool> {
        let reference = self.find_one(ObjectKind::ResourcePool, path).await?;
        Ok(ResourcePool::new(reference, path))
    }

    /// Wraps a resource pool reference, reading its name.
    pub async fn resource_pool(&self, reference: ManagedObjectRef) -> BuildResult<ResourcePool> {
        let name = self.object_name(&reference).await?;
        Ok(ResourcePool::new(reference, name))
    }

    /// Finds every network with `name`.
    pub async fn find_networks(&self, name: &str) -> BuildResult<Vec<Network>> {
        let found = self.find_all(ObjectKind::Network, name).await?;
        Ok(found
            .into_iter()
            .map(|reference| Network::new(self.clone(), reference, name))
            .collect())
    }

    /// Asks the placement service for datastores, best first.
    pub async fn recommend_datastores(
        &self,
        request: &PlacementRequest,
    ) -> BuildResult<Vec<ManagedObjectRef>> {
        Ok(self.inner.api.recommend_datastores(request).await?)
    }

    /// Creates a VM and returns its handle.
    pub async fn create_vm(
        &self,
        folder: &Folder,
        resource_pool: &ResourcePool,
        host: Option<&Host>,
        spec: CreateSpec,
    ) -> BuildResult<VirtualMachine> {
        let name = spec.name.clone();
        let result = self
            .execute(Operation::CreateVm {
                folder: folder.reference().clone(),
                resource_pool: resource_pool.reference().clone(),
                host: host.map(|h| h.reference().clone()),
                spec,
            })
            .await?;
        let reference = created_object(result, "create_vm")?;
        info!(vm = %name, id = %reference.id, "virtual machine created");
        Ok(self.vm(reference))
    }
}

/// Decodes the object reference a create or clone task returns.
pub(crate) fn created_object(
    result: Option<serde_json::Value>,
    operation: &str,
) -> BuildResult<ManagedObjectRef> {
    let value = result.ok_or_else(|| {
        BuildError::Remote(RemoteError::task_failed(format!(
            "{operation} returned no object reference"
        )))
    })?;
    Ok(serde_json::from_value(value)?)
}

fn single(
    mut found: Vec<ManagedObjectRef>,
    kind: ObjectKind,
    name: &str,
) -> BuildResult<ManagedObjectRef> {
    match found.len() {
        0 => Err(BuildError::not_found(kind.to_string(), name)),
        1 => Ok(found.remove(0)),
        n => Err(BuildError::ambiguous(kind.to_string(), name, n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::api::{MockManagementApi, TaskInfo, TaskRef};
    use mockall::predicate::eq;

    fn mock_with_session() -> MockManagementApi {
        let mut api = MockManagementApi::new();
        api.expect_login()
            .returning(|_| Ok(SessionId("session-1".into())));
        api
    }

    async fn connect(api: MockManagementApi) -> Driver {
        Driver::connect(
            Arc::new(api),
            Credentials::default(),
            None,
            DriverSettings {
                task_poll_interval: Duration::from_millis(10),
                task_timeout: Duration::from_secs(5),
            },
            Arc::new(CancellationToken::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_find_one_reports_ambiguity() {
        let mut api = mock_with_session();
        api.expect_find()
            .with(eq(ObjectKind::Datastore), eq("ds"))
            .returning(|kind, _| {
                Ok(vec![
                    ManagedObjectRef::new(kind, "datastore-1"),
                    ManagedObjectRef::new(kind, "datastore-2"),
                ])
            });

        let driver = connect(api).await;
        let err = driver.find_one(ObjectKind::Datastore, "ds").await.unwrap_err();
        assert!(matches!(err, BuildError::Ambiguous { count: 2, .. }));
    }

    #[tokio::test]
    async fn test_unknown_datacenter_closes_session() {
        let mut api = mock_with_session();
        api.expect_find().returning(|_, _| Ok(Vec::new()));
        api.expect_logout().times(1).returning(|_| Ok(()));

        let err = Driver::connect(
            Arc::new(api),
            Credentials::default(),
            Some("no-such-dc"),
            DriverSettings::default(),
            Arc::new(CancellationToken::new()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BuildError::NotFound { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_find_one_reports_not_found() {
        let mut api = mock_with_session();
        api.expect_find().returning(|_, _| Ok(Vec::new()));

        let driver = connect(api).await;
        let err = driver.find_vm("missing").await.unwrap_err();
        assert_eq!(err.to_string(), "virtual machine 'missing' not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_waits_for_task() {
        let mut api = mock_with_session();
        api.expect_submit().times(1).returning(|op| {
            Ok(TaskRef {
                id: "task-1".into(),
                description: op.name().into(),
            })
        });
        let mut polls = 0;
        api.expect_task_info().times(3).returning(move |_| {
            polls += 1;
            Ok(TaskInfo {
                state: if polls < 3 {
                    TaskState::Running
                } else {
                    TaskState::Success
                },
                result: Some(serde_json::json!("done")),
                error: None,
                progress: None,
            })
        });

        let driver = connect(api).await;
        let vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, "vm-1");
        let result = driver.execute(Operation::PowerOn { vm }).await.unwrap();
        assert_eq!(result, Some(serde_json::json!("done")));
    }

    #[tokio::test]
    async fn test_execute_translates_task_error() {
        let mut api = mock_with_session();
        api.expect_submit().returning(|_| {
            Ok(TaskRef {
                id: "task-9".into(),
                description: "power_off".into(),
            })
        });
        api.expect_task_info().returning(|_| {
            Ok(TaskInfo {
                state: TaskState::Error,
                result: None,
                error: Some("The attempted operation cannot be performed in the current state (Powered off).".into()),
                progress: None,
            })
        });

        let driver = connect(api).await;
        let vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, "vm-1");
        let err = driver.execute(Operation::PowerOff { vm }).await.unwrap_err();
        match err {
            BuildError::Remote(remote) => {
                assert!(remote.message.contains("current state"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_cancelled_while_waiting() {
        let mut api = mock_with_session();
        api.expect_submit().returning(|_| {
            Ok(TaskRef {
                id: "task-2".into(),
                description: "clone_vm".into(),
            })
        });
        api.expect_task_info().returning(|_| {
            Ok(TaskInfo {
                state: TaskState::Running,
                result: None,
                error: None,
                progress: Some(10),
            })
        });

        let token = Arc::new(CancellationToken::new());
        let driver = Driver::connect(
            Arc::new(api),
            Credentials::default(),
            None,
            DriverSettings::default(),
            token.clone(),
        )
        .await
        .unwrap();
        token.cancel("interrupted");

        let vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, "vm-1");
        let err = driver.execute(Operation::Destroy { vm }).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_teardown_ignores_run_cancellation() {
        let mut api = mock_with_session();
        api.expect_submit().returning(|_| {
            Ok(TaskRef {
                id: "task-3".into(),
                description: "destroy".into(),
            })
        });
        api.expect_task_info().returning(|_| {
            Ok(TaskInfo {
                state: TaskState::Success,
                result: None,
                error: None,
                progress: None,
            })
        });

        let token = Arc::new(CancellationToken::new());
        let driver = Driver::connect(
            Arc::new(api),
            Credentials::default(),
            None,
            DriverSettings::default(),
            token.clone(),
        )
        .await
        .unwrap();
        token.cancel("interrupted");
        driver.clone().begin_teardown();

        let vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, "vm-1");
        assert!(driver.execute(Operation::Destroy { vm }).await.is_ok());
    }

    #[tokio::test]
    async fn test_property_decodes_missing_as_null() {
        let mut api = mock_with_session();
        api.expect_retrieve_properties()
            .returning(|_, _| Ok(PropertyMap::new()));

        let driver = connect(api).await;
        let vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, "vm-1");
        let ip: Option<String> = driver.property(&vm, "guest.ipAddress").await.unwrap();
        assert!(ip.is_none());
    }
}
