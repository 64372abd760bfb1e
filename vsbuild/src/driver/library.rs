//! Content library access over the catalog sub-protocol.
//!
//! The catalog uses its own session, opened with [`Driver::catalog_login`]
//! and closed with [`CatalogClient::close`]. A failed logout after the work
//! is done is logged and never replaces the outcome of that work.

use super::api::{CatalogSession, LibraryInfo, LibraryItemInfo, Operation, PublishEvent};
use super::client::Driver;
use super::spec::ImportSpec;
use super::vm::VirtualMachine;
use crate::context::PublishWatch;
use crate::errors::{BuildError, BuildResult, RemoteError};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl Driver {
    /// Opens a catalog session with the driver's credentials.
    pub async fn catalog_login(&self) -> BuildResult<CatalogClient> {
        let session = self.api().catalog_login(self.credentials()).await?;
        debug!("catalog session opened");
        Ok(CatalogClient {
            driver: self.clone(),
            session,
        })
    }
}

/// A logged-in catalog session.
#[derive(Debug)]
pub struct CatalogClient {
    driver: Driver,
    session: CatalogSession,
}

impl CatalogClient {
    /// Finds a library by name.
    pub async fn find_library(&self, name: &str) -> BuildResult<LibraryInfo> {
        self.driver
            .api()
            .find_library(&self.session, name)
            .await?
            .ok_or_else(|| BuildError::not_found("content library", name))
    }

    /// Finds an item by name inside a library.
    pub async fn find_item(&self, library_id: &str, name: &str) -> BuildResult<Option<LibraryItemInfo>> {
        Ok(self
            .driver
            .api()
            .find_library_item(&self.session, library_id, name)
            .await?)
    }

    /// Captures `vm` into the library. Returns the new item id.
    pub async fn import_vm(
        &self,
        vm: &VirtualMachine,
        library_id: &str,
        spec: ImportSpec,
    ) -> BuildResult<String> {
        let item_name = spec.name.clone();
        let result = self
            .driver
            .execute(Operation::ImportToLibrary {
                session: self.session.clone(),
                vm: vm.reference().clone(),
                library_id: library_id.to_string(),
                spec,
            })
            .await?;

        let item_id = result
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| {
                BuildError::Remote(RemoteError::task_failed(
                    "library import returned no item id",
                ))
            })?;
        info!(item = %item_name, id = %item_id, "imported into content library");
        Ok(item_id)
    }

    /// Deletes a library item.
    pub async fn delete_item(&self, item_id: &str) -> BuildResult<()> {
        self.driver
            .execute(Operation::DeleteLibraryItem {
                session: self.session.clone(),
                item_id: item_id.to_string(),
            })
            .await?;
        info!(id = %item_id, "library item deleted");
        Ok(())
    }

    /// Publishes an item to subscribers and watches for completion.
    ///
    /// `watch` is marked active for the duration of the watch. Returns
    /// `Ok(true)` when publishing completed and `Ok(false)` if the run was
    /// cancelled. Exceeding `timeout` is a [`BuildError::Timeout`].
    pub async fn publish(
        &self,
        item_id: &str,
        timeout: Duration,
        watch: &PublishWatch,
    ) -> BuildResult<bool> {
        let _guard = watch.begin();
        let mut events = self
            .driver
            .api()
            .watch_publish(&self.session, item_id)
            .await?;

        self.driver
            .execute(Operation::PublishLibraryItem {
                session: self.session.clone(),
                item_id: item_id.to_string(),
            })
            .await?;

        let deadline = Instant::now() + timeout;
        let token = self.driver.token();
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(PublishEvent::Progress { percent }) => {
                        debug!(item = item_id, percent, "publish progress");
                    }
                    Some(PublishEvent::Completed) => {
                        info!(item = item_id, "library item published");
                        return Ok(true);
                    }
                    Some(PublishEvent::Failed { message }) => {
                        return Err(RemoteError::task_failed(message).into());
                    }
                    None => {
                        return Err(RemoteError::task_failed(
                            "publish watch ended before completion",
                        )
                        .into());
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    return Err(BuildError::timeout(
                        format!("publish of library item {item_id}"),
                        timeout,
                    ));
                }
                () = token.cancelled() => {
                    debug!(item = item_id, "publish watch cancelled");
                    return Ok(false);
                }
            }
        }
    }

    /// Closes the session, reporting a logout failure.
    pub async fn logout(self) -> BuildResult<()> {
        self.driver.api().catalog_logout(&self.session).await?;
        debug!("catalog session closed");
        Ok(())
    }

    /// Closes the session. A logout failure is only logged.
    pub async fn close(self) {
        if let Err(e) = self.logout().await {
            warn!(error = %e, "catalog logout failed");
        }
    }
}
