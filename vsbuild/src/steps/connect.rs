//! Session setup for a build.

use super::{try_step, Step};
use crate::config::ConnectionConfig;
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::driver::{Driver, ManagementApi};
use crate::errors::BuildResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Logs in and publishes the [`Driver`]. Logs out on cleanup.
#[derive(Debug)]
pub struct StepConnect {
    api: Arc<dyn ManagementApi>,
    connection: ConnectionConfig,
}

impl StepConnect {
    /// Creates the step.
    #[must_use]
    pub fn new(api: Arc<dyn ManagementApi>, connection: ConnectionConfig) -> Self {
        Self { api, connection }
    }
}

#[async_trait]
impl Step for StepConnect {
    fn name(&self) -> &str {
        "connect"
    }

    async fn run(&self, ctx: &RunContext, state: &mut StateBag) -> StepAction {
        let driver = try_step!(
            state,
            self.name(),
            Driver::connect(
                Arc::clone(&self.api),
                self.connection.credentials(),
                self.connection.datacenter.as_deref(),
                self.connection.driver_settings(),
                Arc::clone(ctx.token()),
            )
            .await
        );
        state.set_driver(driver);
        StepAction::Continue
    }

    async fn cleanup(&self, _ctx: &RunContext, state: &mut StateBag) -> BuildResult<()> {
        match state.driver() {
            Some(driver) => driver.logout().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedApi;

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            vcenter_server: "vc".into(),
            username: "builder".into(),
            password: "secret".into(),
            datacenter: Some("dc1".into()),
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_publishes_driver() {
        let sim = Arc::new(SimulatedApi::new());
        let step = StepConnect::new(sim.clone(), connection());
        let ctx = RunContext::new("ubuntu");
        let mut state = StateBag::new();

        assert_eq!(step.run(&ctx, &mut state).await, StepAction::Continue);
        assert!(state.driver().unwrap().datacenter().is_some());

        step.cleanup(&ctx, &mut state).await.unwrap();
        assert_eq!(sim.logout_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_datacenter_halts() {
        let sim = Arc::new(SimulatedApi::new());
        let mut config = connection();
        config.datacenter = Some("nowhere".into());
        let step = StepConnect::new(sim, config);
        let mut state = StateBag::new();

        let action = step.run(&RunContext::new("ubuntu"), &mut state).await;

        assert_eq!(action, StepAction::Halt);
        assert!(state.error().unwrap().to_string().contains("nowhere"));
        assert!(state.driver().is_none());
    }

    #[tokio::test]
    async fn test_unknown_datacenter_logs_out() {
        let sim = SimulatedApi::new();
        let mut config = connection();
        config.datacenter = Some("no-such-dc".into());
        let step = StepConnect::new(Arc::new(sim.clone()), config);
        let ctx = RunContext::new("ubuntu");
        let mut state = StateBag::new();

        assert_eq!(step.run(&ctx, &mut state).await, StepAction::Halt);
        step.cleanup(&ctx, &mut state).await.unwrap();

        assert_eq!(sim.logout_calls(), 1);
    }
}
