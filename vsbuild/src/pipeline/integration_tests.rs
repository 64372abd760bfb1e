//! End-to-end tests for pipeline execution over mock steps and the simulator.

#[cfg(test)]
mod tests {
    use crate::config::{IsoConfig, LocationConfig, ShutdownConfig, SourceConfig};
    use crate::context::{RunContext, StateBag};
    use crate::core::RunStatus;
    use crate::events::{CollectingEventSink, STEP_CLEANUP_FAILED};
    use crate::pipeline::PipelineBuilder;
    use crate::resolver::{resolve_datastore, DatastoreTarget, PlacementHints, SelectionMethod};
    use crate::steps::{
        StepCollectMetadata, StepConnect, StepCreateVm, StepPowerOn, StepRemoteUpload,
        StepResolvePlacement, StepShutdown,
    };
    use crate::testing::{
        iso_config, CallLog, HaltingStep, RecordingStep, SimulatedApi, WaitingStep,
    };
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    async fn vm_state(sim: &SimulatedApi, name: &str) -> StateBag {
        let vm_ref = sim.add_vm(name, false);
        let driver = sim.connect().await;
        let mut state = StateBag::new();
        state.set_vm(driver.vm(vm_ref));
        state.set_driver(driver);
        state
    }

    #[tokio::test]
    async fn test_cleanup_runs_for_started_steps_in_reverse() {
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("unwind")
            .step(RecordingStep::new("a", &log))
            .step(HaltingStep::new("b", &log).with_error("no space"))
            .step(RecordingStep::new("c", &log))
            .build()
            .unwrap();
        let mut state = StateBag::new();

        let summary = pipeline.run(&RunContext::new("unwind"), &mut state).await;

        assert_eq!(summary.status, RunStatus::Halted);
        assert_eq!(summary.steps_run, vec!["a", "b"]);
        assert_eq!(
            log.entries(),
            vec!["run:a", "run:b", "cleanup:b", "cleanup:a:teardown"]
        );
        assert!(log.entries_with_prefix("run:c").is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_reported_not_recorded() {
        let log = CallLog::new();
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new("unwind")
            .step(RecordingStep::new("a", &log).with_cleanup_error("datastore busy"))
            .step(HaltingStep::new("b", &log).with_error("disk full"))
            .build()
            .unwrap();
        let ctx = RunContext::new("unwind").with_event_sink(events.clone());
        let mut state = StateBag::new();

        let summary = pipeline.run(&ctx, &mut state).await;

        assert_eq!(summary.cleanup_failures.len(), 1);
        assert_eq!(summary.cleanup_failures[0].step, "a");
        assert_eq!(
            state.error().unwrap().to_string(),
            "step 'b' failed: validation failed: disk full"
        );
        let failed = events.events_of_type(STEP_CLEANUP_FAILED);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1.as_ref().unwrap()["step"], "a");
        assert_eq!(events.event_types().last().unwrap(), "pipeline.completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_wait_is_quiet() {
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("wait")
            .step(RecordingStep::new("before", &log))
            .step(WaitingStep::new("wait", &log, Duration::from_secs(60)))
            .step(RecordingStep::new("after", &log))
            .build()
            .unwrap();
        let ctx = RunContext::new("wait");
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel("operator abort");
        });
        let mut state = StateBag::new();
        let start = Instant::now();

        let summary = pipeline.run(&ctx, &mut state).await;

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(state.error().is_none());
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(
            log.entries(),
            vec!["run:before", "run:wait", "cleanup:wait", "cleanup:before:teardown"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_times_out_after_configured_limit() {
        let sim = SimulatedApi::new();
        sim.ignore_guest_shutdown();
        let mut state = vm_state(&sim, "ubuntu").await;
        let pipeline = PipelineBuilder::new("shutdown")
            .step(StepPowerOn::new())
            .step(StepShutdown::new(
                ShutdownConfig {
                    shutdown_timeout: Duration::from_secs(2),
                    poll_interval: Duration::from_millis(250),
                    ..ShutdownConfig::default()
                },
                None,
            ))
            .build()
            .unwrap();
        let start = Instant::now();

        let summary = pipeline.run(&RunContext::new("ubuntu"), &mut state).await;

        let elapsed = start.elapsed();
        assert_eq!(summary.status, RunStatus::Halted);
        assert!(state.error().unwrap().root().is_timeout());
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_finishing_before_limit_continues() {
        let sim = SimulatedApi::new();
        sim.ignore_guest_shutdown();
        let mut state = vm_state(&sim, "ubuntu").await;
        let pipeline = PipelineBuilder::new("shutdown")
            .step(StepPowerOn::new())
            .step(StepShutdown::new(
                ShutdownConfig {
                    shutdown_timeout: Duration::from_secs(2),
                    poll_interval: Duration::from_millis(250),
                    ..ShutdownConfig::default()
                },
                None,
            ))
            .build()
            .unwrap();
        let guest = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            guest.power_off_vm("ubuntu");
        });

        let summary = pipeline.run(&RunContext::new("ubuntu"), &mut state).await;

        assert!(summary.is_success(), "{:?}", state.error());
    }

    #[tokio::test]
    async fn test_metadata_numbers_repeated_items() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim, "ubuntu").await;
        sim.set_vm_backing("ubuntu", &["ds-a", "ds-b"], &["VM Network", "pg-build"]);
        let pipeline = PipelineBuilder::new("metadata")
            .step(StepCollectMetadata::new())
            .build()
            .unwrap();

        pipeline.run(&RunContext::new("ubuntu"), &mut state).await;

        let labels = state.labels();
        assert_eq!(labels["datastore"], "ds-a");
        assert_eq!(labels["datastore_1"], "ds-b");
        assert_eq!(labels["network"], "VM Network");
        assert_eq!(labels["network_1"], "pg-build");
        assert!(!labels.contains_key("datastore_2"));
    }

    #[tokio::test]
    async fn test_second_upload_reuses_remote_file() {
        let sim = SimulatedApi::new();
        let pipeline = PipelineBuilder::new("upload")
            .step(StepRemoteUpload::new(IsoConfig::default()))
            .build()
            .unwrap();

        for _ in 0..2 {
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

            let summary = pipeline.run(&RunContext::new("ubuntu"), &mut state).await;
            assert!(summary.is_success());
        }

        assert_eq!(sim.upload_calls(), 1);
        assert!(sim.file_exists("datastore1", "vsbuild_cache/ubuntu.iso"));
    }

    async fn placement_for(sim: &SimulatedApi) -> (RunStatus, StateBag) {
        let config = iso_config("ubuntu");
        let pipeline = PipelineBuilder::new("placement")
            .step(StepConnect::new(Arc::new(sim.clone()), config.connection.clone()))
            .step(StepResolvePlacement::new(
                "ubuntu",
                LocationConfig {
                    cluster: Some("cluster1".into()),
                    ..LocationConfig::default()
                },
                Some(DatastoreTarget::Group("dsc1".into())),
            ))
            .build()
            .unwrap();
        let mut state = StateBag::new();
        let summary = pipeline.run(&RunContext::new("ubuntu"), &mut state).await;
        (summary.status, state)
    }

    #[tokio::test]
    async fn test_datastore_group_uses_recommendation() {
        let sim = SimulatedApi::new();
        sim.recommend(&["ds-b"]);

        let (status, state) = placement_for(&sim).await;

        assert_eq!(status, RunStatus::Completed);
        let placement = state.placement().unwrap();
        assert_eq!(placement.datastore.name(), "ds-b");
        assert_eq!(placement.method, SelectionMethod::Recommendation);
        assert_eq!(sim.recommendation_calls(), 1);
    }

    #[tokio::test]
    async fn test_datastore_group_falls_back_to_first_member() {
        let sim = SimulatedApi::new();

        let (status, state) = placement_for(&sim).await;

        assert_eq!(status, RunStatus::Completed);
        let placement = state.placement().unwrap();
        assert_eq!(placement.datastore.name(), "ds-a");
        assert_eq!(placement.method, SelectionMethod::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_build_still_destroys_created_vm() {
        let sim = SimulatedApi::new();
        let log = CallLog::new();
        let config = iso_config("ubuntu");
        let SourceConfig::Iso(create) = config.source.clone() else {
            unreachable!("iso fixture");
        };
        let pipeline = PipelineBuilder::new("iso")
            .step(StepConnect::new(Arc::new(sim.clone()), config.connection.clone()))
            .step(StepResolvePlacement::new(
                "ubuntu",
                config.location.clone(),
                config.datastore_target(),
            ))
            .step(StepCreateVm::new("ubuntu", create, config.hardware.clone(), false))
            .step(WaitingStep::new("install", &log, Duration::from_secs(3600)))
            .build()
            .unwrap();
        let ctx = RunContext::new("ubuntu");
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            canceller.cancel("operator abort");
        });
        let mut state = StateBag::new();

        let summary = pipeline.run(&ctx, &mut state).await;

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(summary.cleanup_failures.is_empty(), "{:?}", summary.cleanup_failures);
        assert!(!sim.vm_exists("ubuntu"));
        assert_eq!(sim.logout_calls(), 1);
    }
}
