#[cfg(test)]
mod tests {
    use crate::error::OrchestraError;
    use crate::orchestrator::*;
    use crate::plan::{
        DecompositionSource, ExecutionPlan, ExecutionStrategy, OrchestrationContext, ResultStatus,
        Step,
    };
    use crate::planning::{
        Decomposer, DecompositionError, DecompositionRequest,
        HierarchicalPlanningEngine, PlanningConfig, TemplateDecomposer,
    };
    use crate::resources::{
        FixedUsageSampler, ResourceManager, ResourceManagerConfig, ResourceType,
    };
    use crate::telemetry::{ChannelEventSink, LifecycleEventKind, Telemetry};
    use crate::tools::{DEFAULT_TOOLS, MockToolExecutor, ToolError};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// Template decomposition that takes a while
    struct SlowDecomposer(Duration);

    #[async_trait]
    impl Decomposer for SlowDecomposer {
        async fn decompose(
            &self,
            request: &DecompositionRequest,
        ) -> Result<(Vec<Step>, DecompositionSource), DecompositionError> {
            tokio::time::sleep(self.0).await;
            TemplateDecomposer::new().decompose(request).await
        }
    }

    fn mock() -> Arc<MockToolExecutor> {
        Arc::new(MockToolExecutor::new(DEFAULT_TOOLS.iter().copied()))
    }

    fn context(task_id: &str) -> OrchestrationContext {
        OrchestrationContext::new(task_id, "user-1", "session-1", "Summarize the release notes")
    }

    fn linear_plan() -> ExecutionPlan {
        ExecutionPlan::new(
            "linear",
            "three analysis steps",
            ExecutionStrategy::Sequential,
            vec![
                Step::new("a", "analysis"),
                Step::new("b", "analysis").depends_on("a"),
                Step::new("c", "report").depends_on("b"),
            ],
        )
    }

    async fn wait_until_active(orchestrator: &TaskOrchestrator) {
        for _ in 0..200 {
            if !orchestrator.active_tasks().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("orchestration never became active");
    }

    #[tokio::test]
    async fn test_linear_plan_succeeds_and_releases() {
        let tools = mock();
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), tools.clone());

        let result = orchestrator
            .orchestrate_plan(context("t1"), linear_plan())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.steps_completed, 3);
        assert_eq!(result.steps_failed, 0);
        assert_eq!(result.adaptations_made, 0);
        assert_eq!(result.outputs.len(), 3);
        assert!(result.summary.is_some());
        assert!(result.error.is_none());
        assert_eq!(
            result.execution_order,
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
        let order: Vec<String> = tools.calls().into_iter().map(|c| c.step_id).collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        let resources = orchestrator.resources();
        assert_eq!(resources.metrics().await.granted, 6);
        assert_eq!(resources.allocated(ResourceType::Cpu).await, 0.0);
        assert_eq!(resources.allocated(ResourceType::Memory).await, 0.0);
        assert!(orchestrator.active_tasks().is_empty());

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.total_orchestrations, 1);
        assert_eq!(metrics.successful, 1);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.total_steps_completed, 3);
    }

    #[tokio::test]
    async fn test_planned_task_runs() {
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), mock());
        let context = OrchestrationContext::new(
            "t1",
            "user-1",
            "session-1",
            "Research rust async runtimes using web sources and academic papers",
        );
        let result = orchestrator.orchestrate(context).await.unwrap();

        assert!(result.success);
        assert_eq!(result.strategy, ExecutionStrategy::Parallel);
        assert_eq!(result.steps_total, 4);
        assert_eq!(result.steps_completed, 4);
        assert!(!result.fallback);
    }

    #[tokio::test]
    async fn test_invalid_context_rejected() {
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), mock());
        let context = OrchestrationContext::new("t1", "", "session-1", "do things");
        let err = orchestrator.orchestrate(context).await.unwrap_err();
        assert!(matches!(err, OrchestraError::Validation(_)));
        assert_eq!(orchestrator.metrics().await.total_orchestrations, 0);
    }

    #[tokio::test]
    async fn test_failed_step_reports_error() {
        let tools = mock();
        tools.fail_step_always("b", ToolError::failed("segmentation fault"), 10);
        let (sink, mut events) = ChannelEventSink::new(64);
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), tools)
            .with_telemetry(Telemetry::new().with_sink(Arc::new(sink)));

        let result = orchestrator
            .orchestrate_plan(context("t1"), linear_plan())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.steps_completed, 1);
        assert_eq!(result.steps_failed, 1);
        assert!(result.summary.is_none());
        assert!(result.error.is_some());
        assert!(result.outputs.contains_key("a"));

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.task_id, "t1");
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&LifecycleEventKind::TaskStarted));
        assert_eq!(kinds.get(1), Some(&LifecycleEventKind::PlanUpdated));
        assert_eq!(kinds.last(), Some(&LifecycleEventKind::TaskFailed));
        assert!(kinds.contains(&LifecycleEventKind::StepFailed));

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_cyclic_plan_is_repaired() {
        let plan = ExecutionPlan::new(
            "cycle",
            "a and b wait on each other",
            ExecutionStrategy::Sequential,
            vec![
                Step::new("a", "analysis").depends_on("b"),
                Step::new("b", "report").depends_on("a"),
            ],
        );
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), mock());
        let result = orchestrator.orchestrate_plan(context("t1"), plan).await.unwrap();

        assert!(result.success);
        assert_eq!(result.steps_completed, 2);
        assert!(!result.issues.is_empty());
        assert!(result.issues[0].starts_with("Dependency error"));
        let flattened: Vec<String> = result.execution_order.concat();
        assert_eq!(flattened.len(), 2);
    }

    #[tokio::test]
    async fn test_admission_control() {
        let tools = mock();
        tools.delay_step("a", Duration::from_millis(300));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            OrchestratorConfig {
                max_concurrent_tasks: 1,
                ..OrchestratorConfig::default()
            },
            tools,
        ));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.orchestrate_plan(context("t1"), linear_plan()).await })
        };
        wait_until_active(&orchestrator).await;

        let err = orchestrator
            .orchestrate_plan(context("t2"), linear_plan())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestraError::AdmissionRejected {
                active: 1,
                limit: 1
            }
        ));
        assert!(err.is_transient());

        let result = running.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(orchestrator.metrics().await.rejected, 1);

        // capacity is back once the first run finished
        assert!(orchestrator.orchestrate_plan(context("t3"), linear_plan()).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_task_id_rejected() {
        let tools = mock();
        tools.delay_step("a", Duration::from_millis(300));
        let orchestrator = Arc::new(TaskOrchestrator::new(OrchestratorConfig::default(), tools));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.orchestrate_plan(context("t1"), linear_plan()).await })
        };
        wait_until_active(&orchestrator).await;

        let err = orchestrator
            .orchestrate_plan(context("t1"), linear_plan())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestraError::Orchestration(_)));
        assert!(!err.is_transient());
        assert!(running.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_results() {
        let tools = mock();
        tools.delay_step("a", Duration::from_millis(300));
        let orchestrator = Arc::new(TaskOrchestrator::new(OrchestratorConfig::default(), tools.clone()));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.orchestrate_plan(context("t1"), linear_plan()).await })
        };
        wait_until_active(&orchestrator).await;
        // let step a start and take its grant
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(orchestrator.cancel("t1").await);
        assert!(!orchestrator.cancel("t1").await);
        assert!(!orchestrator.cancel("missing").await);
        assert!(orchestrator.active_tasks().is_empty());

        let result = running.await.unwrap().unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.steps_completed, 1);
        assert_eq!(result.steps_not_started, 2);
        assert!(result.outputs.contains_key("a"));
        assert_eq!(tools.call_count(), 1);

        assert_eq!(orchestrator.resources().allocated(ResourceType::Cpu).await, 0.0);
        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.cancelled, 1);
    }

    #[tokio::test]
    async fn test_critical_alert_halves_admission() {
        let sampler = Arc::new(FixedUsageSampler::new());
        let resources = ResourceManager::with_sampler(ResourceManagerConfig::default(), sampler.clone());
        let orchestrator = TaskOrchestrator::new(
            OrchestratorConfig {
                max_concurrent_tasks: 4,
                ..OrchestratorConfig::default()
            },
            mock(),
        )
        .with_resources(resources.clone());

        assert_eq!(orchestrator.admission_limit(), 4);
        sampler.set(ResourceType::Cpu, 0.95);
        resources.monitor_tick().await;
        assert_eq!(orchestrator.admission_limit(), 2);

        // the throttle outlives the pressure until the cooldown passes
        sampler.clear();
        resources.monitor_tick().await;
        assert_eq!(orchestrator.admission_limit(), 2);
    }

    #[tokio::test]
    async fn test_throttle_expires_after_cooldown() {
        let sampler = Arc::new(FixedUsageSampler::new());
        let resources = ResourceManager::with_sampler(ResourceManagerConfig::default(), sampler.clone());
        let orchestrator = TaskOrchestrator::new(
            OrchestratorConfig {
                max_concurrent_tasks: 3,
                throttle_cooldown_ms: 0,
                ..OrchestratorConfig::default()
            },
            mock(),
        )
        .with_resources(resources.clone());

        sampler.set(ResourceType::Memory, 0.99);
        resources.monitor_tick().await;
        assert_eq!(orchestrator.admission_limit(), 3);
    }

    #[tokio::test]
    async fn test_unmanaged_resources_do_not_limit_parallelism() {
        let tools = mock();
        let resources = ResourceManager::new(ResourceManagerConfig {
            cpu_max: 0.0,
            memory_max: 0.0,
            ..ResourceManagerConfig::default()
        });
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), tools)
            .with_resources(resources);
        let plan = ExecutionPlan::new(
            "fan",
            "independent steps",
            ExecutionStrategy::Parallel,
            vec![
                Step::new("s", "web_search").parallelizable(true),
                Step::new("b", "browser").parallelizable(true),
            ],
        );
        let result = orchestrator.orchestrate_plan(context("t1"), plan).await.unwrap();
        assert!(result.success);
        assert_eq!(orchestrator.resources().metrics().await.granted, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active() {
        let tools = mock();
        tools.delay_step("a", Duration::from_millis(300));
        let orchestrator = Arc::new(TaskOrchestrator::new(OrchestratorConfig::default(), tools));
        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.orchestrate_plan(context("t1"), linear_plan()).await })
        };
        wait_until_active(&orchestrator).await;

        orchestrator.shutdown().await;
        assert!(orchestrator.active_tasks().is_empty());
        assert!(running.await.unwrap().unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_runs_without_deadline() {
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), mock());
        let context = context("t1").with_timeout(Duration::from_secs(u64::MAX / 2));

        let result = orchestrator.orchestrate_plan(context, linear_plan()).await.unwrap();

        assert!(result.success);
        assert!(!result.deadline_exceeded);
        assert_eq!(result.steps_completed, 3);
    }

    #[tokio::test]
    async fn test_cancel_before_execution_is_an_error() {
        let tools = mock();
        let planner = HierarchicalPlanningEngine::new(PlanningConfig::default())
            .with_decomposer(Arc::new(SlowDecomposer(Duration::from_millis(300))));
        let orchestrator = Arc::new(
            TaskOrchestrator::new(OrchestratorConfig::default(), tools.clone()).with_planner(planner),
        );

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let context = OrchestrationContext::new(
                    "t1",
                    "user-1",
                    "session-1",
                    "Research rust async runtimes using web sources and academic papers",
                );
                orchestrator.orchestrate(context).await
            })
        };
        wait_until_active(&orchestrator).await;
        assert!(orchestrator.cancel("t1").await);

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(&err, OrchestraError::Cancelled(task_id) if task_id == "t1"));
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(tools.call_count(), 0);
        assert!(orchestrator.active_tasks().is_empty());

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(metrics.failed, 0);
    }

    #[tokio::test]
    async fn test_step_failing_after_cancel_is_not_a_failure() {
        let tools = mock();
        tools.delay_step("a", Duration::from_millis(200));
        tools.script_step("a", [Err(ToolError::network("connection reset"))]);
        let orchestrator = Arc::new(TaskOrchestrator::new(OrchestratorConfig::default(), tools.clone()));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.orchestrate_plan(context("t1"), linear_plan()).await })
        };
        wait_until_active(&orchestrator).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(orchestrator.cancel("t1").await);

        let result = running.await.unwrap().unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.steps_failed, 0);
        assert_eq!(result.steps_cancelled, 1);
        assert_eq!(result.steps_not_started, 2);
        assert_eq!(result.results[0].status, ResultStatus::Cancelled);
        assert_eq!(tools.call_count(), 1);

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(metrics.total_steps_failed, 0);
    }

    #[tokio::test]
    async fn test_steps_reserve_when_their_level_starts() {
        // room for one step's demand at a time
        let resources = ResourceManager::with_sampler(
            ResourceManagerConfig {
                cpu_max: 50.0,
                memory_max: 50.0,
                ..ResourceManagerConfig::default()
            },
            Arc::new(FixedUsageSampler::new()),
        );
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), mock())
            .with_resources(resources.clone());

        let result = orchestrator
            .orchestrate_plan(context("t1"), linear_plan())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.issues.is_empty());
        let metrics = resources.metrics().await;
        assert_eq!(metrics.granted, 6);
        assert_eq!(metrics.queued, 0);
        assert_eq!(resources.queue_len().await, 0);
        assert_eq!(resources.allocated(ResourceType::Cpu).await, 0.0);
    }

    #[tokio::test]
    async fn test_contended_step_runs_ungranted_and_reports_it() {
        let resources = ResourceManager::with_sampler(
            ResourceManagerConfig {
                cpu_max: 50.0,
                ..ResourceManagerConfig::default()
            },
            Arc::new(FixedUsageSampler::new()),
        );
        resources
            .try_request(crate::resources::ResourceRequest::new(
                "other/x",
                ResourceType::Cpu,
                40.0,
            ))
            .await
            .unwrap();
        let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), mock())
            .with_resources(resources.clone());

        let result = orchestrator
            .orchestrate_plan(context("t1"), linear_plan())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.issues.len(), 3);
        assert!(result.issues.iter().all(|issue| issue.contains("Resource exhausted")));
        assert_eq!(resources.queue_len().await, 0);

        resources.release("other/x").await;
        assert_eq!(resources.allocated(ResourceType::Cpu).await, 0.0);
    }
}
