#[cfg(test)]
mod tests {
    use crate::plan::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn step(id: &str, tool: &str) -> Step {
        Step::new(id, tool)
    }

    fn level_of(levels: &[Vec<StepId>], id: &str) -> usize {
        levels
            .iter()
            .position(|level| level.iter().any(|s| s == id))
            .unwrap_or_else(|| panic!("step {} not scheduled", id))
    }

    fn assert_each_once(levels: &[Vec<StepId>], expected: &[&str]) {
        let flat: Vec<&StepId> = levels.iter().flatten().collect();
        assert_eq!(flat.len(), expected.len(), "levels: {:?}", levels);
        let unique: HashSet<&str> = flat.iter().map(|s| s.as_str()).collect();
        assert_eq!(unique, expected.iter().copied().collect());
    }

    #[test]
    fn test_step_builder_deduplicates_dependencies() {
        let s = step("b", "analysis")
            .depends_on("a")
            .depends_on("a")
            .with_complexity(1.7)
            .with_parameter("path", "notes.md");

        assert_eq!(s.dependencies, vec!["a".to_string()]);
        assert_eq!(s.complexity, 1.0);
        assert!(s.effective_resource_tags().contains("path:notes.md"));
        assert_eq!(s.status, StepStatus::Pending);
        assert_eq!(s.max_retries, 3);
    }

    #[test]
    fn test_tool_category_from_name() {
        assert_eq!(ToolCategory::of("web_search"), ToolCategory::Search);
        assert_eq!(ToolCategory::of("file_write"), ToolCategory::FileWrite);
        assert_eq!(ToolCategory::of("file_read"), ToolCategory::FileRead);
        assert_eq!(ToolCategory::of("shell"), ToolCategory::Shell);
        assert_eq!(ToolCategory::of("browser"), ToolCategory::Browser);
        assert_eq!(ToolCategory::of("analysis"), ToolCategory::Analysis);
        assert_eq!(ToolCategory::of("report"), ToolCategory::Report);
        assert_eq!(ToolCategory::of("teleport"), ToolCategory::Other);
    }

    #[test]
    fn test_plan_metrics_follow_step_changes() {
        let mut plan = ExecutionPlan::new(
            "demo",
            "demo plan",
            ExecutionStrategy::Sequential,
            vec![
                step("a", "shell").with_duration(Duration::from_secs(10)),
                step("b", "shell").with_duration(Duration::from_secs(20)),
            ],
        );
        assert_eq!(plan.total_estimated_duration(), Duration::from_secs(30));
        let initial_probability = plan.success_probability();
        let initial_complexity = plan.complexity_score();

        plan.push_step(
            step("c", "shell")
                .with_duration(Duration::from_secs(5))
                .with_complexity(1.0)
                .depends_on("b"),
        );
        assert_eq!(plan.total_estimated_duration(), Duration::from_secs(35));
        assert!(plan.success_probability() < initial_probability);
        assert!(plan.complexity_score() > initial_complexity);

        assert!(plan.update_step("a", |s| s.estimated_duration = Duration::from_secs(1)));
        assert_eq!(plan.total_estimated_duration(), Duration::from_secs(26));
        assert!(!plan.update_step("missing", |_| {}));

        plan.remove_step("c");
        assert_eq!(plan.total_estimated_duration(), Duration::from_secs(21));
        assert!((plan.success_probability() - initial_probability).abs() < 1e-9);
        assert!(
            (plan.complexity_score() - complexity_score(plan.steps())).abs() < f64::EPSILON
        );
    }

    #[test]
    fn test_success_probability_is_clamped() {
        let empty: Vec<Step> = Vec::new();
        assert_eq!(success_probability(&empty), 1.0);

        let trivial = vec![step("a", "shell").with_complexity(0.0)];
        assert_eq!(success_probability(&trivial), 0.99);

        let hard: Vec<Step> = (0..200)
            .map(|i| {
                step(&format!("s{}", i), "shell")
                    .with_complexity(1.0)
                    .with_max_retries(0)
            })
            .collect();
        assert_eq!(success_probability(&hard), 0.01);
    }

    #[test]
    fn test_context_validation() {
        let ok = OrchestrationContext::new("t1", "u1", "s1", "Summarize the logs");
        assert!(ok.validate().is_ok());

        let blank = OrchestrationContext::new("t1", "u1", "s1", "   ");
        let err = blank.validate().unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("task_description"));

        let no_user = OrchestrationContext::new("t1", "", "s1", "do it");
        assert!(no_user.validate().is_err());

        let zero_timeout =
            OrchestrationContext::new("t1", "u1", "s1", "do it").with_timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_allowed_tools_constraint() {
        let ctx = OrchestrationContext::new("t1", "u1", "s1", "x").with_constraint(
            "allowed_tools",
            serde_json::json!(["shell", "file_read"]),
        );
        assert_eq!(
            ctx.allowed_tools(),
            Some(vec!["shell".to_string(), "file_read".to_string()])
        );
        assert_eq!(
            OrchestrationContext::new("t1", "u1", "s1", "x").allowed_tools(),
            None
        );
    }

    #[test]
    fn test_linear_chain_produces_one_level_per_step() {
        let steps = vec![
            step("a", "alpha"),
            step("b", "beta").depends_on("a"),
            step("c", "gamma").depends_on("b"),
        ];
        let levels = DependencyResolver::default().resolve_execution_order(&steps);
        assert_eq!(
            levels,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }

    #[test]
    fn test_three_step_cycle_loses_exactly_one_edge() {
        let steps = vec![
            step("1", "alpha").depends_on("3"),
            step("2", "beta").depends_on("1"),
            step("3", "gamma").depends_on("2"),
        ];
        let resolver = DependencyResolver::default();
        let schedule = resolver.resolve(&steps);
        let levels = schedule.execution_order();

        assert_eq!(levels.len(), 3);
        assert_each_once(&levels, &["1", "2", "3"]);

        let removed: Vec<&DependencyIssue> = schedule
            .issues
            .iter()
            .filter(|issue| matches!(issue, DependencyIssue::CycleEdgeRemoved { .. }))
            .collect();
        assert_eq!(removed.len(), 1);

        // The remaining dependencies are still honored
        for s in &steps {
            for dep in &schedule.effective_dependencies[&s.id] {
                assert!(level_of(&levels, dep) < level_of(&levels, &s.id));
            }
        }
    }

    #[test]
    fn test_cycles_always_terminate_with_every_step_once() {
        let cases: Vec<Vec<Step>> = vec![
            vec![step("a", "t1").depends_on("a")],
            vec![step("a", "t1").depends_on("b"), step("b", "t2").depends_on("a")],
            vec![
                step("a", "t1").depends_on("d"),
                step("b", "t2").depends_on("a"),
                step("c", "t3").depends_on("b").depends_on("a"),
                step("d", "t4").depends_on("c").depends_on("b"),
                step("e", "t5").depends_on("d").depends_on("e"),
            ],
            vec![
                step("x", "t1").depends_on("y").depends_on("z"),
                step("y", "t2").depends_on("x").depends_on("z"),
                step("z", "t3").depends_on("x").depends_on("y"),
            ],
        ];

        let resolver = DependencyResolver::default();
        for steps in cases {
            let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
            let levels = resolver.resolve_execution_order(&steps);
            assert_each_once(&levels, &ids);
        }
    }

    #[test]
    fn test_weakest_edge_in_cycle_is_removed() {
        // write precedes the shell step implicitly, but the write explicitly
        // waits for the shell step: the implicit edge is the weaker one
        let steps = vec![
            step("write", "file_write")
                .with_parameter("path", "build.sh")
                .depends_on("run"),
            step("run", "shell").with_parameter("command", "sh build.sh"),
        ];
        let schedule = DependencyResolver::default().resolve(&steps);

        let removed_kinds: Vec<RelationKind> = schedule
            .issues
            .iter()
            .filter_map(|issue| match issue {
                DependencyIssue::CycleEdgeRemoved { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(removed_kinds, vec![RelationKind::Conditional]);
        assert_eq!(
            schedule.execution_order(),
            vec![vec!["run".to_string()], vec!["write".to_string()]]
        );
    }

    #[test]
    fn test_missing_and_self_dependencies_are_reported_not_fatal() {
        let steps = vec![
            step("a", "alpha").depends_on("ghost"),
            step("b", "beta").depends_on("b"),
        ];
        let resolver = DependencyResolver::default();
        let issues = resolver.validate(&steps);

        assert!(issues.contains(&DependencyIssue::MissingDependency {
            step_id: "a".to_string(),
            dependency: "ghost".to_string(),
        }));
        assert!(issues.contains(&DependencyIssue::SelfDependency {
            step_id: "b".to_string(),
        }));

        let levels = resolver.resolve_execution_order(&steps);
        assert_eq!(levels.len(), 1);
        assert_each_once(&levels, &["a", "b"]);
    }

    #[test]
    fn test_duplicate_step_ids_are_scheduled_once() {
        let steps = vec![step("a", "alpha"), step("a", "beta"), step("b", "gamma")];
        let schedule = DependencyResolver::default().resolve(&steps);
        assert!(schedule.issues.contains(&DependencyIssue::DuplicateStep {
            step_id: "a".to_string()
        }));
        assert_each_once(&schedule.execution_order(), &["a", "b"]);
    }

    #[test]
    fn test_parallel_groups_require_distinct_tools() {
        let steps = vec![
            step("search", "web_search").parallelizable(true),
            step("browse", "browser").parallelizable(true),
            step("read", "file_read")
                .with_parameter("path", "data.csv")
                .parallelizable(true),
            step("search_again", "web_search").parallelizable(true),
            step("solo", "shell"),
        ];
        let levels = DependencyResolver::default().optimize_parallel_execution(&steps);

        assert_eq!(levels.len(), 1);
        let level = &levels[0];
        assert_eq!(level.parallel_groups.len(), 1);
        assert_eq!(
            level.parallel_groups[0],
            vec!["search".to_string(), "browse".to_string(), "read".to_string()]
        );
        assert_eq!(
            level.sequential,
            vec!["search_again".to_string(), "solo".to_string()]
        );
        assert_eq!(level.len(), 5);
    }

    #[test]
    fn test_shared_resource_tags_serialize_steps() {
        let steps = vec![
            step("migrate", "shell")
                .with_resource_tag("db")
                .parallelizable(true),
            step("seed", "database_loader")
                .with_resource_tag("db")
                .parallelizable(true),
        ];
        let resolver = DependencyResolver::default();
        let levels = resolver.resolve_execution_order(&steps);
        assert_eq!(levels.len(), 2);

        // Resource ordering does not make the second step depend on the first
        let schedule = resolver.resolve(&steps);
        assert!(schedule.effective_dependencies["seed"].is_empty());
    }

    #[test]
    fn test_data_edges_from_outputs_to_inputs() {
        let steps = vec![
            step("consume", "analysis").with_inputs(["dataset"]),
            step("produce", "fetcher").with_outputs(["dataset"]),
        ];
        let schedule = DependencyResolver::default().resolve(&steps);
        assert_eq!(
            schedule.execution_order(),
            vec![vec!["produce".to_string()], vec!["consume".to_string()]]
        );
        assert_eq!(
            schedule.effective_dependencies["consume"],
            vec!["produce".to_string()]
        );

        let relations = DependencyResolver::default().analyze_dependencies(&steps);
        assert!(
            relations["consume"]
                .iter()
                .any(|r| r.kind == RelationKind::Data && r.required && r.source == "produce")
        );
    }

    #[test]
    fn test_parallel_hints_do_not_order_steps() {
        let steps = vec![
            step("a", "web_search").parallelizable(true),
            step("b", "browser").parallelizable(true),
        ];
        let relations = DependencyResolver::default().analyze_dependencies(&steps);
        assert!(relations["a"].is_empty());
        assert_eq!(relations["b"].len(), 1);
        assert_eq!(relations["b"][0].kind, RelationKind::ParallelHint);
        assert!(!relations["b"][0].kind.is_ordering());
    }

    #[test]
    fn test_implicit_search_before_analysis() {
        let steps = vec![
            step("gather", "web_search").parallelizable(true),
            step("think", "analysis").parallelizable(true),
        ];
        let resolver = DependencyResolver::default();
        assert_eq!(resolver.resolve_execution_order(&steps).len(), 2);

        let no_implicit = DependencyResolver::new(ResolverConfig {
            infer_implicit_edges: false,
            ..ResolverConfig::default()
        });
        assert_eq!(no_implicit.resolve_execution_order(&steps).len(), 1);
    }

    #[test]
    fn test_level_sorted_by_priority() {
        let steps = vec![
            step("low", "a").with_priority(1),
            step("high", "b").with_priority(9),
            step("mid", "c").with_priority(5),
        ];
        let levels = DependencyResolver::default().resolve_execution_order(&steps);
        assert_eq!(
            levels,
            vec![vec![
                "high".to_string(),
                "mid".to_string(),
                "low".to_string()
            ]]
        );
    }

    #[test]
    fn test_break_explicit_cycles_rewrites_steps() {
        let mut steps = vec![
            step("a", "alpha").depends_on("c").depends_on("ghost"),
            step("b", "beta").depends_on("a"),
            step("c", "gamma").depends_on("b"),
        ];
        let issues = DependencyResolver::default().break_explicit_cycles(&mut steps);

        assert!(issues
            .iter()
            .any(|i| matches!(i, DependencyIssue::MissingDependency { .. })));
        assert!(issues
            .iter()
            .any(|i| matches!(i, DependencyIssue::CycleEdgeRemoved { .. })));
        assert!(steps[0].dependencies.is_empty());
        assert_eq!(steps[1].dependencies, vec!["a".to_string()]);
        assert_eq!(steps[2].dependencies, vec!["b".to_string()]);
    }

    #[test]
    fn test_plan_serializes_durations_as_millis() {
        let plan = ExecutionPlan::new(
            "p",
            "d",
            ExecutionStrategy::GoalOriented,
            vec![step("a", "shell").with_duration(Duration::from_millis(1500))],
        );
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["total_estimated_duration_ms"], 1500);
        assert_eq!(json["strategy"], "goal-oriented");
        assert_eq!(json["steps"][0]["estimated_duration_ms"], 1500);
    }
}
