// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Multi-stage builds: `COPY --from` ordering, missing stages, cycles.

use super::*;

#[tokio::test]
async fn test_copy_from_waits_for_builder_stage() {
    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&multistage_graph()).await;
    result.unwrap();

    // The cross-stage copy must not start before the builder stage's
    // final snapshot exists.
    let builder_completed = events
        .iter()
        .position(|e| matches!(e, BuildEvent::StageCompleted { stage, .. } if stage == "builder"))
        .unwrap();
    let copy_started = started_index(&events, "copy-out").unwrap();
    assert!(
        builder_completed < copy_started,
        "builder completed at {builder_completed}, copy started at {copy_started}"
    );
}

#[tokio::test]
async fn test_missing_copy_from_stage_fails_before_any_execution() {
    // The multistage graph with the builder stage deleted.
    let mut graph = multistage_graph();
    graph.stages.retain(|s| s.id != "builder");

    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&graph).await;

    assert!(matches!(result, Err(Error::StageNotFound(name)) if name == "builder"));
    assert_eq!(harness.scripted.dispatch_count(), 0);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, BuildEvent::OperationStarted { .. })),
        "no operation may start when analysis fails"
    );
}

#[tokio::test]
async fn test_cycle_inside_stage_emits_no_operation_events() {
    let graph = BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("app", Operation::from_scratch())
                .with_node(
                    BuildNode::new("a", Operation::run("a", vec![])).with_dependency("b"),
                )
                .with_node(
                    BuildNode::new("b", Operation::run("b", vec![])).with_dependency("a"),
                ),
        );

    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&graph).await;

    assert!(matches!(result, Err(Error::CyclicDependency(_))));
    assert!(events.is_empty());
    assert_eq!(harness.scripted.dispatch_count(), 0);
}

#[tokio::test]
async fn test_cycle_between_stages_is_rejected() {
    let graph = BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("first", Operation::from_scratch()).with_node(BuildNode::new(
                "from-second",
                Operation::copy_from_stage(
                    StageRef::Named("second".to_string()),
                    vec!["/x".to_string()],
                    "/x",
                ),
            )),
        )
        .with_stage(
            BuildStage::new("second", Operation::from_scratch()).with_node(BuildNode::new(
                "from-first",
                Operation::copy_from_stage(
                    StageRef::Named("first".to_string()),
                    vec!["/y".to_string()],
                    "/y",
                ),
            )),
        );

    let harness = Harness::new(SchedulerConfig::default());
    let (result, _) = harness.run(&graph).await;
    assert!(matches!(result, Err(Error::CyclicDependency(_))));
}

#[tokio::test]
async fn test_stages_outside_target_closure_are_skipped() {
    let mut graph = multistage_graph().with_target_stage("runtime");
    graph.add_stage(
        BuildStage::new("docs", Operation::from_registry("alpine:3.20")).with_node(
            BuildNode::new("render", Operation::run("mkdocs", vec!["build".to_string()])),
        ),
    );

    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&graph).await;
    result.unwrap();

    assert!(
        !events
            .iter()
            .any(|e| matches!(e, BuildEvent::StageStarted { stage, .. } if stage == "docs")),
        "unreferenced stage must not run"
    );
    assert_eq!(harness.scripted.dispatches_for("RUN mkdocs build"), 0);
    assert_eq!(harness.scripted.dispatches_for("RUN go build"), 1);
}

#[tokio::test]
async fn test_copy_from_previous_resolves_to_preceding_stage() {
    let graph = BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("builder", Operation::from_scratch()).with_node(BuildNode::new(
                "compile",
                Operation::run("cc", vec!["-o".to_string(), "/out".to_string()]),
            )),
        )
        .with_stage(
            BuildStage::new("runtime", Operation::from_scratch()).with_node(BuildNode::new(
                "copy",
                Operation::copy_from_stage(StageRef::Previous, vec!["/out".to_string()], "/out"),
            )),
        );

    let harness = Harness::new(SchedulerConfig::default());
    let (result, _) = harness.run(&graph).await;
    result.unwrap();
}

#[tokio::test]
async fn test_empty_graph_is_invalid() {
    let graph = BuildGraph::new().with_platform(Platform::linux_amd64());
    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&graph).await;
    assert!(matches!(result, Err(Error::InvalidGraph(_))));
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_stage_chain_runs_in_rounds() {
    // a <- b <- c: three stages that must serialize through their snapshots.
    let graph = BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(BuildStage::new("a", Operation::from_scratch()).with_node(
            BuildNode::new("build-a", Operation::run("a", vec![])),
        ))
        .with_stage(
            BuildStage::new("b", Operation::from_scratch()).with_node(BuildNode::new(
                "from-a",
                Operation::copy_from_stage(
                    StageRef::Named("a".to_string()),
                    vec!["/a".to_string()],
                    "/a",
                ),
            )),
        )
        .with_stage(
            BuildStage::new("c", Operation::from_scratch()).with_node(BuildNode::new(
                "from-b",
                Operation::copy_from_stage(
                    StageRef::Named("b".to_string()),
                    vec!["/b".to_string()],
                    "/b",
                ),
            )),
        );

    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&graph).await;
    result.unwrap();

    let completion_order: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            BuildEvent::StageCompleted { stage, .. } => Some(stage.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completion_order, vec!["a", "b", "c"]);
}
