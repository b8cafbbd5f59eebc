// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Single-stage pipelines: event ordering, dependency gating, platforms.

use super::*;

#[tokio::test]
async fn test_single_stage_event_order() {
    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&single_stage_graph()).await;

    let result = result.unwrap();
    assert_eq!(result.manifests.len(), 1);
    assert!(result.manifests.contains_key(&Platform::linux_amd64()));

    assert_eq!(
        event_names(&events),
        vec![
            "build_started",
            "stage_started",
            "operation_started",   // FROM scratch
            "operation_finished",
            "operation_started",   // ENV K=V
            "operation_finished",
            "operation_started",   // COPY /src /dst
            "operation_finished",
            "stage_completed",
            "build_completed",
        ]
    );

    match &events[0] {
        BuildEvent::BuildStarted {
            total_operations,
            stages,
            ..
        } => {
            assert_eq!(*total_operations, 3);
            assert_eq!(*stages, 1);
        }
        other => panic!("unexpected first event: {other:?}"),
    }
    match &events[2] {
        BuildEvent::OperationStarted { context } => {
            assert_eq!(context.description, "FROM scratch");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match &events[4] {
        BuildEvent::OperationStarted { context } => {
            assert_eq!(context.description, "ENV K=V");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match events.last() {
        Some(BuildEvent::BuildCompleted { success, .. }) => assert!(*success),
        other => panic!("unexpected last event: {other:?}"),
    }
}

#[tokio::test]
async fn test_every_started_operation_has_exactly_one_terminal_event() {
    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&diamond_graph()).await;
    result.unwrap();

    for node in ["prepare", "left", "right", "join"] {
        assert_eq!(started_count(&events, node), 1, "node {node}");
        assert_eq!(terminal_count(&events, node), 1, "node {node}");
    }
}

#[tokio::test]
async fn test_dependencies_complete_before_dependents_start() {
    let harness = Harness::new(SchedulerConfig::default());
    let (result, events) = harness.run(&diamond_graph()).await;
    result.unwrap();

    for (dependency, dependent) in [
        ("prepare", "left"),
        ("prepare", "right"),
        ("left", "join"),
        ("right", "join"),
    ] {
        let finished = terminal_index(&events, dependency).unwrap();
        let started = started_index(&events, dependent).unwrap();
        assert!(
            finished < started,
            "{dependency} must finish (index {finished}) before {dependent} starts (index {started})"
        );
    }
}

#[tokio::test]
async fn test_one_manifest_per_target_platform() {
    let graph = BuildGraph {
        target_platforms: [Platform::linux_amd64(), Platform::linux_arm64()]
            .into_iter()
            .collect(),
        ..single_stage_graph()
    };
    let harness = Harness::new(SchedulerConfig::default());
    let (result, _) = harness.run(&graph).await;
    let result = result.unwrap();

    assert_eq!(result.manifests.len(), 2);
    let amd = &result.manifests[&Platform::linux_amd64()];
    let arm = &result.manifests[&Platform::linux_arm64()];
    // Per-platform base realization yields distinct filesystem identities.
    assert_ne!(amd.digest, arm.digest);
}

#[tokio::test]
async fn test_manifests_are_deterministic_across_runs() {
    let first = Harness::new(SchedulerConfig::default());
    let (a, _) = first.run(&diamond_graph()).await;

    let second = Harness::new(SchedulerConfig::default());
    let (b, _) = second.run(&diamond_graph()).await;

    let a = a.unwrap();
    let b = b.unwrap();
    let platform = Platform::linux_amd64();
    assert_eq!(a.manifests[&platform], b.manifests[&platform]);
}

#[tokio::test]
async fn test_priority_scheduling_parity() {
    let prioritized = Harness::new(SchedulerConfig::default().with_priority_scheduling(true));
    let (with_priority, _) = prioritized.run(&diamond_graph()).await;

    let declaration_order = Harness::new(SchedulerConfig::default().with_priority_scheduling(false));
    let (without_priority, _) = declaration_order.run(&diamond_graph()).await;

    let platform = Platform::linux_amd64();
    assert_eq!(
        with_priority.unwrap().manifests[&platform],
        without_priority.unwrap().manifests[&platform]
    );
}

#[tokio::test]
async fn test_work_stealing_parity_with_plain_spawns() {
    let stealing = Harness::new(SchedulerConfig::default().with_work_stealing(true));
    let (with_stealing, _) = stealing.run(&diamond_graph()).await;

    let plain = Harness::new(SchedulerConfig::default().with_work_stealing(false));
    let (without_stealing, _) = plain.run(&diamond_graph()).await;

    let platform = Platform::linux_amd64();
    assert_eq!(
        with_stealing.unwrap().manifests[&platform],
        without_stealing.unwrap().manifests[&platform]
    );
}

#[tokio::test]
async fn test_config_digest_tracks_metadata() {
    let with_label = BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("app", Operation::from_scratch()).with_node(BuildNode::new(
                "label",
                Operation::Metadata(crate::graph::MetadataOperation {
                    action: crate::graph::MetadataAction::Label {
                        key: "org.example.team".to_string(),
                        value: "infra".to_string(),
                    },
                    metadata: Default::default(),
                }),
            )),
        );
    let without_label = BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("app", Operation::from_scratch())
                .with_node(BuildNode::new("label", Operation::env("A", "B"))),
        );

    let platform = Platform::linux_amd64();
    let (labelled, _) = Harness::new(SchedulerConfig::default()).run(&with_label).await;
    let (plain, _) = Harness::new(SchedulerConfig::default()).run(&without_label).await;
    assert_ne!(
        labelled.unwrap().manifests[&platform].config_digest,
        plain.unwrap().manifests[&platform].config_digest
    );
}

#[tokio::test]
async fn test_metrics_account_for_operations_and_stages() {
    let harness = Harness::new(SchedulerConfig::default());
    let (result, _) = harness.run(&diamond_graph()).await;
    let result = result.unwrap();

    // Base plus four exec nodes.
    assert_eq!(result.metrics.operations_executed, 5);
    assert_eq!(result.metrics.cache_hits, 0);
    assert_eq!(result.metrics.retries, 0);
    assert_eq!(result.metrics.stages_completed, 1);
    assert!(result.metrics.stage_durations.contains_key("app@linux/amd64"));
    assert_eq!(result.logs.len(), 1);

    // The execution state's own counters agree.
    assert_eq!(harness.scheduler.state.operation_count(), 5);
    assert_eq!(harness.scheduler.state.cache_hits(), 0);
}

#[tokio::test]
async fn test_progress_reporting_can_be_disabled() {
    let harness = Harness::new(SchedulerConfig::default().with_progress_reporting(false));
    let (result, events) = harness.run(&single_stage_graph()).await;
    result.unwrap();
    assert!(events.is_empty());
}

/// Scheduler wired to the standard executor set over a scripted command
/// runner, for runner-boundary scenarios.
fn standard_scheduler(
    runner: Arc<crate::test_support::ScriptedCommandRunner>,
    reporter: Reporter,
) -> Scheduler {
    use crate::executor::CommandRunner;
    Scheduler::new(
        ExecutionDispatcher::standard(runner as Arc<dyn CommandRunner>),
        Arc::new(MemorySnapshotter::new()),
        Arc::new(MemoryCache::new()),
        reporter,
        SchedulerConfig::default(),
    )
}

fn run_graph(executable: &str, arguments: Vec<String>) -> BuildGraph {
    BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("app", Operation::from_scratch())
                .with_node(BuildNode::new("cmd", Operation::run(executable, arguments))),
        )
}

#[tokio::test]
async fn test_command_runner_failure_carries_log_tail_diagnostics() {
    let runner = Arc::new(crate::test_support::ScriptedCommandRunner::new());
    runner.fail_with(
        "make install",
        2,
        "make: *** no rule to make target 'install'",
    );

    let reporter = Reporter::new();
    let collector = EventCollector::attach(&reporter);
    let scheduler = standard_scheduler(Arc::clone(&runner), reporter.clone());

    let result = scheduler
        .execute(&run_graph("make", vec!["install".to_string()]))
        .await;
    reporter.finish();
    let events = collector.drain().await;

    match result {
        Err(Error::OperationFailed { description, source }) => {
            assert_eq!(description, "RUN make install");
            assert!(matches!(*source, Error::CommandFailed { status: 2, .. }));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(runner.invocation_count(), 1);

    // The failure event's diagnostics carry the stderr tail.
    assert!(events.iter().any(|e| matches!(
        e,
        BuildEvent::OperationFailed { diagnostics, .. }
            if diagnostics.get("log_tail").map(String::as_str)
                == Some("make: *** no rule to make target 'install'")
    )));
}

#[tokio::test]
async fn test_command_output_is_reported_as_logs() {
    use crate::executor::CommandOutput;

    let runner = Arc::new(crate::test_support::ScriptedCommandRunner::new());
    runner.respond(
        "cargo build",
        CommandOutput {
            stdout: "Compiling app v0.1.0\n".to_string(),
            stderr: String::new(),
            exit_status: 0,
        },
    );

    let reporter = Reporter::new();
    let collector = EventCollector::attach(&reporter);
    let scheduler = standard_scheduler(Arc::clone(&runner), reporter.clone());

    let result = scheduler
        .execute(&run_graph("cargo", vec!["build".to_string()]))
        .await;
    reporter.finish();
    let events = collector.drain().await;

    result.unwrap();
    assert_eq!(runner.invocation_count(), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        BuildEvent::OperationLog { context, message }
            if context.node_id == "cmd" && message == "Compiling app v0.1.0"
    )));
}

#[tokio::test]
async fn test_execute_is_exclusive_per_instance() {
    let harness = Harness::new(SchedulerConfig::default());
    harness
        .scripted
        .delay("RUN prepare", Duration::from_millis(300));
    let graph = diamond_graph();

    let scheduler = Arc::new(harness.scheduler);
    let first = {
        let scheduler = Arc::clone(&scheduler);
        let graph = graph.clone();
        tokio::spawn(async move { scheduler.execute(&graph).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = scheduler.execute(&graph).await;
    assert!(matches!(second, Err(Error::Internal(_))));

    first.await.unwrap().unwrap();
}
