use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use regflow_engine::workflow::{InMemoryConfigSource, InMemoryExtractor};
use regflow_engine::{DependencyGraph, ReportRenderer, RunInfo, StepInput, StepOutput, StepStatus, WorkflowEngine};
use regflow_types::{Dataset, ReportConfig, StepKind, WorkflowDefinition, WorkflowStep};
use serde_json::{Map as JsonMap, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Started(String),
    Finished(String),
}

struct UnusedRenderer;

impl ReportRenderer for UnusedRenderer {
    fn render(&self, _: &ReportConfig, _: &Dataset, _: &RunInfo) -> anyhow::Result<std::path::PathBuf> {
        anyhow::bail!("rendering is not part of this workflow")
    }
}

fn diamond() -> WorkflowDefinition {
    let step = |id: &str| WorkflowStep::new(id, StepKind::Custom).with_config(json!({"handler": "jitter"}));
    WorkflowDefinition {
        workflow_id: "diamond".into(),
        report_id: "scheduling".into(),
        description: None,
        steps: vec![
            step("left"),
            step("right"),
            step("join").depends_on(["left", "right"]),
        ],
    }
}

fn engine(events: Arc<Mutex<Vec<Event>>>) -> WorkflowEngine {
    let report = ReportConfig {
        report_id: "scheduling".into(),
        ..Default::default()
    };
    WorkflowEngine::builder(
        Arc::new(InMemoryConfigSource::new().with_report(report).with_workflow(diamond())),
        Arc::new(InMemoryExtractor::new()),
        Arc::new(UnusedRenderer),
    )
    .pool_size(4)
    .register_step_handler(
        "jitter",
        Arc::new(move |input: &StepInput, _: &Value| -> anyhow::Result<StepOutput> {
            events.lock().expect("event log poisoned").push(Event::Started(input.step_id.clone()));
            let delay = rand::rng().random_range(0..15);
            std::thread::sleep(Duration::from_millis(delay));
            events.lock().expect("event log poisoned").push(Event::Finished(input.step_id.clone()));
            Ok(StepOutput::Value(json!({ "delay_ms": delay })))
        }),
    )
    .build()
}

/// Six independent steps that record how many of them run at the same time.
fn gauged_engine(pool_size: usize, peak: Arc<AtomicUsize>) -> WorkflowEngine {
    let steps = (0..6)
        .map(|index| WorkflowStep::new(format!("gauge_{index}"), StepKind::Custom).with_config(json!({"handler": "gauge"})))
        .collect();
    let workflow = WorkflowDefinition {
        workflow_id: "wide".into(),
        report_id: "scheduling".into(),
        description: None,
        steps,
    };
    let report = ReportConfig {
        report_id: "scheduling".into(),
        ..Default::default()
    };
    let running = Arc::new(AtomicUsize::new(0));
    WorkflowEngine::builder(
        Arc::new(InMemoryConfigSource::new().with_report(report).with_workflow(workflow)),
        Arc::new(InMemoryExtractor::new()),
        Arc::new(UnusedRenderer),
    )
    .pool_size(pool_size)
    .register_step_handler(
        "gauge",
        Arc::new(move |_: &StepInput, _: &Value| -> anyhow::Result<StepOutput> {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(StepOutput::Value(json!({ "running": now })))
        }),
    )
    .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_size_bounds_concurrent_steps() {
    for pool_size in [1, 2, 3] {
        let peak = Arc::new(AtomicUsize::new(0));
        let engine = gauged_engine(pool_size, peak.clone());
        let context = engine.execute_workflow("wide", JsonMap::new()).await.expect("run succeeds");
        assert_eq!(context.count_with_status(StepStatus::Succeeded), 6);
        assert_eq!(context.levels.len(), 1);
        assert_eq!(peak.load(Ordering::SeqCst), pool_size, "pool of {pool_size}");
    }
}

fn position(events: &[Event], event: &Event) -> usize {
    events.iter().position(|candidate| candidate == event).expect("event recorded")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependent_step_waits_for_both_independent_steps() {
    for _ in 0..25 {
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = engine(events.clone());
        let context = engine.execute_workflow("diamond", JsonMap::new()).await.expect("run succeeds");
        assert_eq!(context.count_with_status(StepStatus::Succeeded), 3);

        let events = events.lock().expect("event log poisoned").clone();
        let join_started = position(&events, &Event::Started("join".into()));
        assert!(position(&events, &Event::Finished("left".into())) < join_started, "{events:?}");
        assert!(position(&events, &Event::Finished("right".into())) < join_started, "{events:?}");

        let join = context.step("join").expect("join record");
        for upstream in ["left", "right"] {
            let record = context.step(upstream).expect("upstream record");
            assert!(record.finished_at <= join.started_at);
        }
    }
}

#[test]
fn random_acyclic_graphs_level_correctly() {
    let mut rng = rand::rng();
    for _ in 0..50 {
        let count = rng.random_range(1..12);
        let ids: Vec<String> = (0..count).map(|index| format!("s{index}")).collect();
        let mut graph = DependencyGraph::new();
        let mut edges = Vec::new();
        for id in &ids {
            graph.add_step(id.clone());
        }
        // Edges only point forward in index order, so the graph is acyclic.
        for from in 0..count {
            for to in (from + 1)..count {
                if rng.random_bool(0.3) {
                    graph.add_dependency(ids[from].clone(), ids[to].clone());
                    edges.push((from, to));
                }
            }
        }

        let levels = graph.compute_levels().expect("acyclic");
        let mut level_of = vec![usize::MAX; count];
        for (level, step_ids) in levels.iter().enumerate() {
            for step_id in step_ids {
                let index: usize = step_id[1..].parse().expect("index");
                assert_eq!(level_of[index], usize::MAX, "{step_id} placed twice");
                level_of[index] = level;
            }
        }
        assert!(level_of.iter().all(|level| *level != usize::MAX));
        for (from, to) in edges {
            assert!(level_of[from] < level_of[to]);
        }
    }
}
