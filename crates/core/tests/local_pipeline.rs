//! Local multi-step pipelines on a single node.

mod common;

use common::*;
use dcp_core::computation::adapters::MockComputation;
use dcp_core::computation::ComputationRegistry;
use dcp_core::PipelineError;
use dcp_protocol::ipc::Event;
use dcp_protocol::pipeline_models::PipelineSpec;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_two_step_sum_uses_cached_output() {
    let temp_dir = tempfile::tempdir().unwrap();
    let node = local_node(temp_dir.path(), sum_registry()).await;

    let mut started = node
        .start_pipeline(dcp_core::StartPipelineOptions::new(two_step_sum_spec(), "run-1"))
        .await
        .unwrap();
    let events = collect_events(&mut started.events).await;
    let output = started.result().await.unwrap();

    assert_eq!(output, json!({ "sum": 3 }));
    assert_event_sequence(&events);
    assert!(matches!(&events[0], Event::RunStarted { total_steps: 2, .. }));
    assert!(matches!(
        events.last(),
        Some(Event::RunCompleted { output, .. }) if *output == json!({ "sum": 3 })
    ));
}

#[tokio::test]
async fn test_two_step_sum_is_deterministic() {
    let temp_dir = tempfile::tempdir().unwrap();
    let node = local_node(temp_dir.path(), sum_registry()).await;

    for run_id in ["run-1", "run-2", "run-3"] {
        let started = node
            .start_pipeline(dcp_core::StartPipelineOptions::new(two_step_sum_spec(), run_id))
            .await
            .unwrap();
        assert_eq!(started.result().await.unwrap(), json!({ "sum": 3 }));
    }
    assert!(node.active_run_ids().is_empty());
}

#[tokio::test]
async fn test_local_iterations_run_until_convergence() {
    let temp_dir = tempfile::tempdir().unwrap();
    let counter = counter(4);
    let shared = counter.clone();
    let registry = ComputationRegistry::new().with("count", move |_| Arc::new(shared.clone()));
    let node = local_node(temp_dir.path(), registry).await;

    let started = node
        .start_pipeline(dcp_core::StartPipelineOptions::new(counting_spec(0), "run-1"))
        .await
        .unwrap();

    assert_eq!(started.result().await.unwrap(), json!({ "n": 4 }));
    assert_eq!(counter.invocations(), 4);
}

#[tokio::test]
async fn test_local_computation_error_is_fatal() {
    let temp_dir = tempfile::tempdir().unwrap();
    let registry = ComputationRegistry::new().with("sum", |_| Arc::new(MockComputation::failing("disk full")));
    let node = local_node(temp_dir.path(), registry).await;

    let mut started = node
        .start_pipeline(dcp_core::StartPipelineOptions::new(two_step_sum_spec(), "run-1"))
        .await
        .unwrap();
    let events = collect_events(&mut started.events).await;
    let error = started.result().await.unwrap_err();

    assert!(matches!(error, PipelineError::Computation { .. }));
    assert!(error.to_string().contains("disk full"));
    assert!(matches!(
        events.last(),
        Some(Event::RunFailed { error, .. }) if error.input == Some(json!({ "start": 1 }))
    ));
    assert!(node.active_run_ids().is_empty());
    assert!(!temp_dir.path().join("transfer/site-a/run-1").exists());
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_before_start() {
    let temp_dir = tempfile::tempdir().unwrap();
    let node = local_node(temp_dir.path(), sum_registry()).await;
    let spec: PipelineSpec = serde_json::from_value(json!({ "steps": [] })).unwrap();

    let result = node
        .start_pipeline(dcp_core::StartPipelineOptions::new(spec, "run-1"))
        .await;

    assert!(matches!(result, Err(PipelineError::InvalidSpec(_))));
    assert!(node.active_run_ids().is_empty());
}
