//! A central node and two peers over an in-memory broker and a loopback
//! file server.

mod common;

use common::*;
use dcp_core::network::bus::{publish_json, MessageBus, Qos};
use dcp_core::network::central::OWNER_ONLY_MESSAGE;
use dcp_core::{PipelineError, StartPipelineOptions};
use serde_json::json;
use std::time::Duration;

const PEERS: [&str; 2] = ["site-a", "site-b"];

fn central_options(run_id: &str, owner: Option<&str>, limit: bool) -> StartPipelineOptions {
    StartPipelineOptions::new(averaging_spec(owner, limit), run_id)
        .with_client("site-a", "Site A")
        .with_client("site-b", "Site B")
}

#[tokio::test]
async fn test_run_converges_and_exchanges_files() {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path();
    let network = start_network(root, &PEERS, averaging_registry(), averaging_registry).await;

    let mut central = network
        .central
        .start_pipeline(central_options("run-1", None, false))
        .await
        .unwrap();
    let mut peers = Vec::new();
    for peer in &network.peers {
        peers.push(
            peer.start_pipeline(StartPipelineOptions::new(averaging_spec(None, false), "run-1"))
                .await
                .unwrap(),
        );
    }

    let events = collect_events(&mut central.events).await;
    let expected = json!({ "mean": 6, "round": 1, "filesSeen": ["site-a", "site-b"] });
    assert_eq!(central.result().await.unwrap(), expected);
    for peer in peers {
        assert_eq!(peer.result().await.unwrap(), expected);
    }

    assert_event_sequence(&events);
    assert!(was_waiting_on(&events, "site-a"));
    assert!(was_waiting_on(&events, "site-b"));

    // Peer files were unpacked on the central node.
    let central_input = root.join("central/input/central/run-1");
    assert!(central_input.join("site-a/site-a.csv").is_file());
    assert!(central_input.join("site-b/site-b.csv").is_file());

    // Final files reached every peer's output directory.
    for id in PEERS {
        let result = root.join(id).join("output").join(id).join("run-1/result.txt");
        assert_eq!(std::fs::read_to_string(result).unwrap(), "mean=6\n");
    }

    // The central node keeps the run until both peers fetched the final files.
    wait_until_idle(&network.central).await;
    assert!(!root.join("central/system/central/run-1").exists());
    for peer in &network.peers {
        wait_until_idle(peer).await;
    }
}

#[tokio::test]
async fn test_every_node_runs_the_steps_in_order() {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path();
    let network = start_network(root, &PEERS, averaged_total_registry(), averaged_total_registry).await;

    let central = network
        .central
        .start_pipeline(
            StartPipelineOptions::new(averaged_total_spec(), "run-1")
                .with_client("site-a", "Site A")
                .with_client("site-b", "Site B"),
        )
        .await
        .unwrap();
    let mut peers = Vec::new();
    for peer in &network.peers {
        peers.push(
            peer.start_pipeline(StartPipelineOptions::new(averaged_total_spec(), "run-1"))
                .await
                .unwrap(),
        );
    }

    // Step 0 averages to 6, step 1 totals 6 + 2 and 6 + 4 in a single round.
    let expected = json!({ "total": 18, "round": 0 });
    let output = tokio::time::timeout(Duration::from_secs(10), central.result())
        .await
        .expect("second step never completed")
        .unwrap();
    assert_eq!(output, expected);
    for peer in peers {
        assert_eq!(peer.result().await.unwrap(), expected);
    }

    // The first step's final files still reached the peers.
    for id in PEERS {
        let result = root.join(id).join("output").join(id).join("run-1/result.txt");
        assert_eq!(std::fs::read_to_string(result).unwrap(), "mean=6\n");
    }

    wait_until_idle(&network.central).await;
    for peer in &network.peers {
        wait_until_idle(peer).await;
    }
}

#[tokio::test]
async fn test_output_is_limited_to_owner() {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path();
    let network = start_network(root, &PEERS, averaging_registry(), averaging_registry).await;

    let central = network
        .central
        .start_pipeline(central_options("run-1", Some("site-a"), true))
        .await
        .unwrap();
    let site_a = network.peers[0]
        .start_pipeline(StartPipelineOptions::new(averaging_spec(Some("site-a"), true), "run-1"))
        .await
        .unwrap();
    let site_b = network.peers[1]
        .start_pipeline(StartPipelineOptions::new(averaging_spec(Some("site-a"), true), "run-1"))
        .await
        .unwrap();

    let expected = json!({ "mean": 6, "round": 1, "filesSeen": ["site-a", "site-b"] });
    assert_eq!(central.result().await.unwrap(), expected);
    assert_eq!(site_a.result().await.unwrap(), expected);
    assert_eq!(
        site_b.result().await.unwrap(),
        json!({ "message": OWNER_ONLY_MESSAGE })
    );

    assert!(root.join("site-a/output/site-a/run-1/result.txt").is_file());
    assert!(!root.join("site-b/output/site-b/run-1/result.txt").exists());

    // Only the owner's acknowledgement is needed to release the run.
    wait_until_idle(&network.central).await;
}

#[tokio::test]
async fn test_peer_failure_fails_every_participant() {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path();
    let network = start_network(root, &["site-a"], averaging_registry(), averaging_registry).await;

    // site-b is wired by hand so it can run a failing computation.
    let port = network.central.file_server_addr().unwrap().port();
    let (bus, incoming) = network.broker.connect();
    let site_b = dcp_core::PipelineManager::with_bus(
        peer_config(&root.join("site-b"), "site-b", port),
        failing_peer_registry("out of memory"),
        bus,
        incoming,
    )
    .await
    .unwrap();

    let mut central = network
        .central
        .start_pipeline(central_options("run-1", None, false))
        .await
        .unwrap();
    let site_a = network.peers[0]
        .start_pipeline(StartPipelineOptions::new(averaging_spec(None, false), "run-1"))
        .await
        .unwrap();
    let failing = site_b
        .start_pipeline(StartPipelineOptions::new(averaging_spec(None, false), "run-1"))
        .await
        .unwrap();

    let events = collect_events(&mut central.events).await;
    let central_error = central.result().await.unwrap_err();
    let site_a_error = site_a.result().await.unwrap_err();
    let site_b_error = failing.result().await.unwrap_err();

    for error in [&central_error, &site_a_error] {
        let message = error.to_string();
        assert!(message.contains("Pipeline error from pipeline run-1 user: Site B"), "{message}");
        assert!(message.contains("out of memory"), "{message}");
    }
    assert!(matches!(site_b_error, PipelineError::Remote(_)));
    assert!(matches!(
        events.last(),
        Some(dcp_protocol::ipc::Event::RunFailed { .. })
    ));

    wait_until_idle(&network.central).await;
    wait_until_idle(&network.peers[0]).await;
    wait_until_idle(&site_b).await;
}

#[tokio::test]
async fn test_stale_and_duplicate_messages_are_ignored() {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path();
    let network = start_network(root, &["site-a"], averaging_registry(), averaging_registry).await;

    let started = network
        .central
        .start_pipeline(
            StartPipelineOptions::new(averaging_spec(None, false), "run-1")
                .with_client("site-a", "Site A")
                .with_client("site-b", "Site B"),
        )
        .await
        .unwrap();
    let site_a = network.peers[0]
        .start_pipeline(StartPipelineOptions::new(averaging_spec(None, false), "run-1"))
        .await
        .unwrap();

    // Only site-b is missing once site-a has delivered its first result.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if network.central.waiting_on_for_run("run-1").unwrap() == ["site-b"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // A replayed site-a result and a site-b result from the future change nothing.
    let (impostor, _rx) = network.broker.connect();
    for (id, iteration) in [("site-a", 1), ("site-b", 5)] {
        publish_json(
            impostor.as_ref(),
            "run",
            &json!({ "id": id, "runId": "run-1", "output": { "local": 100 }, "iteration": iteration }),
            Qos::AtLeastOnce,
        )
        .await
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(network.central.waiting_on_for_run("run-1").unwrap(), ["site-b"]);

    // Answer for site-b from here on, then deliver its real first result
    // twice. The copy is dropped and the barrier opens once.
    let (impostor_b, mut rx_b) = network.broker.connect();
    impostor_b.subscribe("site-b-run").await.unwrap();
    let responder = tokio::spawn(async move {
        while let Some(message) = rx_b.recv().await {
            let body: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
            if body["success"] == json!(true) || body.get("error").is_some() {
                return body;
            }
            let mean = body["output"]["mean"].as_i64().unwrap();
            let next = body["iteration"].as_u64().unwrap() + 1;
            publish_json(
                impostor_b.as_ref(),
                "run",
                &json!({ "id": "site-b", "runId": "run-1", "output": { "local": 4 + mean }, "iteration": next }),
                Qos::AtLeastOnce,
            )
            .await
            .unwrap();
        }
        serde_json::Value::Null
    });

    for _ in 0..2 {
        publish_json(
            impostor.as_ref(),
            "run",
            &json!({ "id": "site-b", "runId": "run-1", "output": { "local": 4 }, "iteration": 1 }),
            Qos::AtLeastOnce,
        )
        .await
        .unwrap();
    }

    let output = started.result().await.unwrap();
    assert_eq!(output["mean"], 6);
    assert_eq!(output["round"], 1);
    assert_eq!(site_a.result().await.unwrap(), output);
    let last = responder.await.unwrap();
    assert_eq!(last["success"], true);
    assert_eq!(last["output"], output);
}
