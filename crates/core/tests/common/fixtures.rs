//! Pipeline specs, node configs and a hermetic multi-node network.

use dcp_core::computation::ComputationRegistry;
use dcp_core::network::bus::InMemoryBroker;
use dcp_core::state::manager::PipelineManager;
use dcp_protocol::config_models::{FileServerConfig, ManagerConfig, NodeRole, TransferConfig};
use dcp_protocol::pipeline_models::PipelineSpec;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// Two local steps: `{start: 1}` into `sum`, then step 0's `sum` into `sum` again.
#[allow(dead_code)]
pub fn two_step_sum_spec() -> PipelineSpec {
    serde_json::from_value(json!({
        "steps": [
            {
                "controller": { "type": "local" },
                "computations": [{ "meta": { "id": "sum" }, "computation": { "type": "mock" } }],
                "inputMap": { "start": { "value": 1 } }
            },
            {
                "controller": { "type": "local" },
                "computations": [{ "meta": { "id": "sum" }, "computation": { "type": "mock" } }],
                "inputMap": { "start": { "fromCache": { "step": 0, "variable": "sum" } } }
            }
        ]
    }))
    .expect("valid spec")
}

/// One local step driven by the `count` computation.
#[allow(dead_code)]
pub fn counting_spec(start: i64) -> PipelineSpec {
    serde_json::from_value(json!({
        "steps": [{
            "controller": { "type": "local" },
            "computations": [{ "meta": { "id": "count" }, "computation": { "type": "mock" } }],
            "inputMap": { "start": { "value": start } }
        }]
    }))
    .expect("valid spec")
}

/// One decentralized step driven by the `avg` computation.
#[allow(dead_code)]
pub fn averaging_spec(owner: Option<&str>, limit_output_to_owner: bool) -> PipelineSpec {
    serde_json::from_value(json!({
        "steps": [{
            "controller": { "type": "decentralized" },
            "computations": [{ "meta": { "id": "avg" }, "computation": { "type": "mock" } }],
            "inputMap": {}
        }],
        "owner": owner,
        "limitOutputToOwner": limit_output_to_owner
    }))
    .expect("valid spec")
}

/// Two decentralized steps: `avg`, then `total` seeded with step 0's `mean`.
#[allow(dead_code)]
pub fn averaged_total_spec() -> PipelineSpec {
    serde_json::from_value(json!({
        "steps": [
            {
                "controller": { "type": "decentralized" },
                "computations": [{ "meta": { "id": "avg" }, "computation": { "type": "mock" } }],
                "inputMap": {}
            },
            {
                "controller": { "type": "decentralized" },
                "computations": [{ "meta": { "id": "total" }, "computation": { "type": "mock" } }],
                "inputMap": { "start": { "fromCache": { "step": 0, "variable": "mean" } } }
            }
        ]
    }))
    .expect("valid spec")
}

fn fast_transfers() -> TransferConfig {
    TransferConfig {
        retry_base_delay_ms: 10,
        post_retry_limit: 3,
        get_retry_limit: 3,
        ..TransferConfig::default()
    }
}

/// Central node config whose file server binds an ephemeral loopback port.
#[allow(dead_code)]
pub fn central_config(root: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::new(NodeRole::Central, "central", root.to_path_buf());
    config.file_server = FileServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..FileServerConfig::default()
    };
    config.transfer = fast_transfers();
    config
}

/// Peer config pointing at a central file server on `port`.
#[allow(dead_code)]
pub fn peer_config(root: &Path, participant_id: &str, port: u16) -> ManagerConfig {
    let mut config = ManagerConfig::new(NodeRole::Peer, participant_id, root.to_path_buf());
    config.file_server = FileServerConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..FileServerConfig::default()
    };
    config.transfer = fast_transfers();
    config
}

/// A single peer-role node that only runs local steps.
#[allow(dead_code)]
pub async fn local_node(root: &Path, registry: ComputationRegistry) -> PipelineManager {
    let broker = InMemoryBroker::new();
    let (bus, incoming) = broker.connect();
    PipelineManager::with_bus(peer_config(root, "site-a", 0), registry, bus, incoming)
        .await
        .expect("local node")
}

/// A central node and its peers sharing one in-memory broker.
#[allow(dead_code)]
pub struct TestNetwork {
    pub broker: InMemoryBroker,
    pub central: PipelineManager,
    pub peers: Vec<PipelineManager>,
}

/// Start a central node and one peer per id, all under `root`.
///
/// Every node gets its own working directory: `root/central`, `root/{id}`.
#[allow(dead_code)]
pub async fn start_network(
    root: &Path,
    peer_ids: &[&str],
    central_registry: ComputationRegistry,
    peer_registry: impl Fn() -> ComputationRegistry,
) -> TestNetwork {
    let broker = InMemoryBroker::new();

    let (bus, incoming) = broker.connect();
    let central = PipelineManager::with_bus(central_config(&root.join("central")), central_registry, bus, incoming)
        .await
        .expect("central node");
    let port = central.file_server_addr().expect("file server is bound").port();

    let mut peers = Vec::new();
    for id in peer_ids {
        let (bus, incoming) = broker.connect();
        let peer = PipelineManager::with_bus(peer_config(&root.join(id), id, port), peer_registry(), bus, incoming)
            .await
            .expect("peer node");
        peers.push(peer);
    }

    TestNetwork {
        broker,
        central,
        peers,
    }
}

/// Poll until `manager` has forgotten every run.
#[allow(dead_code)]
pub async fn wait_until_idle(manager: &PipelineManager) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !manager.active_run_ids().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("node did not release its runs");
}
