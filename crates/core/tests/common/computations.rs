//! Deterministic mock computations.

use dcp_core::computation::adapters::MockComputation;
use dcp_core::computation::{ComputationError, ComputationOutput, ComputationRegistry, ComputationRequest};
use dcp_protocol::controller_models::ExecutionMode;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

/// `{start}` to `{sum: start + 1}`, converging at once.
#[allow(dead_code)]
pub fn sum_registry() -> ComputationRegistry {
    ComputationRegistry::new().with("sum", |_| {
        Arc::new(MockComputation::new(|request: &ComputationRequest| {
            let start = request.input["start"].as_i64().unwrap_or(0);
            Ok(ComputationOutput::new(json!({ "sum": start + 1 }), true))
        }))
    })
}

/// Counts from `{start}` one step per iteration and converges at `target`.
#[allow(dead_code)]
pub fn counter(target: i64) -> MockComputation {
    MockComputation::new(move |request: &ComputationRequest| {
        let n = request.input["n"]
            .as_i64()
            .or_else(|| request.input["start"].as_i64())
            .unwrap_or(0)
            + 1;
        Ok(ComputationOutput::new(json!({ "n": n }), n >= target))
    })
}

#[allow(dead_code)]
/// Seed value each peer contributes in the averaging scenario.
pub fn seed_of(client_id: &str) -> i64 {
    match client_id {
        "site-a" => 2,
        "site-b" => 4,
        _ => 0,
    }
}

#[allow(dead_code)]
/// Peer half of the averaging scenario.
///
/// Iteration 0 contributes the seed and writes `{client}.csv` for the central
/// node. Later iterations contribute `seed + mean` of the last round.
pub fn averaging_peer(request: &ComputationRequest) -> Result<ComputationOutput, ComputationError> {
    let client_id = request.state.client_id.as_str();
    let seed = seed_of(client_id);
    let local = match request.input["mean"].as_i64() {
        Some(mean) => seed + mean,
        None => {
            let path = Path::new(&request.state.transfer_directory).join(format!("{client_id}.csv"));
            std::fs::write(&path, format!("client,seed\n{client_id},{seed}\n"))
                .map_err(|e| ComputationError::ExecutionError(e.to_string()))?;
            seed
        }
    };
    Ok(ComputationOutput::new(json!({ "local": local }), false))
}

#[allow(dead_code)]
/// Central half of the averaging scenario.
///
/// Averages the peers' `local` values and converges on its second
/// invocation, when it also writes `result.txt` for every peer.
pub fn averaging_central(request: &ComputationRequest) -> Result<ComputationOutput, ComputationError> {
    let Value::Object(group) = &request.input else {
        return Err(ComputationError::ExecutionError("expected grouped input".to_string()));
    };
    let values: Vec<i64> = group.values().filter_map(|v| v["local"].as_i64()).collect();
    if values.is_empty() {
        return Err(ComputationError::ExecutionError("no peer values".to_string()));
    }
    let mean = values.iter().sum::<i64>() / values.len() as i64;

    let base = Path::new(&request.state.base_directory);
    let files_seen: Vec<String> = group
        .keys()
        .filter(|id| base.join(id.as_str()).join(format!("{id}.csv")).is_file())
        .cloned()
        .collect();

    let done = request.state.iteration >= 1;
    if done {
        let path = Path::new(&request.state.transfer_directory).join("result.txt");
        std::fs::write(&path, format!("mean={mean}\n"))
            .map_err(|e| ComputationError::ExecutionError(e.to_string()))?;
    }
    Ok(ComputationOutput::new(
        json!({ "mean": mean, "round": request.state.iteration, "filesSeen": files_seen }),
        done,
    ))
}

/// Registry serving `avg` with the half that matches the node's role.
#[allow(dead_code)]
pub fn averaging_registry() -> ComputationRegistry {
    ComputationRegistry::new().with("avg", |mode| match mode {
        ExecutionMode::Remote => Arc::new(MockComputation::new(averaging_central)),
        ExecutionMode::Local => Arc::new(MockComputation::new(averaging_peer)),
    })
}

/// Averaging registry whose peer half always fails.
#[allow(dead_code)]
pub fn failing_peer_registry(message: &'static str) -> ComputationRegistry {
    ComputationRegistry::new().with("avg", move |mode| match mode {
        ExecutionMode::Remote => Arc::new(MockComputation::new(averaging_central)),
        ExecutionMode::Local => Arc::new(MockComputation::failing(message)),
    })
}

#[allow(dead_code)]
/// Peer half of the totaling step: `{start}` shifted by the peer's seed.
pub fn shifting_peer(request: &ComputationRequest) -> Result<ComputationOutput, ComputationError> {
    let start = request.input["start"]
        .as_i64()
        .ok_or_else(|| ComputationError::ExecutionError("missing start".to_string()))?;
    let local = start + seed_of(&request.state.client_id);
    Ok(ComputationOutput::new(json!({ "local": local }), false))
}

#[allow(dead_code)]
/// Central half of the totaling step: sums the peers' `local` values and
/// converges at once.
pub fn totaling_central(request: &ComputationRequest) -> Result<ComputationOutput, ComputationError> {
    let Value::Object(group) = &request.input else {
        return Err(ComputationError::ExecutionError("expected grouped input".to_string()));
    };
    let total: i64 = group.values().filter_map(|v| v["local"].as_i64()).sum();
    Ok(ComputationOutput::new(
        json!({ "total": total, "round": request.state.iteration }),
        true,
    ))
}

/// Averaging registry that also serves `total` for a second step.
#[allow(dead_code)]
pub fn averaged_total_registry() -> ComputationRegistry {
    averaging_registry().with("total", |mode| match mode {
        ExecutionMode::Remote => Arc::new(MockComputation::new(totaling_central)),
        ExecutionMode::Local => Arc::new(MockComputation::new(shifting_peer)),
    })
}
