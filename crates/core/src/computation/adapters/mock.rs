//! Mock computation implementation for testing.

use crate::computation::base::{
    Computation, ComputationError, ComputationOutput, ComputationRequest, ExecutionContext,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Handler =
    dyn Fn(&ComputationRequest) -> Result<ComputationOutput, ComputationError> + Send + Sync;

#[derive(Clone)]
pub struct MockComputation {
    available: bool,
    handler: Arc<Handler>,
    delay: Option<Duration>,
    invocations: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

impl MockComputation {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ComputationRequest) -> Result<ComputationOutput, ComputationError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            available: true,
            handler: Arc::new(handler),
            delay: None,
            invocations: Arc::new(AtomicUsize::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Converges on the first invocation with `output`.
    pub fn success(output: Value) -> Self {
        Self::new(move |_| Ok(ComputationOutput::new(output.clone(), true)))
    }

    pub fn unavailable() -> Self {
        let mut mock = Self::new(|_| Err(ComputationError::NotAvailable("Mock computation not available".to_string())));
        mock.available = false;
        mock
    }

    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_| Err(ComputationError::ExecutionError(message.clone())))
    }

    /// Sleep before answering each invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Computation for MockComputation {
    async fn check_availability(&self) -> bool {
        self.available
    }

    async fn start(
        &self,
        request: ComputationRequest,
        _context: &ExecutionContext,
    ) -> Result<ComputationOutput, ComputationError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&request)
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::run::RunDirectories;
    use dcp_protocol::controller_models::ExecutionMode;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn create_test_context() -> ExecutionContext {
        ExecutionContext::new(
            "run-1",
            "site-a",
            ExecutionMode::Local,
            RunDirectories::for_participant(Path::new("/work"), "site-a", "run-1"),
        )
    }

    #[tokio::test]
    async fn test_mock_computation_success() {
        let computation = MockComputation::success(json!({ "sum": 2 }));
        assert!(computation.check_availability().await);

        let context = create_test_context();
        let request = ComputationRequest::new(Value::Null, BTreeMap::new(), &context);
        let output = computation.start(request, &context).await.unwrap();

        assert_eq!(output.output, json!({ "sum": 2 }));
        assert!(output.success);
        assert_eq!(computation.invocations(), 1);
    }

    #[tokio::test]
    async fn test_mock_computation_failing() {
        let computation = MockComputation::failing("Mock failure");
        let context = create_test_context();
        let request = ComputationRequest::new(Value::Null, BTreeMap::new(), &context);

        let result = computation.start(request, &context).await;
        assert_eq!(
            result,
            Err(ComputationError::ExecutionError("Mock failure".to_string()))
        );
    }

    #[tokio::test]
    async fn test_mock_computation_unavailable() {
        let computation = MockComputation::unavailable();
        assert!(!computation.check_availability().await);
    }

    #[tokio::test]
    async fn test_mock_computation_records_stop() {
        let computation = MockComputation::success(Value::Null);
        let clone = computation.clone();
        clone.stop().await;
        assert!(computation.was_stopped());
    }
}
