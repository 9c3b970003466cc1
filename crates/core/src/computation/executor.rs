//! Subprocess executor for computation units.
//!
//! This module spawns a computation process, feeds it its request on stdin
//! and parses its stdout as JSON Lines / NDJSON.

use crate::computation::base::{ComputationError, ComputationOutput};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

/// Subprocess executor shared by the process and docker adapters.
pub struct ProcessExecutor;

enum NextLine {
    Line(Option<String>),
    Stopped,
}

impl ProcessExecutor {
    /// Execute a command and parse its stdout as JSON Lines/NDJSON.
    ///
    /// # Arguments
    ///
    /// * `command` - The program to execute (e.g., "python3", "docker")
    /// * `args` - Command line arguments
    /// * `working_dir` - Working directory for the command
    /// * `stdin_payload` - Bytes written to the process's stdin before it is closed
    /// * `stop` - Notified to kill the process
    ///
    /// # Returns
    ///
    /// A stream of `serde_json::Value` objects, one per line of JSON output.
    /// Empty lines are filtered out. Lines that fail to parse yield
    /// `ComputationError::OutputParseError`. A non-zero exit status yields
    /// `ComputationError::Exited` carrying the captured stderr, and a stop
    /// yields `ComputationError::Stopped`.
    pub fn execute(
        command: String,
        args: Vec<String>,
        working_dir: PathBuf,
        stdin_payload: Vec<u8>,
        stop: Arc<Notify>,
    ) -> Pin<Box<dyn Stream<Item = Result<serde_json::Value, ComputationError>> + Send>> {
        let stream = async_stream::stream! {
            let mut cmd = Command::new(&command);
            cmd.args(&args);
            cmd.current_dir(&working_dir);
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            cmd.kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    yield Err(ComputationError::ExecutionError(format!(
                        "Failed to spawn command '{command}': {e}"
                    )));
                    return;
                }
            };

            // Feed stdin from its own task so a chatty child cannot block us.
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(&stdin_payload).await {
                        debug!("computation closed stdin early: {e}");
                    }
                    let _ = stdin.shutdown().await;
                });
            }

            let stderr_task = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut buffer = String::new();
                    let _ = stderr.read_to_string(&mut buffer).await;
                    buffer
                })
            });

            let stdout = match child.stdout.take() {
                Some(stdout) => stdout,
                None => {
                    yield Err(ComputationError::ExecutionError(
                        "Failed to capture stdout".to_string()
                    ));
                    return;
                }
            };

            let mut lines = BufReader::new(stdout).lines();

            loop {
                let next = tokio::select! {
                    line = lines.next_line() => NextLine::Line(line.ok().flatten()),
                    _ = stop.notified() => NextLine::Stopped,
                };

                let line = match next {
                    NextLine::Line(Some(line)) => line,
                    NextLine::Line(None) => break,
                    NextLine::Stopped => {
                        let _ = child.kill().await;
                        yield Err(ComputationError::Stopped);
                        return;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => {
                        yield Ok(value);
                    }
                    Err(e) => {
                        yield Err(ComputationError::OutputParseError(format!(
                            "Failed to parse JSON: {e} (line: {line})"
                        )));
                    }
                }
            }

            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    yield Err(ComputationError::ExecutionError(format!(
                        "Failed to wait for '{command}': {e}"
                    )));
                    return;
                }
            };

            if !status.success() {
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };
                yield Err(ComputationError::Exited {
                    status: status.to_string(),
                    stderr: stderr.trim().to_string(),
                });
            }
        };

        Box::pin(stream)
    }

    /// Drain an execution stream into the computation's final result.
    ///
    /// The last JSON object printed wins. Non-JSON lines are treated as
    /// log output and skipped.
    ///
    /// # Errors
    ///
    /// Returns the first execution error, or `OutputParseError` when no
    /// valid result object was printed.
    pub async fn collect_output(
        mut stream: Pin<Box<dyn Stream<Item = Result<serde_json::Value, ComputationError>> + Send>>,
    ) -> Result<ComputationOutput, ComputationError> {
        let mut last = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => last = Some(value),
                Err(ComputationError::OutputParseError(line)) => {
                    debug!("computation log: {line}");
                }
                Err(e) => return Err(e),
            }
        }

        let value = last.ok_or_else(|| {
            ComputationError::OutputParseError("Computation produced no output".to_string())
        })?;
        serde_json::from_value(value)
            .map_err(|e| ComputationError::OutputParseError(format!("Invalid computation result: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type ValueStream = Pin<Box<dyn Stream<Item = Result<serde_json::Value, ComputationError>> + Send>>;

    fn run(command: &str, args: &[&str], stdin: &str) -> ValueStream {
        ProcessExecutor::execute(
            command.to_string(),
            args.iter().map(|s| s.to_string()).collect(),
            PathBuf::from("."),
            stdin.as_bytes().to_vec(),
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn test_execute_echo_json() {
        let stream = run("echo", &[r#"{"type":"test","value":42}"#], "");

        let values: Vec<_> = stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .expect("Should parse JSON successfully");

        assert_eq!(values.len(), 1);
        assert_eq!(values[0].get("value").and_then(|v| v.as_i64()), Some(42));
    }

    #[tokio::test]
    async fn test_execute_reads_stdin() {
        let stream = run("cat", &[], "{\"input\":7}\n");

        let values: Vec<_> = stream.collect::<Vec<_>>().await;
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].as_ref().unwrap().get("input").and_then(|v| v.as_i64()),
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_execute_invalid_command() {
        let results: Vec<_> = run("nonexistent-command-xyz", &[], "").collect().await;

        assert_eq!(results.len(), 1);
        if let Err(ComputationError::ExecutionError(msg)) = &results[0] {
            assert!(msg.contains("Failed to spawn command"));
        } else {
            panic!("Expected ExecutionError");
        }
    }

    #[tokio::test]
    async fn test_execute_reports_exit_status_and_stderr() {
        let results: Vec<_> = run("sh", &["-c", "echo broken >&2; exit 3"], "")
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(ComputationError::Exited { stderr, .. }) => assert_eq!(stderr, "broken"),
            other => panic!("Expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_filters_empty_lines_and_flags_text() {
        let results: Vec<_> = run("sh", &["-c", "echo; echo '{\"num\":1}'; echo; echo progress"], "")
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ComputationError::OutputParseError(_))));
    }

    #[tokio::test]
    async fn test_collect_output_takes_last_result() {
        let stream = run(
            "sh",
            &["-c", "echo starting; echo '{\"output\":1}'; echo '{\"output\":2,\"success\":true}'"],
            "",
        );

        let output = ProcessExecutor::collect_output(stream).await.unwrap();
        assert_eq!(output.output, serde_json::json!(2));
        assert!(output.success);
    }

    #[tokio::test]
    async fn test_collect_output_requires_a_result() {
        let result = ProcessExecutor::collect_output(run("true", &[], "")).await;
        assert!(matches!(result, Err(ComputationError::OutputParseError(_))));
    }

    #[tokio::test]
    async fn test_execute_stops_on_notify() {
        let stop = Arc::new(Notify::new());
        let stream = ProcessExecutor::execute(
            "sleep".to_string(),
            vec!["30".to_string()],
            PathBuf::from("."),
            Vec::new(),
            Arc::clone(&stop),
        );

        stop.notify_one();
        let results: Vec<_> = stream.collect().await;
        assert_eq!(results, vec![Err(ComputationError::Stopped)]);
    }
}
