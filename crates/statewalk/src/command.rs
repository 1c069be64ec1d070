use crate::{NodeOutcome, SchedulerError, TestExecutor, TestGraph, TestNode};
use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const COMMAND_PARAM: &str = "command";

/// Runs each test as a shell command.
///
/// The command comes from the node's `command` parameter, then the graph's,
/// then the executor default. The resolved parameters are passed as JSON on
/// stdin and a zero exit code is a pass.
#[derive(Clone, Debug, Default)]
pub struct CommandTestExecutor {
    default_command: Option<String>,
    timeout: Option<Duration>,
}

impl CommandTestExecutor {
    pub fn new(default_command: Option<String>) -> Self {
        Self {
            default_command,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn resolve_command(&self, node: &TestNode, graph: &TestGraph) -> Option<String> {
        node.params
            .get(COMMAND_PARAM)
            .or_else(|| graph.params.get(COMMAND_PARAM))
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .map(ToOwned::to_owned)
            .or_else(|| self.default_command.clone())
    }
}

#[async_trait]
impl TestExecutor for CommandTestExecutor {
    async fn execute(
        &self,
        node: &TestNode,
        graph: &TestGraph,
    ) -> Result<NodeOutcome, SchedulerError> {
        let Some(command) = self.resolve_command(node, graph) else {
            return Err(SchedulerError::Executor(format!(
                "no command configured for test {}",
                node.shortname()
            )));
        };
        debug!("Running {} via '{}'", node.shortname(), command);

        let payload = json!({
            "graph_id": graph.id,
            "name": node.name,
            "shortname": node.shortname(),
            "params": node.params.values(),
        })
        .to_string();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .env("STATEWALK_GRAPH_ID", &graph.id)
            .env("STATEWALK_NODE", &node.name)
            .env("STATEWALK_SHORTNAME", node.shortname())
            .env("STATEWALK_VMS", node.params.get_or("vms", ""))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                SchedulerError::Executor(format!("failed to launch test command: {error}"))
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(error) = stdin.write_all(payload.as_bytes()).await {
                // commands that ignore their parameters may exit before reading
                if error.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(SchedulerError::Executor(format!(
                        "failed writing test stdin payload: {error}"
                    )));
                }
            }
        }

        let output = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    return Ok(NodeOutcome::failure(format!(
                        "test command timed out after {}ms",
                        timeout.as_millis()
                    )));
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|error| {
            SchedulerError::Executor(format!("failed waiting for test command: {error}"))
        })?;

        let status_code = output.status.code().unwrap_or(1);
        if status_code == 0 {
            return Ok(NodeOutcome::success());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("test command exited with code {status_code}")
        } else {
            format!("test command exited with code {status_code}: {}", stderr.trim())
        };
        Ok(NodeOutcome::failure(message))
    }
}
