use crate::{
    LayeredParamProvider, Progress, RuntimeEventSink, SchedulerError, SharedParamProvider,
    TestGraph, TestNode,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Fail,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub notes: Option<String>,
}

impl NodeOutcome {
    pub fn success() -> Self {
        Self {
            status: NodeStatus::Success,
            notes: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Fail,
            notes: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

/// Runs the body of one test node: a graph node or a synthesized setup task.
///
/// Returning `Err(SchedulerError::Interrupted)` aborts the traversal; any other
/// error is recorded as a failed outcome.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &TestNode,
        graph: &TestGraph,
    ) -> Result<NodeOutcome, SchedulerError>;
}

#[derive(Debug, Default)]
pub struct NoopTestExecutor;

#[async_trait]
impl TestExecutor for NoopTestExecutor {
    async fn execute(
        &self,
        _node: &TestNode,
        _graph: &TestGraph,
    ) -> Result<NodeOutcome, SchedulerError> {
        Ok(NodeOutcome::success())
    }
}

#[derive(Clone, Debug, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    /// Override lines appended to every resolved node and task.
    pub param_str: String,
    pub logs_root: Option<PathBuf>,
    pub executor: Arc<dyn TestExecutor>,
    pub params: SharedParamProvider,
    pub events: RuntimeEventSink,
    pub interrupt: InterruptFlag,
    pub max_steps: Option<u64>,
    pub visualize_steps: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            param_str: String::new(),
            logs_root: None,
            executor: Arc::new(NoopTestExecutor),
            params: Arc::new(LayeredParamProvider),
            events: RuntimeEventSink::default(),
            interrupt: InterruptFlag::new(),
            max_steps: None,
            visualize_steps: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    Completed,
    Interrupted,
    TestsFailed,
}

impl OutcomeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::TestsFailed => "tests_failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraversalResult {
    pub run_id: String,
    pub tags: BTreeSet<OutcomeTag>,
    /// Graph nodes not scheduled to run, counted once after the scan.
    pub cancelled: usize,
    /// Executed node bodies and setup tasks, in execution order.
    pub executed: Vec<String>,
    pub failed: Vec<String>,
    /// Forced-unset tasks run during cleanup.
    pub cleaned: Vec<String>,
    pub progress: Progress,
}

impl TraversalResult {
    pub fn is_interrupted(&self) -> bool {
        self.tags.contains(&OutcomeTag::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_clones_expected_shared_state() {
        let flag = InterruptFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_interrupted());
        handle.interrupt();
        assert!(flag.is_interrupted());
    }

    #[test]
    fn outcome_tags_expected_snake_case_json() {
        let tags: BTreeSet<OutcomeTag> = [OutcomeTag::TestsFailed, OutcomeTag::Interrupted]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&tags).expect("tags should serialize");
        assert_eq!(json, r#"["interrupted","tests_failed"]"#);
    }
}
