#![allow(dead_code)]

use async_trait::async_trait;
use statewalk::{
    InterruptFlag, NodeOutcome, Params, RunConfig, SchedulerError, TestExecutor, TestGraph,
    TestNode, load_graph_dot,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Executor double recording every node it was asked to run.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(String, Params)>>,
    failing: BTreeSet<String>,
    erroring: BTreeMap<String, SchedulerError>,
    interrupt_after: Option<(String, InterruptFlag)>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, shortname: &str) -> Self {
        self.failing.insert(shortname.to_string());
        self
    }

    pub fn erroring(mut self, shortname: &str, error: SchedulerError) -> Self {
        self.erroring.insert(shortname.to_string(), error);
        self
    }

    pub fn interrupting_after(mut self, shortname: &str, flag: InterruptFlag) -> Self {
        self.interrupt_after = Some((shortname.to_string(), flag));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls mutex")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn count(&self, shortname: &str) -> usize {
        self.names().iter().filter(|name| *name == shortname).count()
    }

    pub fn params_of(&self, shortname: &str) -> Option<Params> {
        self.calls
            .lock()
            .expect("calls mutex")
            .iter()
            .rev()
            .find(|(name, _)| name == shortname)
            .map(|(_, params)| params.clone())
    }
}

#[async_trait]
impl TestExecutor for RecordingExecutor {
    async fn execute(
        &self,
        node: &TestNode,
        _graph: &TestGraph,
    ) -> Result<NodeOutcome, SchedulerError> {
        let shortname = node.shortname().to_string();
        self.calls
            .lock()
            .expect("calls mutex")
            .push((shortname.clone(), node.params.clone()));

        if let Some(error) = self.erroring.get(&shortname) {
            return Err(error.clone());
        }
        if let Some((trigger, flag)) = self.interrupt_after.as_ref() {
            if *trigger == shortname {
                flag.interrupt();
            }
        }
        if self.failing.contains(&shortname) {
            return Ok(NodeOutcome::failure(format!("{shortname} failed")));
        }
        Ok(NodeOutcome::success())
    }
}

pub fn graph(source: &str) -> TestGraph {
    load_graph_dot(source).expect("fixture graph should load")
}

pub fn config(executor: &Arc<RecordingExecutor>) -> RunConfig {
    RunConfig {
        run_id: Some("test-run".to_string()),
        executor: executor.clone(),
        max_steps: Some(1_000),
        ..RunConfig::default()
    }
}
