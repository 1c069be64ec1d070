use crate::events::EventEmitter;
use crate::{
    CREATE_NODE_PATTERN, INSTALL_NODE_PATTERN, InstallMethod, NodeEvent, NodeId, NodeKind,
    NodeOutcome, NodeStatus, ObjectId, OutcomeTag, ProgressEvent, RunConfig, RuntimeEventKind,
    SETUP_LIST_FILE_NAME, SchedulerError, SetupTask, TRAVERSE_DIR_NAME, TaskEvent, TestDescriptor,
    TestGraph, TestNode, TraversalEvent, TraversalResult, UNKNOWN_STATE, create_param_str,
    install_task_name, load_setup_list, preinstall_task_name, task_node, unset_task_name,
    write_snapshot, DEFAULT_INSTALL_METHOD,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct TraversalRunner;

impl TraversalRunner {
    /// Runs every test whose obligations are unmet, in dependency order,
    /// reusing setup states and cleaning up after the last dependent.
    ///
    /// Interruption is reported through the result tags, every other error
    /// aborts the run.
    pub async fn run(
        &self,
        graph: &mut TestGraph,
        mut config: RunConfig,
    ) -> Result<TraversalResult, SchedulerError> {
        let run_id = config
            .run_id
            .take()
            .unwrap_or_else(|| format!("{}-run", graph.id));

        if let Some(logs_root) = config.logs_root.as_ref() {
            write_snapshot(graph, logs_root, &run_id, 0)?;
        }

        let mut traversal = Traversal {
            graph,
            events: EventEmitter::new(config.events.clone()),
            config,
            run_id,
            ledger: RunLedger::default(),
        };
        traversal.events.emit(RuntimeEventKind::Traversal(TraversalEvent::Started {
            run_id: traversal.run_id.clone(),
            graph_id: traversal.graph.id.clone(),
            node_count: traversal.graph.node_count(),
        }));

        let mut tags = BTreeSet::new();
        match traversal.traverse().await {
            Ok(()) => {
                tags.insert(OutcomeTag::Completed);
                traversal.events.emit(RuntimeEventKind::Traversal(TraversalEvent::Completed {
                    run_id: traversal.run_id.clone(),
                    graph_id: traversal.graph.id.clone(),
                    executed: traversal.ledger.executed.len(),
                    failed: traversal.ledger.failed.len(),
                }));
            }
            Err(SchedulerError::Interrupted) => {
                warn!("Traversal {} interrupted", traversal.run_id);
                tags.insert(OutcomeTag::Interrupted);
                traversal.events.emit(RuntimeEventKind::Traversal(TraversalEvent::Interrupted {
                    run_id: traversal.run_id.clone(),
                    graph_id: traversal.graph.id.clone(),
                }));
            }
            Err(error) => {
                traversal.events.emit(RuntimeEventKind::Traversal(TraversalEvent::Failed {
                    run_id: traversal.run_id.clone(),
                    graph_id: traversal.graph.id.clone(),
                    reason: error.to_string(),
                }));
                return Err(error);
            }
        }
        if !traversal.ledger.failed.is_empty() {
            tags.insert(OutcomeTag::TestsFailed);
        }

        let progress = traversal.graph.progress();
        let Traversal { run_id, ledger, .. } = traversal;
        Ok(TraversalResult {
            run_id,
            tags,
            cancelled: ledger.cancelled,
            executed: ledger.executed,
            failed: ledger.failed,
            cleaned: ledger.cleaned,
            progress,
        })
    }

    /// Checks that `descriptors` describe the graph node for node before
    /// running it.
    pub async fn run_suite(
        &self,
        graph: &mut TestGraph,
        descriptors: &[TestDescriptor],
        config: RunConfig,
    ) -> Result<TraversalResult, SchedulerError> {
        graph.verify_descriptors(descriptors)?;
        self.run(graph, config).await
    }
}

#[derive(Debug, Default)]
struct RunLedger {
    cancelled: usize,
    executed: Vec<String>,
    failed: Vec<String>,
    cleaned: Vec<String>,
}

struct Traversal<'a> {
    graph: &'a mut TestGraph,
    config: RunConfig,
    run_id: String,
    events: EventEmitter,
    ledger: RunLedger,
}

impl Traversal<'_> {
    /// Priority DFS over an explicit path: setups first, then the node
    /// itself, then one child at a time.
    async fn traverse(&mut self) -> Result<(), SchedulerError> {
        let root = self.graph.shared_root()?;
        let traverse_dir = self.traverse_dir();

        let mut path = vec![root];
        let mut step = 0u64;
        while !self.graph.node(root).is_cleanup_ready() {
            if self.config.interrupt.is_interrupted() {
                return Err(SchedulerError::Interrupted);
            }
            step += 1;
            if let Some(max_steps) = self.config.max_steps {
                if step > max_steps {
                    return Err(SchedulerError::StepLimitExceeded(max_steps));
                }
            }

            let next = *path
                .last()
                .ok_or_else(|| SchedulerError::invariant("empty traversal path"))?;
            if path.len() == 1 {
                path.push(self.next_child(next)?);
                continue;
            }
            let previous = path[path.len() - 2];

            let node = self.graph.node(next);
            debug!(
                "At test node {} which is {}ready with setup, {}ready with cleanup, \
                 should {}run, and should {}be cleaned",
                node.shortname(),
                if node.is_setup_ready() { "" } else { "not " },
                if node.is_cleanup_ready() { "" } else { "not " },
                if node.should_run { "" } else { "not " },
                if node.should_clean { "" } else { "not " }
            );
            debug!("Current traverse path/stack:\n{}", self.describe_path(&path));

            if node.cleanup_nodes().contains(&previous) {
                // reversed path looking for a setup of the previous node
                if node.is_setup_ready() {
                    self.traverse_test_node(next).await?;
                    self.graph.visit(previous, next)?;
                    path.pop();
                } else {
                    path.push(self.next_parent(next)?);
                }
            } else if node.setup_nodes().contains(&previous) {
                // parents have higher priority than children
                if !node.is_setup_ready() {
                    path.push(self.next_parent(next)?);
                    continue;
                }
                self.traverse_test_node(next).await?;

                if self.graph.node(next).is_cleanup_ready() {
                    self.reverse_test_node(next).await?;
                    let setups: Vec<NodeId> = self
                        .graph
                        .node(next)
                        .visited_setup_nodes()
                        .iter()
                        .copied()
                        .collect();
                    for setup in setups {
                        self.graph.visit(setup, next)?;
                    }
                    path.pop();
                    let progress = self.graph.report_progress();
                    self.events
                        .emit(RuntimeEventKind::Progress(ProgressEvent::Reported {
                            run_id: self.run_id.clone(),
                            finished: progress.finished,
                            total: progress.total,
                        }));
                } else {
                    path.push(self.next_child(next)?);
                }
            } else {
                return Err(SchedulerError::invariant(format!(
                    "discontinuous path in the test dependency graph detected at {}",
                    node.shortname()
                )));
            }

            if let Some(traverse_dir) = traverse_dir.as_ref() {
                write_snapshot(self.graph, traverse_dir, &self.run_id, step)?;
            }
        }
        Ok(())
    }

    fn traverse_dir(&self) -> Option<PathBuf> {
        if !self.config.visualize_steps {
            return None;
        }
        self.config
            .logs_root
            .as_ref()
            .map(|logs_root| logs_root.join(TRAVERSE_DIR_NAME))
    }

    fn describe_path(&self, path: &[NodeId]) -> String {
        path.iter()
            .map(|id| self.graph.node(*id).shortname())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn next_parent(&self, id: NodeId) -> Result<NodeId, SchedulerError> {
        let node = self.graph.node(id);
        node.next_unvisited_setup().ok_or_else(|| {
            SchedulerError::invariant(format!(
                "test node {} has no unvisited setup left",
                node.shortname()
            ))
        })
    }

    fn next_child(&self, id: NodeId) -> Result<NodeId, SchedulerError> {
        let node = self.graph.node(id);
        node.next_unvisited_cleanup().ok_or_else(|| {
            SchedulerError::invariant(format!(
                "test node {} has no unvisited dependent left",
                node.shortname()
            ))
        })
    }

    /// Runs a single node according to its flags and the current states.
    async fn traverse_test_node(&mut self, id: NodeId) -> Result<(), SchedulerError> {
        // ephemeral setup can get lost and if so must be repeated
        let node = self.graph.node(id);
        if !node.should_run && !node.is_cleanup_ready() && self.graph.is_ephemeral(id) {
            let switched = node.objects.iter().find_map(|object_id| {
                let object = self.graph.object(*object_id);
                let set_state = node.params.object_params(&object.name).get("set_state").map(str::to_string);
                // an unknown previous state is trusted to be the expected one
                (set_state.as_deref() != Some(object.current_state.as_str())
                    && object.current_state != UNKNOWN_STATE)
                    .then(|| (object.name.clone(), object.current_state.clone()))
            });
            if let Some((object_name, current_state)) = switched {
                debug!(
                    "Re-running ephemeral setup {} since {} state was switched to {}",
                    node.shortname(),
                    object_name,
                    current_state
                );
                self.events.emit(RuntimeEventKind::Node(NodeEvent::Rerun {
                    run_id: self.run_id.clone(),
                    node: node.shortname().to_string(),
                    object: object_name,
                }));
                self.graph.node_mut(id).should_run = true;
            }
        }

        let node = self.graph.node(id);
        if !node.should_run {
            debug!("Skipping test {}", node.shortname());
            self.events.emit(RuntimeEventKind::Node(NodeEvent::Skipped {
                run_id: self.run_id.clone(),
                node: node.shortname().to_string(),
            }));
            return Ok(());
        }

        let vms = node.params.get_or("vms", "").to_string();
        match node.kind() {
            NodeKind::SharedRoot => {
                debug!("Test run started from the shared root");
                self.run_scan_node(id).await?;
            }
            NodeKind::Create => {
                let setup_str = create_param_str(&self.config.param_str);
                self.run_create_node(&vms, &setup_str).await?;
            }
            NodeKind::Install => {
                let setup_str = self.config.param_str.clone();
                self.run_install_node(&vms, &setup_str).await?;
            }
            NodeKind::Test => {
                let node = node.clone();
                self.run_node(&node).await?;
            }
        }

        let node = self.graph.node(id);
        let mut updates = Vec::new();
        for object_id in &node.objects {
            let object_name = &self.graph.object(*object_id).name;
            let object_params = node.params.object_params(object_name);
            if let Some(set_state) = object_params.get("set_state").filter(|state| !state.is_empty()) {
                updates.push((*object_id, set_state.to_string()));
            }
        }
        for (object_id, set_state) in updates {
            self.graph.object_mut(object_id).current_state = set_state;
        }
        self.graph.node_mut(id).should_run = false;
        Ok(())
    }

    /// Removes states left by a node when its cleanup is forced with an
    /// `unset_mode` starting with `f`.
    async fn reverse_test_node(&mut self, id: NodeId) -> Result<(), SchedulerError> {
        let node = self.graph.node(id);
        if !node.should_clean {
            debug!(
                "The test {} doesn't leave any states to be cleaned up",
                node.shortname()
            );
            return Ok(());
        }
        if node.kind() == NodeKind::SharedRoot {
            debug!("Test run ended at the shared root");
            return Ok(());
        }

        let node_name = node.name.clone();
        let node_params = node.params.clone();
        let mut cleaned = false;
        for vm_name in node_params.objects("vms") {
            let vm_params = node_params.object_params(vm_name);
            let Some(set_state) = vm_params.get("set_state").filter(|state| !state.is_empty())
            else {
                continue;
            };
            let unset_mode = vm_params.get_or("unset_mode", "ri");
            if !unset_mode.starts_with('f') {
                continue;
            }

            // the unset mode of the test node is forced over the object's own
            let task = SetupTask::ForcedUnset {
                state: set_state.to_string(),
                kind: vm_params.get_or("set_type", "offline").to_string(),
                mode: unset_mode.to_string(),
            };
            let object_id = self.graph.unique_object(vm_name)?;
            let params = task.resolve(
                self.config.params.as_ref(),
                &self.graph.object(object_id).params,
                &self.config.param_str,
            )?;
            let unset = task_node(unset_task_name(&node_name), params, vec![object_id], &[vm_name]);
            self.run_task(&task, &unset, vm_name).await?;
            self.ledger.cleaned.push(unset.name.clone());
            cleaned = true;
        }

        if cleaned {
            self.events.emit(RuntimeEventKind::Node(NodeEvent::Cleaned {
                run_id: self.run_id.clone(),
                node: node_params.shortname().to_string(),
            }));
        }
        Ok(())
    }

    async fn run_scan_node(&mut self, root: NodeId) -> Result<(), SchedulerError> {
        let node = self.graph.node(root).clone();
        self.run_node(&node).await?;

        if let Some(logs_root) = self.config.logs_root.as_ref() {
            let path = logs_root.join(SETUP_LIST_FILE_NAME);
            if path.exists() {
                load_setup_list(self.graph, &path)?;
            } else {
                info!(
                    "No setup list at {}, all tests keep their run flags",
                    path.display()
                );
            }
        }

        self.ledger.cancelled += self
            .graph
            .nodes()
            .filter(|(_, node)| !node.should_run)
            .count();
        Ok(())
    }

    async fn run_create_node(
        &mut self,
        object_name: &str,
        param_str: &str,
    ) -> Result<(), SchedulerError> {
        let (object_id, template) = self.unique_template(object_name, CREATE_NODE_PATTERN)?;
        let task = SetupTask::Create;
        let object = self.graph.object(object_id);
        let params = task.resolve(self.config.params.as_ref(), &object.params, param_str)?;
        let object_name = object.name.clone();
        let create = self.template_task(template, self.graph.node(template).name.clone(), params);
        self.run_task(&task, &create, &object_name).await?;
        Ok(())
    }

    async fn run_install_node(
        &mut self,
        object_name: &str,
        param_str: &str,
    ) -> Result<(), SchedulerError> {
        let (object_id, template) = self.unique_template(object_name, INSTALL_NODE_PATTERN)?;
        let object = self.graph.object(object_id).clone();

        info!("Configuring installation for {}", object.name);
        let preinstall = SetupTask::PreInstall;
        let preinstall_params =
            preinstall.resolve(self.config.params.as_ref(), &object.params, param_str)?;
        // the install method is decided by the pre-install configuration
        let method = preinstall_params
            .get_or("configure_install", DEFAULT_INSTALL_METHOD)
            .to_string();
        let preinstall_node =
            self.template_task(template, preinstall_task_name(&object.name), preinstall_params);
        let outcome = self
            .run_task(&preinstall, &preinstall_node, &object.name)
            .await?;
        if !outcome.is_success() {
            warn!(
                "Skipping installation of {} after a failed pre-install",
                object.name
            );
            return Ok(());
        }

        info!("Installing virtual machine {}", object.name);
        let install = SetupTask::Install(InstallMethod::from_configured(
            &method,
            object.params.name(),
        )?);
        let install_params =
            install.resolve(self.config.params.as_ref(), &object.params, param_str)?;
        let install_node =
            self.template_task(template, install_task_name(&object.name), install_params);
        self.run_task(&install, &install_node, &object.name).await?;
        Ok(())
    }

    /// The unique object named `object_name` and its unique node matching
    /// `pattern`.
    fn unique_template(
        &self,
        object_name: &str,
        pattern: &str,
    ) -> Result<(ObjectId, NodeId), SchedulerError> {
        let object_id = self.graph.unique_object(object_name)?;
        let object_nodes = self.graph.object_nodes(&self.graph.object(object_id).name)?;
        let nodes = self
            .graph
            .get_nodes_by("name", pattern, Some(&object_nodes))?;
        match nodes.as_slice() {
            [node] => Ok((object_id, *node)),
            _ => Err(SchedulerError::invariant(format!(
                "there can only be one node matching {} for {}, found {}",
                pattern,
                object_name,
                nodes.len()
            ))),
        }
    }

    fn template_task(&self, template: NodeId, name: String, params: crate::Params) -> TestNode {
        let template = self.graph.node(template);
        let object_names: Vec<&str> = template
            .objects
            .iter()
            .map(|id| self.graph.object(*id).name.as_str())
            .collect();
        task_node(name, params, template.objects.clone(), &object_names)
    }

    /// Every node body and synthesized task passes through here, so an
    /// interrupt raised during one of them stops the next.
    async fn execute(&mut self, node: &TestNode) -> Result<NodeOutcome, SchedulerError> {
        if self.config.interrupt.is_interrupted() {
            debug!("Not running {} after an interrupt", node.shortname());
            return Err(SchedulerError::Interrupted);
        }
        let executor = Arc::clone(&self.config.executor);
        let outcome = match executor.execute(node, self.graph).await {
            Ok(outcome) => outcome,
            Err(SchedulerError::Interrupted) => return Err(SchedulerError::Interrupted),
            Err(error) => NodeOutcome::failure(error.to_string()),
        };

        let shortname = node.shortname().to_string();
        if outcome.status == NodeStatus::Fail {
            warn!(
                "Test {} failed: {}",
                shortname,
                outcome.notes.as_deref().unwrap_or("no details")
            );
            self.ledger.failed.push(shortname.clone());
        }
        self.ledger.executed.push(shortname);
        Ok(outcome)
    }

    async fn run_node(&mut self, node: &TestNode) -> Result<NodeOutcome, SchedulerError> {
        info!("Running test {}", node.shortname());
        self.events.emit(RuntimeEventKind::Node(NodeEvent::Started {
            run_id: self.run_id.clone(),
            node: node.shortname().to_string(),
        }));
        let outcome = self.execute(node).await?;
        self.events.emit(RuntimeEventKind::Node(NodeEvent::Completed {
            run_id: self.run_id.clone(),
            node: node.shortname().to_string(),
            status: outcome.status.as_str().to_string(),
            notes: outcome.notes.clone(),
        }));
        Ok(outcome)
    }

    async fn run_task(
        &mut self,
        task: &SetupTask,
        node: &TestNode,
        object_name: &str,
    ) -> Result<NodeOutcome, SchedulerError> {
        info!("Running {} task {} for {}", task.action(), node.name, object_name);
        self.events.emit(RuntimeEventKind::Task(TaskEvent::Started {
            run_id: self.run_id.clone(),
            task: node.name.clone(),
            object: object_name.to_string(),
            action: task.action().to_string(),
        }));
        let outcome = self.execute(node).await?;
        self.events.emit(RuntimeEventKind::Task(TaskEvent::Completed {
            run_id: self.run_id.clone(),
            task: node.name.clone(),
            object: object_name.to_string(),
            status: outcome.status.as_str().to_string(),
            notes: outcome.notes.clone(),
        }));
        Ok(outcome)
    }
}
