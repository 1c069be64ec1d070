use crate::{Params, SchedulerError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::LazyLock;
use tracing::{debug, info};

/// Placeholder state of an object nobody has touched yet.
pub const UNKNOWN_STATE: &str = "unknown";

pub const SHARED_ROOT_PATTERN: &str = r"(\.|^)0scan(\.|$)";
pub const CREATE_NODE_PATTERN: &str = r"(\.|^)0root(\.|$)";
pub const INSTALL_NODE_PATTERN: &str = r"(\.|^)(install|unattended_install)(\.|$)";

static SHARED_ROOT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SHARED_ROOT_PATTERN).expect("shared root pattern is valid"));
static CREATE_NODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(CREATE_NODE_PATTERN).expect("create node pattern is valid"));
static INSTALL_NODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(INSTALL_NODE_PATTERN).expect("install node pattern is valid"));

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub usize);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestObject {
    pub name: String,
    pub params: Params,
    pub current_state: String,
}

impl TestObject {
    pub fn new(name: impl Into<String>, params: Params) -> Self {
        let name = name.into();
        let mut params = params;
        if !params.contains_key("main_vm") {
            params.insert("main_vm", name.clone());
        }
        Self {
            name,
            params,
            current_state: UNKNOWN_STATE.to_string(),
        }
    }

    /// Permanent objects can only be created manually and keep their online
    /// states across runs.
    pub fn is_permanent(&self) -> bool {
        self.params.get_or("permanent_vm", "no") == "yes"
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    SharedRoot,
    Create,
    Install,
    Test,
}

impl NodeKind {
    pub fn classify(variant_name: &str) -> Self {
        if SHARED_ROOT_REGEX.is_match(variant_name) {
            Self::SharedRoot
        } else if CREATE_NODE_REGEX.is_match(variant_name) {
            Self::Create
        } else if INSTALL_NODE_REGEX.is_match(variant_name) {
            Self::Install
        } else {
            Self::Test
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestNode {
    pub name: String,
    pub params: Params,
    pub objects: Vec<ObjectId>,
    pub should_run: bool,
    pub should_clean: bool,
    setup_nodes: Vec<NodeId>,
    cleanup_nodes: Vec<NodeId>,
    visited_setup_nodes: BTreeSet<NodeId>,
    visited_cleanup_nodes: BTreeSet<NodeId>,
}

impl TestNode {
    pub fn new(name: impl Into<String>, params: Params, objects: Vec<ObjectId>) -> Self {
        let name = name.into();
        let mut params = params;
        if !params.contains_key("name") {
            params.insert("name", name.clone());
        }
        if !params.contains_key("shortname") {
            params.insert("shortname", name.clone());
        }
        Self {
            name,
            params,
            objects,
            should_run: true,
            should_clean: true,
            setup_nodes: Vec::new(),
            cleanup_nodes: Vec::new(),
            visited_setup_nodes: BTreeSet::new(),
            visited_cleanup_nodes: BTreeSet::new(),
        }
    }

    pub fn shortname(&self) -> &str {
        self.params.shortname()
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::classify(self.params.name())
    }

    pub fn setup_nodes(&self) -> &[NodeId] {
        &self.setup_nodes
    }

    pub fn cleanup_nodes(&self) -> &[NodeId] {
        &self.cleanup_nodes
    }

    pub fn visited_setup_nodes(&self) -> &BTreeSet<NodeId> {
        &self.visited_setup_nodes
    }

    pub fn visited_cleanup_nodes(&self) -> &BTreeSet<NodeId> {
        &self.visited_cleanup_nodes
    }

    /// All setup dependencies were visited (or there are none).
    pub fn is_setup_ready(&self) -> bool {
        self.setup_nodes
            .iter()
            .all(|id| self.visited_setup_nodes.contains(id))
    }

    /// All dependents were visited (or there are none).
    pub fn is_cleanup_ready(&self) -> bool {
        self.cleanup_nodes
            .iter()
            .all(|id| self.visited_cleanup_nodes.contains(id))
    }

    pub fn is_finished(&self) -> bool {
        self.is_cleanup_ready() && !self.should_run
    }

    /// First declared setup dependency not visited yet.
    pub fn next_unvisited_setup(&self) -> Option<NodeId> {
        self.setup_nodes
            .iter()
            .copied()
            .find(|id| !self.visited_setup_nodes.contains(id))
    }

    /// First declared dependent not visited yet.
    pub fn next_unvisited_cleanup(&self) -> Option<NodeId> {
        self.cleanup_nodes
            .iter()
            .copied()
            .find(|id| !self.visited_cleanup_nodes.contains(id))
    }

    fn record_visit(&mut self, visited: NodeId) -> bool {
        if self.setup_nodes.contains(&visited) {
            self.visited_setup_nodes.insert(visited);
            true
        } else if self.cleanup_nodes.contains(&visited) {
            self.visited_cleanup_nodes.insert(visited);
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub finished: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        100.0 * self.finished as f64 / self.total as f64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagKind {
    Run,
    Clean,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescriptor {
    pub name: String,
    pub shortname: String,
}

#[derive(Clone, Debug, Default)]
pub struct TestGraph {
    pub id: String,
    pub params: Params,
    nodes: Vec<TestNode>,
    objects: Vec<TestObject>,
    progress_reports: u64,
}

impl TestGraph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn add_object(&mut self, object: TestObject) -> Result<ObjectId, SchedulerError> {
        if self.object_by_name(&object.name).is_some() {
            return Err(SchedulerError::InvalidGraph(format!(
                "test object '{}' declared twice",
                object.name
            )));
        }
        self.objects.push(object);
        Ok(ObjectId(self.objects.len() - 1))
    }

    /// Adds a node; `vms` is filled from the node's objects when absent.
    pub fn add_node(&mut self, node: TestNode) -> Result<NodeId, SchedulerError> {
        let mut node = node;
        for object in &node.objects {
            if object.0 >= self.objects.len() {
                return Err(SchedulerError::invariant(format!(
                    "node '{}' refers to unknown object #{}",
                    node.name, object.0
                )));
            }
        }
        if !node.params.contains_key("vms") && !node.objects.is_empty() {
            let vms = node
                .objects
                .iter()
                .map(|id| self.objects[id.0].name.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            node.params.insert("vms", vms);
        }
        self.nodes.push(node);
        Ok(NodeId(self.nodes.len() - 1))
    }

    /// Declares `setup` as a setup dependency of `dependent`.
    pub fn connect(&mut self, setup: NodeId, dependent: NodeId) -> Result<(), SchedulerError> {
        self.check_node(setup)?;
        self.check_node(dependent)?;
        if setup == dependent {
            return Err(SchedulerError::invariant(format!(
                "node '{}' cannot depend on itself",
                self.nodes[setup.0].name
            )));
        }
        if self.nodes[dependent.0].setup_nodes.contains(&setup) {
            return Err(SchedulerError::invariant(format!(
                "setup edge '{}' -> '{}' declared twice",
                self.nodes[setup.0].name, self.nodes[dependent.0].name
            )));
        }
        self.nodes[dependent.0].setup_nodes.push(setup);
        self.nodes[setup.0].cleanup_nodes.push(dependent);
        Ok(())
    }

    /// Records that `node` traversed its direct dependency `visited`.
    pub fn visit(&mut self, node: NodeId, visited: NodeId) -> Result<(), SchedulerError> {
        self.check_node(node)?;
        self.check_node(visited)?;
        if self.nodes[node.0].record_visit(visited) {
            Ok(())
        } else {
            Err(SchedulerError::invariant(format!(
                "invalid test node - {} and {} are not directly dependent in any way",
                self.nodes[visited.0].shortname(),
                self.nodes[node.0].shortname()
            )))
        }
    }

    fn check_node(&self, id: NodeId) -> Result<(), SchedulerError> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(SchedulerError::invariant(format!("unknown test node #{}", id.0)))
        }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TestNode {
        &mut self.nodes[id.0]
    }

    pub fn object(&self, id: ObjectId) -> &TestObject {
        &self.objects[id.0]
    }

    pub fn object_mut(&mut self, id: ObjectId) -> &mut TestObject {
        &mut self.objects[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TestNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index), node))
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &TestObject)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(index, object)| (ObjectId(index), object))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .map(NodeId)
    }

    pub fn object_by_name(&self, name: &str) -> Option<ObjectId> {
        self.objects
            .iter()
            .position(|object| object.name == name)
            .map(ObjectId)
    }

    /// Nodes whose `param_key` parameter contains a match for `pattern`.
    ///
    /// This is a regex search, not equality, so a dotted variant path matches
    /// any of its subvariants.
    pub fn get_nodes_by(
        &self,
        param_key: &str,
        pattern: &str,
        subset: Option<&[NodeId]>,
    ) -> Result<Vec<NodeId>, SchedulerError> {
        let regex = compile_lookup(pattern)?;
        let candidates: Vec<NodeId> = match subset {
            Some(ids) => ids.to_vec(),
            None => (0..self.nodes.len()).map(NodeId).collect(),
        };
        let selection: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|id| regex.is_match(self.nodes[id.0].params.get_or(param_key, "")))
            .collect();
        debug!(
            "Retrieved {}/{} test nodes with {} = {}",
            selection.len(),
            candidates.len(),
            param_key,
            pattern
        );
        Ok(selection)
    }

    pub fn get_objects_by(
        &self,
        param_key: &str,
        pattern: &str,
        subset: Option<&[ObjectId]>,
    ) -> Result<Vec<ObjectId>, SchedulerError> {
        let regex = compile_lookup(pattern)?;
        let candidates: Vec<ObjectId> = match subset {
            Some(ids) => ids.to_vec(),
            None => (0..self.objects.len()).map(ObjectId).collect(),
        };
        let selection: Vec<ObjectId> = candidates
            .iter()
            .copied()
            .filter(|id| regex.is_match(self.objects[id.0].params.get_or(param_key, "")))
            .collect();
        debug!(
            "Retrieved {}/{} test objects with {} = {}",
            selection.len(),
            candidates.len(),
            param_key,
            pattern
        );
        Ok(selection)
    }

    /// The unique object whose `main_vm` is exactly `object_name`.
    pub fn unique_object(&self, object_name: &str) -> Result<ObjectId, SchedulerError> {
        let pattern = format!("^{}$", regex::escape(object_name));
        let objects = self.get_objects_by("main_vm", &pattern, None)?;
        match objects.as_slice() {
            [object] => Ok(*object),
            _ => Err(SchedulerError::invariant(format!(
                "test object {} not existing or unique in: [{}]",
                object_name,
                objects
                    .iter()
                    .map(|id| self.objects[id.0].name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Nodes operating on the given object.
    pub fn object_nodes(&self, object_name: &str) -> Result<Vec<NodeId>, SchedulerError> {
        let pattern = format!(r"(^|\s){}($|\s)", regex::escape(object_name));
        self.get_nodes_by("vms", &pattern, None)
    }

    pub fn shared_root(&self) -> Result<NodeId, SchedulerError> {
        let roots = self.get_nodes_by("name", SHARED_ROOT_PATTERN, None)?;
        match roots.as_slice() {
            [root] => Ok(*root),
            _ => Err(SchedulerError::invariant(format!(
                "there can be only exactly one shared root node, found {}",
                roots.len()
            ))),
        }
    }

    /// Whether the states produced by a node can be lost before its dependents
    /// reuse them (offline to online transitions and online states on
    /// impermanent objects).
    pub fn is_ephemeral(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.0];
        for object_id in &node.objects {
            let object = &self.objects[object_id.0];
            let object_params = node.params.object_params(&object.name);
            if object_params.get_or("set_state", "").is_empty() {
                continue;
            }

            let set_online = object_params.get_or("set_type", "online") == "online";
            if object_params.get_or("get_type", "online") == "offline"
                && object_params.get_or("get_state", "root") != "root"
                && set_online
            {
                return true;
            }
            if !object.is_permanent() && set_online {
                return true;
            }
        }
        false
    }

    /// Sets a run or clean flag on the unique node producing `state` for
    /// `object_name` and on all of its descendants.
    pub fn flag_children(
        &mut self,
        state: &str,
        object_name: &str,
        flag_kind: FlagKind,
        flag: bool,
        skip_roots: bool,
    ) -> Result<Vec<NodeId>, SchedulerError> {
        let producers = self.get_nodes_by("set_state", &format!("^{}$", regex::escape(state)), None)?;
        let object_nodes = self.object_nodes(object_name)?;
        let producers: Vec<NodeId> = producers
            .into_iter()
            .filter(|id| object_nodes.contains(id))
            .collect();
        let producer = match producers.as_slice() {
            [producer] => *producer,
            [] => {
                return Err(SchedulerError::invariant(format!(
                    "could not retrieve state {state} and flag all its children tests"
                )));
            }
            _ => {
                return Err(SchedulerError::invariant(format!(
                    "could not identify state {state} and flag all its children tests"
                )));
            }
        };

        let mut queue: VecDeque<NodeId> = if skip_roots {
            self.nodes[producer.0].cleanup_nodes.iter().copied().collect()
        } else {
            VecDeque::from([producer])
        };
        let mut flagged = Vec::new();
        let mut seen = BTreeSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let node = &mut self.nodes[id.0];
            debug!("Flagging {} for {:?} = {}", node.shortname(), flag_kind, flag);
            match flag_kind {
                FlagKind::Run => node.should_run = flag,
                FlagKind::Clean => node.should_clean = flag,
            }
            queue.extend(node.cleanup_nodes.iter().copied());
            flagged.push(id);
        }
        Ok(flagged)
    }

    pub fn test_descriptors(&self) -> Vec<TestDescriptor> {
        self.nodes
            .iter()
            .map(|node| TestDescriptor {
                name: node.name.clone(),
                shortname: node.shortname().to_string(),
            })
            .collect()
    }

    /// Checks that a separately built suite corresponds 1:1, in order, to
    /// this graph's nodes.
    pub fn verify_descriptors(&self, suite: &[TestDescriptor]) -> Result<(), SchedulerError> {
        if suite.len() != self.nodes.len() {
            return Err(SchedulerError::invariant(format!(
                "test suite has {} entries but the graph has {} nodes",
                suite.len(),
                self.nodes.len()
            )));
        }
        for (index, (descriptor, node)) in suite.iter().zip(&self.nodes).enumerate() {
            if descriptor.name != node.name || descriptor.shortname != node.shortname() {
                return Err(SchedulerError::invariant(format!(
                    "test suite entry {} ({}) does not match graph node {}",
                    index,
                    descriptor.shortname,
                    node.shortname()
                )));
            }
        }
        Ok(())
    }

    /// Logs and returns how many nodes will not be run again.
    ///
    /// Setup nodes that might still be reused count as unfinished, so this is
    /// a worst-case estimate.
    pub fn report_progress(&mut self) -> Progress {
        self.progress_reports += 1;
        let progress = self.progress();
        info!(
            "Finished {}/{} tests, {:.2}% complete",
            progress.finished,
            progress.total,
            progress.percent()
        );
        progress
    }

    pub fn progress(&self) -> Progress {
        Progress {
            finished: self.nodes.iter().filter(|node| node.is_finished()).count(),
            total: self.nodes.len(),
        }
    }

    pub fn progress_reports(&self) -> u64 {
        self.progress_reports
    }
}

fn compile_lookup(pattern: &str) -> Result<Regex, SchedulerError> {
    Regex::new(pattern).map_err(|error| {
        SchedulerError::validation(format!("invalid lookup pattern '{pattern}': {error}"))
    })
}
