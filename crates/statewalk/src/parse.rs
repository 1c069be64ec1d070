//! DOT graph descriptions.
//!
//! A node with `type="object"` declares a test object, any other node a test
//! node. `a -> b` makes `a` a setup dependency of `b`. Graph attributes become
//! the graph's default parameters.

use crate::{Params, SchedulerError, TestGraph, TestNode, TestObject};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId as DotNodeId, Stmt, Vertex,
};
use std::collections::BTreeMap;
use tracing::debug;

pub const OBJECT_TYPE: &str = "object";

#[derive(Clone, Debug, Default)]
struct Scope {
    node_defaults: Params,
}

#[derive(Debug, Default)]
struct ParseState {
    graph_id: String,
    graph_params: Params,
    order: Vec<String>,
    declared: BTreeMap<String, Params>,
    edges: Vec<(String, String)>,
}

impl ParseState {
    fn touch(&mut self, id: &str, scope: &Scope) -> &mut Params {
        if !self.declared.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.declared
            .entry(id.to_string())
            .or_insert_with(|| scope.node_defaults.clone())
    }
}

pub fn load_graph_dot(source: &str) -> Result<TestGraph, SchedulerError> {
    let dot_graph = graphviz_rust::parse(source).map_err(SchedulerError::DotParse)?;
    let state = collect_graph(dot_graph)?;
    build_graph(state)
}

fn collect_graph(graph: DotGraph) -> Result<ParseState, SchedulerError> {
    let (id, strict, stmts) = match graph {
        DotGraph::DiGraph { id, strict, stmts } => (id, strict, stmts),
        DotGraph::Graph { .. } => {
            return Err(SchedulerError::InvalidGraph(
                "only 'digraph' is supported".to_string(),
            ));
        }
    };
    if strict {
        return Err(SchedulerError::InvalidGraph(
            "'strict' graphs are not supported".to_string(),
        ));
    }

    let mut state = ParseState {
        graph_id: id_to_string(&id)?,
        ..ParseState::default()
    };
    process_statements(&mut state, &stmts, &Scope::default(), true)?;
    Ok(state)
}

fn process_statements(
    state: &mut ParseState,
    stmts: &[Stmt],
    parent_scope: &Scope,
    top_level: bool,
) -> Result<(), SchedulerError> {
    let mut scope = parent_scope.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(graph_attrs) => match graph_attrs {
                GraphAttributes::Node(attrs) => {
                    scope.node_defaults.merge(&parse_attributes(attrs)?);
                }
                GraphAttributes::Edge(_) => {}
                GraphAttributes::Graph(attrs) => {
                    if top_level {
                        state.graph_params.merge(&parse_attributes(attrs)?);
                    }
                }
            },
            Stmt::Attribute(attr) => {
                if top_level {
                    let (key, value) = parse_attribute(attr)?;
                    state.graph_params.insert(key, value);
                }
            }
            Stmt::Node(node) => process_node_stmt(state, node, &scope)?,
            Stmt::Edge(edge) => process_edge_stmt(state, edge, &scope)?,
            Stmt::Subgraph(subgraph) => {
                process_statements(state, &subgraph.stmts, &scope, false)?
            }
        }
    }

    Ok(())
}

fn process_node_stmt(
    state: &mut ParseState,
    node: &DotNode,
    scope: &Scope,
) -> Result<(), SchedulerError> {
    let node_id = parse_node_id(&node.id)?;
    let parsed = parse_attributes(&node.attributes)?;
    state.touch(&node_id, scope).merge(&parsed);
    Ok(())
}

fn process_edge_stmt(
    state: &mut ParseState,
    edge: &DotEdge,
    scope: &Scope,
) -> Result<(), SchedulerError> {
    let vertices = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![parse_vertex(from)?, parse_vertex(to)?],
        EdgeTy::Chain(chain) => chain
            .iter()
            .map(parse_vertex)
            .collect::<Result<Vec<_>, _>>()?,
    };

    if vertices.len() < 2 {
        return Err(SchedulerError::InvalidGraph(
            "edge chain must contain at least two vertices".to_string(),
        ));
    }

    for vertex in &vertices {
        state.touch(vertex, scope);
    }
    for pair in vertices.windows(2) {
        state.edges.push((pair[0].clone(), pair[1].clone()));
    }
    Ok(())
}

fn build_graph(state: ParseState) -> Result<TestGraph, SchedulerError> {
    let mut graph = TestGraph::new(state.graph_id);
    graph.params = state.graph_params;

    for id in &state.order {
        let Some(attrs) = state.declared.get(id) else {
            continue;
        };
        if attrs.get("type") != Some(OBJECT_TYPE) {
            continue;
        }
        let mut params = attrs.clone();
        params.remove("type");
        graph.add_object(TestObject::new(id.clone(), params))?;
    }

    for id in &state.order {
        let Some(attrs) = state.declared.get(id) else {
            continue;
        };
        if attrs.get("type") == Some(OBJECT_TYPE) {
            continue;
        }
        let mut params = attrs.clone();
        let should_run = take_flag(&mut params, id, "should_run")?;
        let should_clean = take_flag(&mut params, id, "should_clean")?;

        let mut objects = Vec::new();
        for object_name in params.objects("vms") {
            let object = graph.object_by_name(object_name).ok_or_else(|| {
                SchedulerError::InvalidGraph(format!(
                    "node '{id}' refers to unknown test object '{object_name}'"
                ))
            })?;
            objects.push(object);
        }

        let mut node = TestNode::new(id.clone(), params, objects);
        node.should_run = should_run.unwrap_or(true);
        node.should_clean = should_clean.unwrap_or(true);
        graph.add_node(node)?;
    }

    for (from, to) in &state.edges {
        let setup = node_for_edge(&graph, from)?;
        let dependent = node_for_edge(&graph, to)?;
        graph.connect(setup, dependent)?;
    }

    debug!(
        "Loaded graph {} with {} nodes and {} objects",
        graph.id,
        graph.node_count(),
        graph.object_count()
    );
    Ok(graph)
}

fn node_for_edge(graph: &TestGraph, id: &str) -> Result<crate::NodeId, SchedulerError> {
    graph.node_by_name(id).ok_or_else(|| {
        SchedulerError::InvalidGraph(format!(
            "edge endpoint '{id}' is a test object, not a test node"
        ))
    })
}

fn take_flag(params: &mut Params, id: &str, key: &str) -> Result<Option<bool>, SchedulerError> {
    let Some(raw) = params.remove(key) else {
        return Ok(None);
    };
    match raw.as_str() {
        "true" | "yes" | "1" => Ok(Some(true)),
        "false" | "no" | "0" => Ok(Some(false)),
        other => Err(SchedulerError::InvalidGraph(format!(
            "node '{id}' has non-boolean {key} '{other}'"
        ))),
    }
}

fn parse_vertex(vertex: &Vertex) -> Result<String, SchedulerError> {
    match vertex {
        Vertex::N(node_id) => parse_node_id(node_id),
        Vertex::S(_) => Err(SchedulerError::InvalidGraph(
            "subgraph vertices in edge statements are not supported".to_string(),
        )),
    }
}

fn parse_node_id(node_id: &DotNodeId) -> Result<String, SchedulerError> {
    if node_id.1.is_some() {
        return Err(SchedulerError::InvalidGraph(
            "ports in node identifiers are not supported".to_string(),
        ));
    }

    let id = id_to_string(&node_id.0)?;
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return Err(SchedulerError::InvalidGraph(format!(
            "node id '{id}' is invalid; expected a non-empty name without whitespace"
        )));
    }
    Ok(id)
}

fn parse_attributes(attrs: &[Attribute]) -> Result<Params, SchedulerError> {
    let mut parsed = Params::new();
    for attr in attrs {
        let (key, value) = parse_attribute(attr)?;
        parsed.insert(key, value);
    }
    Ok(parsed)
}

fn parse_attribute(attr: &Attribute) -> Result<(String, String), SchedulerError> {
    let key = id_to_string(&attr.0)?;
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(SchedulerError::InvalidGraph(format!(
            "invalid attribute key '{key}'"
        )));
    }
    let value = id_to_string(&attr.1)?;
    Ok((key, value))
}

fn id_to_string(id: &Id) -> Result<String, SchedulerError> {
    match id {
        Id::Plain(value) => Ok(value.clone()),
        Id::Escaped(value) => {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(|| {
                    SchedulerError::InvalidGraph(format!(
                        "escaped string id '{value}' is missing quotes"
                    ))
                })?;
            Ok(unescape_dot_string(unquoted))
        }
        Id::Html(_) => Err(SchedulerError::InvalidGraph(
            "HTML labels/IDs are not supported".to_string(),
        )),
        Id::Anonymous(value) => Ok(value.clone()),
    }
}

fn unescape_dot_string(input: &str) -> String {
    let mut output = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => output.push('\n'),
                Some('t') => output.push('\t'),
                Some('"') => output.push('"'),
                Some('\\') => output.push('\\'),
                Some(other) => output.push(other),
                None => output.push('\\'),
            }
        } else {
            output.push(ch);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_graph_dot_objects_and_nodes_expected_split() {
        let graph = load_graph_dot(
            r#"
            digraph suite {
                default_only = "nongui"
                vm1 [type="object", name="vm1.qcow2.Fedora.33"]
                "0scan" [name="0scan"]
                tutorial1 [name="quicktest.tutorial1", vms="vm1", should_clean=false]
                "0scan" -> tutorial1
            }
            "#,
        )
        .expect("graph should load");

        assert_eq!(graph.id, "suite");
        assert_eq!(graph.params.get("default_only"), Some("nongui"));
        assert_eq!(graph.object_count(), 1);
        assert_eq!(graph.node_count(), 2);

        let vm1 = graph.object_by_name("vm1").expect("vm1 object");
        assert_eq!(graph.object(vm1).params.get("main_vm"), Some("vm1"));
        assert_eq!(graph.object(vm1).params.get("type"), None);

        let tutorial = graph.node_by_name("tutorial1").expect("tutorial node");
        let scan = graph.node_by_name("0scan").expect("scan node");
        assert_eq!(graph.node(tutorial).objects, vec![vm1]);
        assert!(graph.node(tutorial).should_run);
        assert!(!graph.node(tutorial).should_clean);
        assert_eq!(graph.node(tutorial).params.get("should_clean"), None);
        assert_eq!(graph.node(tutorial).setup_nodes(), &[scan]);
        assert_eq!(graph.node(scan).cleanup_nodes(), &[tutorial]);
    }

    #[test]
    fn load_graph_dot_edge_chain_and_node_defaults_expected() {
        let graph = load_graph_dot(
            r#"
            digraph chain {
                node [unset_mode="fi"]
                a -> b -> c
            }
            "#,
        )
        .expect("graph should load");

        let names: Vec<&str> = graph.nodes().map(|(_, node)| node.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        let c = graph.node_by_name("c").expect("c node");
        assert_eq!(graph.node(c).params.get("unset_mode"), Some("fi"));
        assert_eq!(graph.node(c).setup_nodes().len(), 1);
    }

    #[test]
    fn load_graph_dot_unknown_object_expected_invalid_graph() {
        let error = load_graph_dot(r#"digraph g { t [vms="vm9"] }"#)
            .expect_err("unknown object must fail");
        assert!(matches!(error, SchedulerError::InvalidGraph(message) if message.contains("vm9")));
    }

    #[test]
    fn load_graph_dot_undirected_or_bad_flag_expected_error() {
        assert!(matches!(
            load_graph_dot("graph g { a -- b }"),
            Err(SchedulerError::InvalidGraph(_))
        ));
        assert!(matches!(
            load_graph_dot(r#"digraph g { a [should_run="maybe"] }"#),
            Err(SchedulerError::InvalidGraph(_))
        ));
        assert!(matches!(
            load_graph_dot("digraph g { a -> "),
            Err(SchedulerError::DotParse(_))
        ));
    }

    #[test]
    fn load_graph_dot_edge_to_object_expected_invalid_graph() {
        let error = load_graph_dot(r#"digraph g { vm1 [type="object"] a -> vm1 }"#)
            .expect_err("object edge must fail");
        assert!(matches!(error, SchedulerError::InvalidGraph(_)));
    }
}
