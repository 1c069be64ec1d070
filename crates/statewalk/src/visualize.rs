use crate::{SchedulerError, TestGraph};
use graphviz_rust::dot_structures::{
    Attribute, Edge, EdgeTy, Graph, Id, Node, NodeId as DotNodeId, Stmt, Vertex,
};
use graphviz_rust::printer::{DotPrinter, PrinterContext};
use std::fs;
use std::path::{Path, PathBuf};

pub const TRAVERSE_DIR_NAME: &str = "graph_traverse";

/// Renders the graph as a DOT description the loader can read back.
///
/// Setup edges already traversed in either direction are drawn dashed.
pub fn render_dot(graph: &TestGraph) -> String {
    let mut stmts = Vec::new();
    for (key, value) in graph.params.iter() {
        stmts.push(Stmt::Attribute(attr(key, value)));
    }

    for (_, object) in graph.objects() {
        let mut attributes = vec![attr("type", "object")];
        attributes.extend(object.params.iter().map(|(key, value)| attr(key, value)));
        stmts.push(Stmt::Node(Node::new(node_id(&object.name), attributes)));
    }

    for (_, node) in graph.nodes() {
        let mut attributes: Vec<Attribute> = node
            .params
            .iter()
            .map(|(key, value)| attr(key, value))
            .collect();
        attributes.push(attr("should_run", bool_str(node.should_run)));
        attributes.push(attr("should_clean", bool_str(node.should_clean)));
        stmts.push(Stmt::Node(Node::new(node_id(&node.name), attributes)));
    }

    for (id, node) in graph.nodes() {
        for dependent in node.cleanup_nodes() {
            let traversed = node.visited_cleanup_nodes().contains(dependent)
                || graph.node(*dependent).visited_setup_nodes().contains(&id);
            let attributes = if traversed {
                vec![attr("style", "dashed")]
            } else {
                Vec::new()
            };
            stmts.push(Stmt::Edge(Edge {
                ty: EdgeTy::Pair(
                    Vertex::N(node_id(&node.name)),
                    Vertex::N(node_id(&graph.node(*dependent).name)),
                ),
                attributes,
            }));
        }
    }

    let dot = Graph::DiGraph {
        id: escaped(&graph.id),
        strict: false,
        stmts,
    };
    dot.print(&mut PrinterContext::default())
}

pub fn snapshot_path(dump_dir: &Path, run_id: &str, step: u64) -> PathBuf {
    dump_dir.join(format!("cg_{run_id}_{step}.dot"))
}

pub fn write_snapshot(
    graph: &TestGraph,
    dump_dir: &Path,
    run_id: &str,
    step: u64,
) -> Result<PathBuf, SchedulerError> {
    fs::create_dir_all(dump_dir).map_err(|error| {
        SchedulerError::Io(format!(
            "failed to create visualization directory '{}': {}",
            dump_dir.display(),
            error
        ))
    })?;
    let path = snapshot_path(dump_dir, run_id, step);
    fs::write(&path, render_dot(graph)).map_err(|error| {
        SchedulerError::Io(format!(
            "failed writing graph snapshot '{}': {}",
            path.display(),
            error
        ))
    })?;
    Ok(path)
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn node_id(name: &str) -> DotNodeId {
    DotNodeId(escaped(name), None)
}

fn attr(key: &str, value: &str) -> Attribute {
    Attribute(escaped(key), escaped(value))
}

fn escaped(value: &str) -> Id {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    Id::Escaped(quoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_graph_dot;
    use tempfile::TempDir;

    const SOURCE: &str = r#"
        digraph demo {
            vm1 [type="object", name="vm1.qcow2"]
            "0scan" [name="0scan"]
            install [name="original.install", vms="vm1", should_run=false]
            "0scan" -> install
        }
    "#;

    #[test]
    fn render_dot_expected_loadable_with_same_structure() {
        let graph = load_graph_dot(SOURCE).expect("graph should load");
        let rendered = render_dot(&graph);
        let reloaded = load_graph_dot(&rendered).expect("rendered graph should load");

        assert_eq!(reloaded.test_descriptors(), graph.test_descriptors());
        assert_eq!(reloaded.object_count(), 1);
        let install = reloaded.node_by_name("install").expect("install node");
        assert!(!reloaded.node(install).should_run);
        assert_eq!(reloaded.node(install).setup_nodes().len(), 1);
    }

    #[test]
    fn render_dot_visited_edge_expected_dashed() {
        let mut graph = load_graph_dot(SOURCE).expect("graph should load");
        assert!(!render_dot(&graph).contains("dashed"));

        let scan = graph.node_by_name("0scan").expect("scan node");
        let install = graph.node_by_name("install").expect("install node");
        graph.visit(install, scan).expect("visit should succeed");
        assert!(render_dot(&graph).contains("dashed"));
    }

    #[test]
    fn write_snapshot_expected_numbered_file() {
        let temp = TempDir::new().expect("temp dir should be created");
        let graph = load_graph_dot(SOURCE).expect("graph should load");
        let dir = temp.path().join(TRAVERSE_DIR_NAME);
        let path = write_snapshot(&graph, &dir, "run-1", 3).expect("snapshot should write");

        assert_eq!(path, dir.join("cg_run-1_3.dot"));
        let written = fs::read_to_string(path).expect("snapshot should read");
        assert!(written.contains("digraph"));
    }
}
