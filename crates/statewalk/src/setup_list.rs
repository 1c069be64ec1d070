use crate::{SchedulerError, TestGraph};
use std::fs;
use std::path::Path;

pub const SETUP_LIST_FILE_NAME: &str = "setup_list";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupEntry {
    pub name: String,
    pub should_run: bool,
    pub should_clean: bool,
}

/// Renders the setup state of every node, one `name run clean` line per node
/// in graph order.
pub fn render_setup_list(graph: &TestGraph) -> String {
    let mut output = String::new();
    for (_, node) in graph.nodes() {
        output.push_str(&format!(
            "{} {} {}\n",
            node.name,
            u8::from(node.should_run),
            u8::from(node.should_clean)
        ));
    }
    output
}

pub fn parse_setup_list(source: &str) -> Result<Vec<SetupEntry>, SchedulerError> {
    let mut entries = Vec::new();
    for (index, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, should_run, should_clean] = fields.as_slice() else {
            return Err(SchedulerError::invariant(format!(
                "corrupted setup list file: line {} has {} fields",
                index + 1,
                fields.len()
            )));
        };
        entries.push(SetupEntry {
            name: (*name).to_string(),
            should_run: parse_flag(should_run, index)?,
            should_clean: parse_flag(should_clean, index)?,
        });
    }
    Ok(entries)
}

fn parse_flag(value: &str, index: usize) -> Result<bool, SchedulerError> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(SchedulerError::invariant(format!(
            "corrupted setup list file: line {} has flag '{}'",
            index + 1,
            other
        ))),
    }
}

/// Applies parsed flags to the graph nodes in order.
///
/// A list shorter than the graph only updates its prefix.
pub fn apply_setup_list(graph: &mut TestGraph, entries: &[SetupEntry]) -> Result<(), SchedulerError> {
    if entries.len() > graph.node_count() {
        return Err(SchedulerError::invariant(format!(
            "corrupted setup list file: {} entries for {} nodes",
            entries.len(),
            graph.node_count()
        )));
    }
    let ids: Vec<_> = graph.nodes().map(|(id, _)| id).collect();
    for (entry, id) in entries.iter().zip(&ids) {
        if graph.node(*id).name != entry.name {
            return Err(SchedulerError::invariant(format!(
                "corrupted setup list file: expected '{}' but found '{}'",
                graph.node(*id).name,
                entry.name
            )));
        }
    }
    for (entry, id) in entries.iter().zip(ids) {
        let node = graph.node_mut(id);
        node.should_run = entry.should_run;
        node.should_clean = entry.should_clean;
    }
    Ok(())
}

pub fn save_setup_list(graph: &TestGraph, path: &Path) -> Result<(), SchedulerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            SchedulerError::Io(format!(
                "failed to create setup list parent directory '{}': {}",
                parent.display(),
                error
            ))
        })?;
    }
    fs::write(path, render_setup_list(graph)).map_err(|error| {
        SchedulerError::Io(format!(
            "failed writing setup list file '{}': {}",
            path.display(),
            error
        ))
    })
}

pub fn load_setup_list(graph: &mut TestGraph, path: &Path) -> Result<(), SchedulerError> {
    let source = fs::read_to_string(path).map_err(|error| {
        SchedulerError::Io(format!(
            "failed reading setup list file '{}': {}",
            path.display(),
            error
        ))
    })?;
    let entries = parse_setup_list(&source)?;
    apply_setup_list(graph, &entries)
}
