use crate::{BluePrintSnapshot, Listener, ListenerAction, TriggerKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

/// Build a directed graph of a snapshot's routing topology
///
/// Nodes are events and chunks, edges are labeled with the listener action
/// that connects them. Cycles are expected; loops via emit are a feature.
pub fn snapshot_graph(snapshot: &BluePrintSnapshot) -> DiGraph<String, String> {
    let mut graph = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();

    let mut node = |graph: &mut DiGraph<String, String>, label: String| -> NodeIndex {
        *nodes
            .entry(label.clone())
            .or_insert_with(|| graph.add_node(label))
    };

    let tables = [
        (TriggerKind::Event, &snapshot.on_event),
        (TriggerKind::RuntimeData, &snapshot.on_runtime_data),
        (TriggerKind::FlowData, &snapshot.on_flow_data),
    ];
    for (kind, table) in tables {
        for (target, listeners) in table {
            let prefix = match kind {
                TriggerKind::Event => "event",
                TriggerKind::RuntimeData => "runtime_data",
                TriggerKind::FlowData => "flow_data",
            };
            let source = node(&mut graph, format!("{prefix}:{target}"));
            for listener in listeners {
                add_listener_edges(&mut graph, &mut node, snapshot, source, listener);
            }
        }
    }
    graph
}

fn add_listener_edges(
    graph: &mut DiGraph<String, String>,
    node: &mut impl FnMut(&mut DiGraph<String, String>, String) -> NodeIndex,
    snapshot: &BluePrintSnapshot,
    source: NodeIndex,
    listener: &Listener,
) {
    match &listener.action {
        ListenerAction::RunChunk { chunk } => {
            let chunk_node = node(graph, format!("chunk:{chunk}"));
            graph.add_edge(source, chunk_node, "run".to_string());
            let trigger = node(graph, format!("event:@chunk/{chunk}"));
            graph.add_edge(chunk_node, trigger, "emit".to_string());
        }
        ListenerAction::Match { id } => {
            if let Some(decl) = snapshot.matches.get(id) {
                for (i, case) in decl.cases.iter().enumerate() {
                    let case_node = node(graph, format!("event:{}", case.event));
                    graph.add_edge(source, case_node, format!("case {i}"));
                }
                if let Some(else_event) = &decl.else_event {
                    let else_node = node(graph, format!("event:{else_event}"));
                    graph.add_edge(source, else_node, "else".to_string());
                }
            }
        }
        ListenerAction::Forward { event } => {
            let target = node(graph, format!("event:{event}"));
            graph.add_edge(source, target, "forward".to_string());
        }
        ListenerAction::ResultSink => {
            let sink = node(graph, "result".to_string());
            graph.add_edge(source, sink, "resolve".to_string());
        }
        ListenerAction::Collect { group, slot } => {
            if let Some(decl) = snapshot.collects.get(group) {
                let target = node(graph, format!("event:{}", decl.event));
                graph.add_edge(source, target, format!("collect {slot}"));
            }
        }
        ListenerAction::WhenKeys { id } => {
            if let Some(decl) = snapshot.whens.get(id) {
                let target = node(graph, format!("event:{}", decl.event));
                graph.add_edge(source, target, "when".to_string());
            }
        }
        ListenerAction::Batch { id } => {
            if let Some(decl) = snapshot.batches.get(id) {
                let joined = node(graph, format!("event:{}", decl.event));
                for branch in &decl.branches {
                    let chunk_node = node(graph, format!("chunk:{}", branch.chunk));
                    graph.add_edge(source, chunk_node, format!("branch {}", branch.name));
                    graph.add_edge(chunk_node, joined, "join".to_string());
                }
            }
        }
        ListenerAction::ForEach { id } => {
            if let Some(decl) = snapshot.foreaches.get(id) {
                let target = node(graph, format!("event:{}", decl.send_event));
                graph.add_edge(source, target, "for each".to_string());
            }
        }
        ListenerAction::EndForEach { id } => {
            if let Some(decl) = snapshot.foreaches.get(id) {
                let target = node(graph, format!("event:{}", decl.end_event));
                graph.add_edge(source, target, "join elements".to_string());
            }
        }
    }
}

/// Render a snapshot's topology as a mermaid flowchart
pub fn to_mermaid(snapshot: &BluePrintSnapshot) -> String {
    let graph = snapshot_graph(snapshot);
    let mut out = String::from("flowchart TD\n");
    for idx in graph.node_indices() {
        out.push_str(&format!(
            "    n{}[\"{}\"]\n",
            idx.index(),
            graph[idx].replace('"', "'")
        ));
    }
    for edge in graph.edge_references() {
        out.push_str(&format!(
            "    n{} -->|{}| n{}\n",
            edge.source().index(),
            edge.weight(),
            edge.target().index()
        ));
    }
    out
}
