//! Flat-list-to-graph compiler and the structural edit operations.
//!
//! The persisted form is a flat parent-pointer list; execution wants an
//! arena with ordered child edges, so the hot path never scans the list.
//! All three edit operations keep the node set a single-rooted forest:
//! unique ids, every parent present, no cycles. Violations are rejected at
//! edit/compile time, never discovered during execution.

use std::collections::HashMap;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use serde_json::Value;
use tracing::debug;

use crate::error::StructuralError;
use crate::flow::{Flow, NodeKind, ParentRef, StoredNode};

/// Id of the synthetic root every flow hangs off. Reserved: authored nodes
/// may name it as a parent but never use it as their own id.
pub const START_NODE_ID: &str = "start";

/// One executable node in the compiled arena.
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub id: String,
    pub kind: NodeKind,
    pub data: Value,
}

impl CompiledNode {
    pub fn is_placeholder(&self) -> bool {
        self.kind == NodeKind::Placeholder
    }
}

/// Executable form of one flow: an arena graph rooted at the synthetic
/// start node, with sibling order preserved on the edges.
#[derive(Debug)]
pub struct CompiledFlow {
    pub flow_id: String,
    graph: StableDiGraph<CompiledNode, u32>,
    index_of: HashMap<String, NodeIndex>,
}

impl CompiledFlow {
    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.index_of.get(id).map(|ix| &self.graph[*ix])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of.contains_key(id)
    }

    /// All children of `id` in authored sibling order, placeholders included.
    pub fn children(&self, id: &str) -> Vec<&CompiledNode> {
        let Some(ix) = self.index_of.get(id) else { return Vec::new() };
        let mut edges: Vec<(u32, NodeIndex)> = self
            .graph
            .edges(*ix)
            .map(|e| (*e.weight(), e.target()))
            .collect();
        edges.sort_by_key(|(order, _)| *order);
        edges.into_iter().map(|(_, target)| &self.graph[target]).collect()
    }

    /// Children that carry executable behavior (synthesized placeholders
    /// filtered out).
    pub fn real_children(&self, id: &str) -> Vec<&CompiledNode> {
        self.children(id)
            .into_iter()
            .filter(|c| !c.is_placeholder())
            .collect()
    }

    /// The first authored node, where a fresh session begins. `None` for an
    /// empty flow.
    pub fn first_node(&self) -> Option<&CompiledNode> {
        self.real_children(START_NODE_ID).into_iter().next()
    }

    /// A terminal node ends the session after executing: it has no authored
    /// children, only its synthesized placeholder.
    pub fn is_terminal(&self, id: &str) -> bool {
        self.real_children(id).is_empty()
    }

    /// Node count excluding the synthetic start (authored nodes plus
    /// synthesized placeholders).
    pub fn node_count(&self) -> usize {
        self.graph.node_count() - 1
    }

    fn add_node(&mut self, node: CompiledNode) -> NodeIndex {
        let id = node.id.clone();
        let ix = self.graph.add_node(node);
        self.index_of.insert(id, ix);
        ix
    }
}

/// Compiles the flat node list into an executable graph.
///
/// Every authored leaf is paired with a synthetic invisible placeholder
/// child so sibling branches keep their shape under layout tooling; the
/// executor skips placeholders entirely.
pub fn compile(flow: &Flow) -> Result<CompiledFlow, StructuralError> {
    let mut compiled = CompiledFlow {
        flow_id: flow.id.clone(),
        graph: StableDiGraph::new(),
        index_of: HashMap::new(),
    };
    compiled.add_node(CompiledNode {
        id: START_NODE_ID.to_string(),
        kind: NodeKind::Placeholder,
        data: Value::Null,
    });

    for node in &flow.nodes {
        if node.id == START_NODE_ID || compiled.contains(&node.id) {
            return Err(StructuralError::DuplicateId(node.id.clone()));
        }
        compiled.add_node(CompiledNode {
            id: node.id.clone(),
            kind: node.kind.clone(),
            data: node.data.clone(),
        });
    }

    // Sibling order is list order: edge weights count up per parent.
    let mut next_order: HashMap<NodeIndex, u32> = HashMap::new();
    for node in &flow.nodes {
        let parent_id = match &node.parent_id {
            ParentRef::Start => START_NODE_ID,
            ParentRef::Node(id) => id.as_str(),
        };
        let parent_ix = *compiled.index_of.get(parent_id).ok_or_else(|| {
            StructuralError::MissingParent {
                node: node.id.clone(),
                parent: parent_id.to_string(),
            }
        })?;
        let child_ix = compiled.index_of[&node.id];
        let order = next_order.entry(parent_ix).or_insert(0);
        compiled.graph.add_edge(parent_ix, child_ix, *order);
        *order += 1;
    }

    if is_cyclic_directed(&compiled.graph) {
        return Err(StructuralError::CycleDetected);
    }

    let leaves: Vec<(String, NodeIndex)> = flow
        .nodes
        .iter()
        .filter_map(|n| {
            let ix = compiled.index_of[&n.id];
            (compiled.graph.edges(ix).next().is_none()).then(|| (n.id.clone(), ix))
        })
        .collect();
    for (id, ix) in leaves {
        let placeholder = compiled.add_node(CompiledNode {
            id: format!("{id}__placeholder"),
            kind: NodeKind::Placeholder,
            data: Value::Null,
        });
        compiled.graph.add_edge(ix, placeholder, 0);
    }

    debug!(flow_id = %flow.id, nodes = compiled.node_count(), "flow compiled");
    Ok(compiled)
}

/// Payload for [`insert`]. The id is assigned by the edit.
#[derive(Debug, Clone)]
pub struct InsertNode {
    pub kind: NodeKind,
    pub parent_id: ParentRef,
    /// `true` adds a sibling branch; `false` makes the new node an
    /// intermediate step by reparenting the parent's previous children onto
    /// it.
    pub as_new_branch: bool,
    pub data: Value,
}

fn position_of(nodes: &[StoredNode], id: &str) -> Option<usize> {
    nodes.iter().position(|n| n.id == id)
}

fn child_positions(nodes: &[StoredNode], parent: &ParentRef) -> Vec<usize> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.parent_id == *parent)
        .map(|(i, _)| i)
        .collect()
}

/// Splices a new node into the flat list immediately after the parent's
/// last existing child (or after the parent itself when childless).
/// Returns the assigned id.
pub fn insert(flow: &mut Flow, new: InsertNode) -> Result<String, StructuralError> {
    let id = uuid::Uuid::new_v4().to_string();
    if let ParentRef::Node(parent) = &new.parent_id {
        if position_of(&flow.nodes, parent).is_none() {
            return Err(StructuralError::MissingParent {
                node: id,
                parent: parent.clone(),
            });
        }
    }

    let children = child_positions(&flow.nodes, &new.parent_id);
    let splice_at = match children.last() {
        Some(last_child) => last_child + 1,
        None => match &new.parent_id {
            ParentRef::Start => 0,
            ParentRef::Node(parent) => {
                position_of(&flow.nodes, parent).expect("parent presence checked above") + 1
            }
        },
    };

    if !new.as_new_branch {
        let new_parent = ParentRef::Node(id.clone());
        for ix in &children {
            flow.nodes[*ix].parent_id = new_parent.clone();
        }
    }

    flow.nodes.insert(
        splice_at,
        StoredNode {
            id: id.clone(),
            parent_id: new.parent_id,
            kind: new.kind,
            data: new.data,
        },
    );
    Ok(id)
}

/// Deletes exactly one node, splicing its direct children onto its former
/// parent. Descendants are preserved.
pub fn remove(flow: &mut Flow, node_id: &str) -> Result<(), StructuralError> {
    let ix = position_of(&flow.nodes, node_id)
        .ok_or_else(|| StructuralError::UnknownNode(node_id.to_string()))?;
    let removed = flow.nodes.remove(ix);
    let orphan_ref = ParentRef::Node(removed.id);
    for node in &mut flow.nodes {
        if node.parent_id == orphan_ref {
            node.parent_id = removed.parent_id.clone();
        }
    }
    Ok(())
}

/// Deletes the node and every transitive descendant.
pub fn remove_subtree(flow: &mut Flow, node_id: &str) -> Result<(), StructuralError> {
    if position_of(&flow.nodes, node_id).is_none() {
        return Err(StructuralError::UnknownNode(node_id.to_string()));
    }

    let mut doomed: Vec<String> = vec![node_id.to_string()];
    let mut frontier = vec![node_id.to_string()];
    while let Some(current) = frontier.pop() {
        let parent = ParentRef::Node(current);
        for node in &flow.nodes {
            if node.parent_id == parent {
                doomed.push(node.id.clone());
                frontier.push(node.id.clone());
            }
        }
    }
    flow.nodes.retain(|n| !doomed.contains(&n.id));
    Ok(())
}
