use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::error::{Error, Result};

/// Unique identifier for a tensor within one graph submission
pub type TensorId = u64;

/// Maximum number of producer tensors a single node may consume
pub const MAX_TENSOR_SOURCES: usize = 4;

/// Descriptor for one tensor in a graph submission.
///
/// Descriptors are plain data supplied by the caller (a computation-graph
/// builder). The planner never mutates them; it derives its own per-call
/// records from them.
#[derive(Debug, Clone)]
pub struct TensorDesc {
    /// Tensor ID, unique within one graph submission
    pub id: TensorId,
    /// Name for diagnostics
    pub name: String,
    /// Required backing bytes
    pub alloc_size: usize,
    /// Producer tensor ids consumed by this tensor
    pub sources: [Option<TensorId>; MAX_TENSOR_SOURCES],
    /// When set, this tensor occupies exactly the same bytes as the
    /// referenced tensor and gets no allocation of its own
    pub view_source: Option<TensorId>,
    /// Graph-declared input
    pub is_input: bool,
    /// Graph-declared output; its bytes are never returned to the free list
    pub is_output: bool,
    /// Backing memory is owned by the caller; the planner skips allocation
    pub has_external_data: bool,
}

impl TensorDesc {
    /// Create a leaf tensor descriptor with no producers.
    pub fn leaf(id: TensorId, alloc_size: usize) -> Self {
        Self {
            id,
            name: format!("leaf_{}", id),
            alloc_size,
            sources: [None; MAX_TENSOR_SOURCES],
            view_source: None,
            is_input: false,
            is_output: false,
            has_external_data: false,
        }
    }

    /// Create a node tensor descriptor consuming up to four producers.
    pub fn node(id: TensorId, alloc_size: usize, sources: &[TensorId]) -> Self {
        assert!(
            sources.len() <= MAX_TENSOR_SOURCES,
            "a node may consume at most {} sources",
            MAX_TENSOR_SOURCES
        );
        let mut src = [None; MAX_TENSOR_SOURCES];
        for (slot, &source) in src.iter_mut().zip(sources.iter()) {
            *slot = Some(source);
        }
        Self {
            id,
            name: format!("node_{}", id),
            alloc_size,
            sources: src,
            view_source: None,
            is_input: false,
            is_output: false,
            has_external_data: false,
        }
    }

    /// Create a node that aliases another tensor's byte range.
    pub fn view(id: TensorId, alloc_size: usize, source: TensorId) -> Self {
        let mut desc = Self::node(id, alloc_size, &[source]);
        desc.name = format!("view_{}", id);
        desc.view_source = Some(source);
        desc
    }

    /// Set the tensor name used in diagnostics.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Mark the tensor as a graph input.
    pub fn as_input(mut self) -> Self {
        self.is_input = true;
        self
    }

    /// Mark the tensor as a graph output.
    pub fn as_output(mut self) -> Self {
        self.is_output = true;
        self
    }

    /// Mark the tensor's backing memory as caller-owned.
    pub fn with_external_data(mut self) -> Self {
        self.has_external_data = true;
        self
    }

    /// Whether this tensor aliases another tensor's bytes.
    pub fn is_view(&self) -> bool {
        self.view_source.is_some()
    }

    /// Iterate over the populated source ids.
    pub fn source_ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.sources.iter().flatten().copied()
    }
}

/// Ordered view over one graph submission: leaf tensors followed by node
/// tensors in execution order. The planner visits nodes in exactly this
/// order; the caller is responsible for providing a valid topological order.
#[derive(Debug, Clone, Default)]
pub struct GraphView {
    pub leafs: Vec<TensorDesc>,
    pub nodes: Vec<TensorDesc>,
}

impl GraphView {
    pub fn new(leafs: Vec<TensorDesc>, nodes: Vec<TensorDesc>) -> Self {
        Self { leafs, nodes }
    }

    /// Total number of tensors (leafs plus nodes) in the submission.
    pub fn tensor_count(&self) -> usize {
        self.leafs.len() + self.nodes.len()
    }

    /// Iterate over all descriptors, leafs first.
    pub fn iter(&self) -> impl Iterator<Item = &TensorDesc> {
        self.leafs.iter().chain(self.nodes.iter())
    }

    /// Look up a descriptor by tensor id.
    pub fn get(&self, id: TensorId) -> Option<&TensorDesc> {
        self.iter().find(|desc| desc.id == id)
    }

    /// Validate the structural invariants of the submission: unique tensor
    /// ids, resolvable source and view references, no self-views, and an
    /// acyclic dependency structure.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::with_capacity(self.tensor_count());
        for desc in self.iter() {
            if !ids.insert(desc.id) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate tensor id {} ({})",
                    desc.id, desc.name
                )));
            }
        }

        for desc in self.iter() {
            for source in desc.source_ids() {
                if !ids.contains(&source) {
                    return Err(Error::InvalidArgument(format!(
                        "tensor {} ({}) references unknown source {}",
                        desc.id, desc.name, source
                    )));
                }
            }
            if let Some(view_source) = desc.view_source {
                if view_source == desc.id {
                    return Err(Error::InvalidArgument(format!(
                        "tensor {} ({}) is a view of itself",
                        desc.id, desc.name
                    )));
                }
                if !ids.contains(&view_source) {
                    return Err(Error::InvalidArgument(format!(
                        "tensor {} ({}) is a view of unknown tensor {}",
                        desc.id, desc.name, view_source
                    )));
                }
            }
        }

        self.check_acyclic()
    }

    /// Reject cyclic dependency structures. All planning is a single forward
    /// pass, so a cycle can never be satisfied.
    fn check_acyclic(&self) -> Result<()> {
        let mut dag = DiGraph::<TensorId, ()>::with_capacity(self.tensor_count(), 0);
        let mut indices = HashMap::with_capacity(self.tensor_count());
        for desc in self.iter() {
            indices.insert(desc.id, dag.add_node(desc.id));
        }
        for desc in self.iter() {
            let consumer = indices[&desc.id];
            for source in desc.source_ids() {
                dag.add_edge(indices[&source], consumer, ());
            }
            if let Some(view_source) = desc.view_source {
                dag.add_edge(indices[&view_source], consumer, ());
            }
        }
        if is_cyclic_directed(&dag) {
            return Err(Error::InvalidArgument(
                "graph submission contains a dependency cycle".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_sources() {
        let node = TensorDesc::node(5, 128, &[1, 2]);
        let sources: Vec<_> = node.source_ids().collect();
        assert_eq!(sources, vec![1, 2]);
        assert!(!node.is_view());
    }

    #[test]
    fn test_view_marks_source() {
        let view = TensorDesc::view(3, 64, 1);
        assert!(view.is_view());
        assert_eq!(view.view_source, Some(1));
    }

    #[test]
    fn test_validate_accepts_chain() {
        let graph = GraphView::new(
            vec![TensorDesc::leaf(1, 64)],
            vec![
                TensorDesc::node(2, 64, &[1]),
                TensorDesc::node(3, 64, &[2]).as_output(),
            ],
        );
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let graph = GraphView::new(
            vec![TensorDesc::leaf(1, 64), TensorDesc::leaf(1, 32)],
            vec![],
        );
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_source() {
        let graph = GraphView::new(vec![], vec![TensorDesc::node(2, 64, &[99])]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_view_source() {
        let graph = GraphView::new(vec![TensorDesc::leaf(1, 64)], vec![TensorDesc::view(2, 64, 7)]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let graph = GraphView::new(
            vec![],
            vec![TensorDesc::node(1, 64, &[2]), TensorDesc::node(2, 64, &[1])],
        );
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_self_view() {
        let graph = GraphView::new(vec![], vec![TensorDesc::view(1, 64, 1)]);
        assert!(graph.validate().is_err());
    }
}
