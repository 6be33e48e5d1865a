use std::collections::HashMap;

use graph_alloc::memory::planner::{
    default_plan_nodes, default_seed_leafs, PlanState,
};
use graph_alloc::{
    GraphPlanner, GraphView, PlanReport, PlanRequest, PlanStrategy, ReallocAnalyzer, TensorDesc,
    Result,
};

// Build a layered feed-forward graph: each layer consumes the previous
// activation and produces a new one of the same size.
fn layered_graph(layers: usize, activation_size: usize) -> GraphView {
    let leaf = TensorDesc::leaf(0, activation_size).with_name("input");
    let mut nodes = Vec::with_capacity(layers);
    for layer in 0..layers {
        let id = (layer + 1) as u64;
        let mut node = TensorDesc::node(id, activation_size, &[id - 1])
            .with_name(&format!("layer_{}", layer));
        if layer == layers - 1 {
            node = node.as_output();
        }
        nodes.push(node);
    }
    GraphView::new(vec![leaf], nodes)
}

fn plan(graph: &GraphView) -> PlanReport {
    GraphPlanner::new()
        .plan(&PlanRequest::new(graph, 1))
        .unwrap()
}

#[test]
fn test_deep_chain_memory_stays_bounded() {
    // liveness-driven reuse keeps a 64-layer chain at two live activations
    // instead of 65
    let graph = layered_graph(64, 1024);
    let report = plan(&graph);
    assert_eq!(report.buffer_totals, vec![2 * 1024]);
}

#[test]
fn test_wide_fanout_keeps_shared_source_live() {
    // one producer feeding four consumers: the producer's bytes stay live
    // until the last consumer is planned
    let leaf = TensorDesc::leaf(0, 256);
    let consumers: Vec<_> = (1..=4)
        .map(|id| TensorDesc::node(id, 256, &[0]))
        .collect();
    let join = TensorDesc::node(5, 256, &[1, 2, 3, 4]).as_output();
    let mut nodes = consumers;
    nodes.push(join);
    let graph = GraphView::new(vec![leaf], nodes);

    let report = plan(&graph);
    let leaf_offset = report.placements[&0].offset;
    for id in 1..=4u64 {
        assert_ne!(
            report.placements[&id].offset, leaf_offset,
            "consumer {} must not overlap its still-live source",
            id
        );
    }
    // the join is planned after every consumer released the leaf
    assert_eq!(report.placements[&5].offset, leaf_offset);
}

#[test]
fn test_view_chain_releases_transitively() {
    // A <- view V1 <- view V2 <- C: planning C's consumer must walk the
    // view chain back to A and release its bytes
    let graph = GraphView::new(
        vec![TensorDesc::leaf(1, 512)],
        vec![
            TensorDesc::view(2, 512, 1),
            TensorDesc::view(3, 512, 2),
            TensorDesc::node(4, 512, &[3]),
            TensorDesc::node(5, 512, &[4]).as_output(),
        ],
    );
    let report = plan(&graph);
    assert_eq!(report.placements[&2].offset, report.placements[&1].offset);
    assert_eq!(report.placements[&3].offset, report.placements[&1].offset);
    assert_eq!(report.placements[&2].reserved, 0);
    assert_eq!(report.placements[&3].reserved, 0);
    // node 5 reuses the leaf's region, proving the chain was released
    assert_eq!(report.placements[&5].offset, report.placements[&1].offset);
    assert_eq!(report.buffer_totals, vec![1024]);
}

#[test]
fn test_multi_buffer_totals_are_independent() {
    let graph = GraphView::new(
        vec![
            TensorDesc::leaf(1, 128).with_name("weights"),
            TensorDesc::leaf(2, 64).with_name("input"),
        ],
        vec![TensorDesc::node(3, 64, &[1, 2]).as_output()],
    );
    let mut leaf_buffers = HashMap::new();
    leaf_buffers.insert(1u64, 0usize);
    leaf_buffers.insert(2u64, 1usize);
    let mut node_buffers = HashMap::new();
    node_buffers.insert(3u64, 1usize);

    let request = PlanRequest::new(&graph, 2)
        .with_leaf_buffers(&leaf_buffers)
        .with_node_buffers(&node_buffers);
    let report = GraphPlanner::new().plan(&request).unwrap();
    assert_eq!(report.buffer_totals[0], 128);
    assert_eq!(report.buffer_totals[1], 128);
}

// A strategy that pins every leaf into the highest-numbered buffer while
// keeping the default behavior for all remaining phases.
struct PinLeafsLast;

impl PlanStrategy for PinLeafsLast {
    fn seed_leafs(&self, state: &mut PlanState, request: &PlanRequest) -> Result<()> {
        for desc in &request.graph.leafs {
            state.register(desc, None, request.buffer_count)?;
            state.record_mut(desc.id)?.buffer_id = request.buffer_count - 1;
            if state.record(desc.id)?.allocatable {
                state.reserve_tensor(desc.id)?;
            }
        }
        Ok(())
    }
}

#[test]
fn test_custom_strategy_overrides_single_phase() {
    let graph = GraphView::new(
        vec![TensorDesc::leaf(1, 64)],
        vec![TensorDesc::node(2, 64, &[1]).as_output()],
    );
    let request = PlanRequest::new(&graph, 2);
    let report = GraphPlanner::new()
        .plan_with(&PinLeafsLast, &request)
        .unwrap();
    assert_eq!(report.placements[&1].buffer_id, 1);
    // nodes still follow the default assignment
    assert_eq!(report.placements[&2].buffer_id, 0);
    assert_eq!(report.buffer_totals, vec![64, 64]);
}

// A strategy that delegates back to the default phase functions explicitly.
struct Delegating;

impl PlanStrategy for Delegating {
    fn seed_leafs(&self, state: &mut PlanState, request: &PlanRequest) -> Result<()> {
        default_seed_leafs(state, request)
    }

    fn plan_nodes(&self, state: &mut PlanState, request: &PlanRequest) -> Result<()> {
        default_plan_nodes(state, request)
    }
}

#[test]
fn test_delegating_strategy_matches_default() {
    let graph = layered_graph(8, 256);
    let request = PlanRequest::new(&graph, 1);
    let default_report = GraphPlanner::new().plan(&request).unwrap();
    let delegating_report = GraphPlanner::new().plan_with(&Delegating, &request).unwrap();
    assert_eq!(default_report.buffer_totals, delegating_report.buffer_totals);
}

#[test]
fn test_report_serializes_to_json() {
    let report = plan(&layered_graph(4, 128));
    let json = report.to_json().unwrap();
    assert!(json.contains("buffer_totals"));
    let parsed: PlanReport = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.buffer_totals, report.buffer_totals);
    assert_eq!(parsed.placements.len(), report.placements.len());
}

#[test]
fn test_replan_decision_across_submissions() {
    let first = layered_graph(8, 256);
    let report = plan(&first);

    // same shape, smaller activations: reusable
    let smaller = layered_graph(8, 128);
    assert!(!ReallocAnalyzer::needs_replan(&smaller, &report));

    // same shape, larger activations: must replan
    let larger = layered_graph(8, 512);
    assert!(ReallocAnalyzer::needs_replan(&larger, &report));

    // different depth: ids shift, must replan
    let deeper = layered_graph(9, 256);
    assert!(ReallocAnalyzer::needs_replan(&deeper, &report));
}

#[test]
fn test_duplicate_ids_rejected_before_planning() {
    let graph = GraphView::new(
        vec![TensorDesc::leaf(1, 64)],
        vec![TensorDesc::node(1, 64, &[1])],
    );
    assert!(GraphPlanner::new().plan(&PlanRequest::new(&graph, 1)).is_err());
}
