use log::debug;

use crate::graph::{GraphView, TensorDesc};
use crate::memory::planner::PlanReport;

/// Decides whether a previously committed plan can be reused verbatim for a
/// freshly submitted graph, letting the orchestrator skip a full planner
/// pass when an identical-shaped graph comes back — the common case of
/// repeated inference steps with the same architecture.
#[derive(Debug, Default)]
pub struct ReallocAnalyzer;

impl ReallocAnalyzer {
    /// A full replan is needed when any tensor id is absent from the prior
    /// allocation, a tensor's size now exceeds the bytes reserved for it,
    /// or a referenced source cannot be found among the prior placements.
    ///
    /// A shrinking size never forces a replan; the unused tail bytes keep
    /// whatever contents they had.
    pub fn needs_replan(graph: &GraphView, prior: &PlanReport) -> bool {
        for desc in graph.iter() {
            if Self::tensor_needs_realloc(desc, prior) {
                return true;
            }
            for source in desc.source_ids() {
                if !prior.placements.contains_key(&source) {
                    debug!(
                        "replan: source {} of tensor {} absent from prior allocation",
                        source, desc.id
                    );
                    return true;
                }
            }
            if let Some(view_source) = desc.view_source {
                if !prior.placements.contains_key(&view_source) {
                    debug!(
                        "replan: view source {} of tensor {} absent from prior allocation",
                        view_source, desc.id
                    );
                    return true;
                }
            }
        }
        false
    }

    fn tensor_needs_realloc(desc: &TensorDesc, prior: &PlanReport) -> bool {
        let placement = match prior.placements.get(&desc.id) {
            Some(placement) => placement,
            None => {
                debug!("replan: tensor {} absent from prior allocation", desc.id);
                return true;
            }
        };
        // views and externally-owned tensors hold no bytes of their own
        let effective_size = if desc.is_view() || desc.has_external_data {
            0
        } else {
            desc.alloc_size
        };
        if effective_size > placement.reserved {
            debug!(
                "replan: tensor {} needs {} bytes but only {} reserved",
                desc.id, effective_size, placement.reserved
            );
            return true;
        }
        false
    }
}
