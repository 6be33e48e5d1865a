use std::collections::HashMap;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::{Error, Result};
use crate::graph::{GraphView, TensorId};
use crate::memory::chunks::{align_up, FreeList};

/// Maximum number of tensors (leafs plus nodes) in one graph submission
pub const MAX_GRAPH_TENSORS: usize = 4096;

/// Virtual capacity of a buffer layout's growable tail block
const LAYOUT_TAIL_CAPACITY: usize = usize::MAX / 2;

/// Planner phases, named for failure diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PlanPhase {
    #[strum(serialize = "seed_leafs")]
    SeedLeafs,
    #[strum(serialize = "count_references")]
    CountReferences,
    #[strum(serialize = "allocate_inputs")]
    AllocateInputs,
    #[strum(serialize = "plan_nodes")]
    PlanNodes,
    #[strum(serialize = "finalize")]
    Finalize,
}

/// Per-tensor working state derived from a descriptor for one planning call.
#[derive(Debug, Clone)]
pub struct TensorRecord {
    /// Declared size in bytes
    pub size: usize,
    /// Alias target, when the tensor is a view
    pub view_source: Option<TensorId>,
    /// Graph-declared output; never returned to the free list
    pub is_output: bool,
    /// False for views, zero-size, and externally-owned tensors
    pub allocatable: bool,
    /// Whether a byte range (possibly empty) has been assigned
    pub allocated: bool,
    /// Whether the byte range has been returned to the free list
    pub freed: bool,
    /// Target logical buffer
    pub buffer_id: usize,
    /// Byte offset within the buffer
    pub offset: usize,
    /// Bytes actually held; may exceed `size` due to alignment
    pub reserved: usize,
    /// Consumers not yet planned
    pub n_children: usize,
    /// View aliases not yet planned
    pub n_views: usize,
}

/// Logical byte space of one buffer during a planning call. Tracks free
/// ranges and the high-water mark independently of any physical chunks.
#[derive(Debug)]
pub struct BufferLayout {
    free: FreeList,
    bytes_used: usize,
    alignment: usize,
}

impl BufferLayout {
    fn new(alignment: usize) -> Self {
        Self {
            free: FreeList::with_block(0, LAYOUT_TAIL_CAPACITY),
            bytes_used: 0,
            alignment,
        }
    }

    /// High-water mark: the total bytes this buffer requires.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Reserve `size` bytes, preferring the smallest interior free block
    /// and falling back to tail growth. Returns `(offset, reserved)`.
    pub fn reserve(&mut self, size: usize) -> Result<(usize, usize)> {
        let aligned = align_up(size, self.alignment).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "size {} cannot be aligned to {}",
                size, self.alignment
            ))
        })?;
        let block_idx = match self.free.best_interior_fit(aligned) {
            Some(idx) => idx,
            None => {
                let blocks = self.free.blocks();
                match blocks.last() {
                    Some(last) if last.size >= aligned => blocks.len() - 1,
                    _ => {
                        return Err(Error::Backend(format!(
                            "buffer layout exhausted reserving {} bytes",
                            aligned
                        )))
                    }
                }
            }
        };
        let offset = self.free.take(block_idx, aligned);
        let end = offset
            .checked_add(aligned)
            .ok_or_else(|| Error::Backend("reserved range end overflows".to_string()))?;
        if end > self.bytes_used {
            self.bytes_used = end;
        }
        Ok((offset, aligned))
    }

    /// Return a reserved range to the free list.
    pub fn release(&mut self, offset: usize, reserved: usize) -> Result<()> {
        self.free.insert(offset, reserved)
    }
}

/// Inputs for one planning call.
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    /// The graph submission to plan
    pub graph: &'a GraphView,
    /// Number of logical buffers available
    pub buffer_count: usize,
    /// Per-buffer byte alignments; defaults to 1 when absent
    pub alignments: Option<&'a [usize]>,
    /// Explicit leaf-to-buffer bindings, honored as-is
    pub leaf_buffers: Option<&'a HashMap<TensorId, usize>>,
    /// Explicit node-to-buffer bindings, honored as-is
    pub node_buffers: Option<&'a HashMap<TensorId, usize>>,
    /// Per-buffer maximum chunk sizes; enables the finalize chunk split
    pub max_chunk_sizes: Option<&'a [usize]>,
}

impl<'a> PlanRequest<'a> {
    pub fn new(graph: &'a GraphView, buffer_count: usize) -> Self {
        Self {
            graph,
            buffer_count,
            alignments: None,
            leaf_buffers: None,
            node_buffers: None,
            max_chunk_sizes: None,
        }
    }

    pub fn with_alignments(mut self, alignments: &'a [usize]) -> Self {
        self.alignments = Some(alignments);
        self
    }

    pub fn with_leaf_buffers(mut self, bindings: &'a HashMap<TensorId, usize>) -> Self {
        self.leaf_buffers = Some(bindings);
        self
    }

    pub fn with_node_buffers(mut self, bindings: &'a HashMap<TensorId, usize>) -> Self {
        self.node_buffers = Some(bindings);
        self
    }

    pub fn with_max_chunk_sizes(mut self, sizes: &'a [usize]) -> Self {
        self.max_chunk_sizes = Some(sizes);
        self
    }

    fn alignment(&self, buffer_id: usize) -> usize {
        self.alignments
            .and_then(|alignments| alignments.get(buffer_id).copied())
            .unwrap_or(1)
    }
}

/// Final placement of one tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorPlacement {
    pub tensor_id: TensorId,
    pub buffer_id: usize,
    pub offset: usize,
    /// Bytes held for the tensor; zero for views, zero-size, and
    /// externally-owned tensors
    pub reserved: usize,
    /// Set when the tensor aliases another tensor's byte range
    pub alias_of: Option<TensorId>,
}

/// Complete result of one planning call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    /// Placement per tensor id
    pub placements: HashMap<TensorId, TensorPlacement>,
    /// Required bytes per logical buffer
    pub buffer_totals: Vec<usize>,
    /// Physical chunk-size sequences per buffer, when a max-chunk-size
    /// split was requested; sizing only, binding happens in the orchestrator
    pub chunk_splits: Option<Vec<Vec<usize>>>,
    /// Leaf count of the planned graph, for fast-path shape comparison
    pub leaf_count: usize,
    /// Node count of the planned graph, for fast-path shape comparison
    pub node_count: usize,
}

impl PlanReport {
    /// Sum of all buffer requirements.
    pub fn total_bytes(&self) -> usize {
        self.buffer_totals.iter().sum()
    }

    /// Serialize the report to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Backend(format!("failed to serialize plan report: {}", e)))
    }
}

/// Mutable working state threaded through the planner phases. Custom
/// strategies operate on this state through the same helpers the default
/// phases use.
#[derive(Debug)]
pub struct PlanState {
    /// One record per tensor in the submission
    pub records: HashMap<TensorId, TensorRecord>,
    layouts: Vec<BufferLayout>,
}

impl PlanState {
    fn new(request: &PlanRequest) -> Self {
        let layouts = (0..request.buffer_count)
            .map(|buffer_id| BufferLayout::new(request.alignment(buffer_id)))
            .collect();
        Self {
            records: HashMap::with_capacity(request.graph.tensor_count()),
            layouts,
        }
    }

    /// Immutable access to a buffer layout.
    pub fn layout(&self, buffer_id: usize) -> Option<&BufferLayout> {
        self.layouts.get(buffer_id)
    }

    pub fn record(&self, id: TensorId) -> Result<&TensorRecord> {
        self.records
            .get(&id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown tensor id {}", id)))
    }

    pub fn record_mut(&mut self, id: TensorId) -> Result<&mut TensorRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown tensor id {}", id)))
    }

    /// Register a record for a descriptor, resolving its target buffer from
    /// an optional explicit binding map.
    pub fn register(
        &mut self,
        desc: &crate::graph::TensorDesc,
        bindings: Option<&HashMap<TensorId, usize>>,
        buffer_count: usize,
    ) -> Result<()> {
        if self.records.len() >= MAX_GRAPH_TENSORS {
            return Err(Error::Backend(format!(
                "graph exceeds {} tensors",
                MAX_GRAPH_TENSORS
            )));
        }
        let buffer_id = match bindings.and_then(|map| map.get(&desc.id)).copied() {
            Some(buffer_id) => {
                if buffer_id >= buffer_count {
                    return Err(Error::InvalidArgument(format!(
                        "tensor {} ({}) bound to buffer {} but only {} buffers exist",
                        desc.id, desc.name, buffer_id, buffer_count
                    )));
                }
                buffer_id
            }
            None => 0,
        };
        let allocatable =
            !desc.is_view() && !desc.has_external_data && desc.alloc_size > 0;
        // zero-size and externally-owned tensors are no-ops at offset 0
        let allocated = !allocatable && !desc.is_view();
        let record = TensorRecord {
            size: desc.alloc_size,
            view_source: desc.view_source,
            is_output: desc.is_output,
            allocatable,
            allocated,
            freed: false,
            buffer_id,
            offset: 0,
            reserved: 0,
            n_children: 0,
            n_views: 0,
        };
        if self.records.insert(desc.id, record).is_some() {
            return Err(Error::InvalidArgument(format!(
                "duplicate tensor id {} ({})",
                desc.id, desc.name
            )));
        }
        Ok(())
    }

    /// Reserve the tensor's declared bytes from its target buffer.
    pub fn reserve_tensor(&mut self, id: TensorId) -> Result<()> {
        let (buffer_id, size) = {
            let record = self.record(id)?;
            (record.buffer_id, record.size)
        };
        let layout = self.layouts.get_mut(buffer_id).ok_or_else(|| {
            Error::InvalidArgument(format!("tensor {} targets unknown buffer {}", id, buffer_id))
        })?;
        let (offset, reserved) = layout.reserve(size)?;
        let record = self.record_mut(id)?;
        record.allocated = true;
        record.offset = offset;
        record.reserved = reserved;
        trace!(
            "tensor {} reserved {} bytes at buffer {} offset {}",
            id,
            reserved,
            buffer_id,
            offset
        );
        Ok(())
    }

    /// Record a tensor as sharing its view source's byte range.
    pub fn alias_tensor(&mut self, id: TensorId, source: TensorId) -> Result<()> {
        let (buffer_id, offset, source_allocated) = {
            let source_record = self.record(source)?;
            (
                source_record.buffer_id,
                source_record.offset,
                source_record.allocated,
            )
        };
        if !source_allocated {
            return Err(Error::InvalidArgument(format!(
                "tensor {} is a view of tensor {} which was never allocated",
                id, source
            )));
        }
        let record = self.record_mut(id)?;
        record.buffer_id = buffer_id;
        record.offset = offset;
        record.allocated = true;
        trace!("tensor {} aliases tensor {} at offset {}", id, source, offset);
        Ok(())
    }

    /// Return a tensor's bytes to its buffer's free list, following the
    /// view-source chain transitively: releasing a view decrements its
    /// source's view count and releases the source once both counts reach
    /// zero.
    pub fn release_tensor(&mut self, id: TensorId) -> Result<()> {
        let (view_source, allocated, freed, reserved, buffer_id, offset) = {
            let record = self.record(id)?;
            (
                record.view_source,
                record.allocated,
                record.freed,
                record.reserved,
                record.buffer_id,
                record.offset,
            )
        };
        if let Some(source) = view_source {
            let release_source = {
                let source_record = self.record_mut(source)?;
                source_record.n_views =
                    source_record.n_views.checked_sub(1).ok_or_else(|| {
                        Error::Backend(format!("view reference underflow on tensor {}", source))
                    })?;
                source_record.n_children == 0
                    && source_record.n_views == 0
                    && !source_record.is_output
            };
            if release_source {
                self.release_tensor(source)?;
            }
        } else if allocated && !freed && reserved > 0 {
            let layout = self.layouts.get_mut(buffer_id).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "tensor {} targets unknown buffer {}",
                    id, buffer_id
                ))
            })?;
            layout.release(offset, reserved)?;
            self.record_mut(id)?.freed = true;
            trace!(
                "tensor {} released {} bytes at buffer {} offset {}",
                id,
                reserved,
                buffer_id,
                offset
            );
        }
        Ok(())
    }

    /// Decrement a source's outstanding reference count for one planned
    /// consumer and release it once nothing still needs its bytes.
    pub fn consume_source(&mut self, source: TensorId, consumer_is_view: bool) -> Result<()> {
        let release = {
            let record = self.record_mut(source)?;
            if consumer_is_view {
                record.n_views = record.n_views.checked_sub(1).ok_or_else(|| {
                    Error::Backend(format!("view reference underflow on tensor {}", source))
                })?;
            } else {
                record.n_children = record.n_children.checked_sub(1).ok_or_else(|| {
                    Error::Backend(format!("child reference underflow on tensor {}", source))
                })?;
            }
            record.n_children == 0 && record.n_views == 0 && !record.is_output
        };
        if release {
            self.release_tensor(source)?;
        }
        Ok(())
    }
}

/// Overridable planning phases. Every default method implements the
/// standard liveness-driven behavior; implementors may replace any subset
/// and delegate back to the `default_*` functions for the rest.
pub trait PlanStrategy {
    /// Register leaf tensors and allocate the allocatable ones.
    fn seed_leafs(&self, state: &mut PlanState, request: &PlanRequest) -> Result<()> {
        default_seed_leafs(state, request)
    }

    /// Register node tensors and count outstanding consumer references.
    fn count_references(&self, state: &mut PlanState, request: &PlanRequest) -> Result<()> {
        default_count_references(state, request)
    }

    /// Allocate nodes flagged as inputs that carry an explicit binding.
    fn allocate_inputs(&self, state: &mut PlanState, request: &PlanRequest) -> Result<()> {
        default_allocate_inputs(state, request)
    }

    /// Visit nodes in graph order, reserving and releasing byte ranges.
    fn plan_nodes(&self, state: &mut PlanState, request: &PlanRequest) -> Result<()> {
        default_plan_nodes(state, request)
    }

    /// Collect totals and placements into the final report.
    fn finalize(&self, state: &mut PlanState, request: &PlanRequest) -> Result<PlanReport> {
        default_finalize(state, request)
    }
}

/// The standard planning behavior with no overrides.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStrategy;

impl PlanStrategy for DefaultStrategy {}

/// Default phase 1: register every leaf, honor explicit bindings, and carve
/// bytes for the allocatable ones.
pub fn default_seed_leafs(state: &mut PlanState, request: &PlanRequest) -> Result<()> {
    for desc in &request.graph.leafs {
        state.register(desc, request.leaf_buffers, request.buffer_count)?;
        if let Some(source) = desc.view_source {
            state.alias_tensor(desc.id, source)?;
        } else if state.record(desc.id)?.allocatable {
            state.reserve_tensor(desc.id)?;
        }
    }
    Ok(())
}

/// Default phase 2: register every node, then count each source's
/// outstanding consumers. A view consumer counts toward `n_views`; views
/// additionally pin their view source.
pub fn default_count_references(state: &mut PlanState, request: &PlanRequest) -> Result<()> {
    for desc in &request.graph.nodes {
        state.register(desc, request.node_buffers, request.buffer_count)?;
    }
    for desc in &request.graph.nodes {
        for source in desc.source_ids() {
            let record = state.record_mut(source)?;
            if desc.is_view() {
                record.n_views += 1;
            } else {
                record.n_children += 1;
            }
        }
        if let Some(view_source) = desc.view_source {
            state.record_mut(view_source)?.n_views += 1;
        }
    }
    Ok(())
}

/// Default phase 3: allocate explicitly bound input nodes up front so later
/// phases treat them as already placed.
pub fn default_allocate_inputs(state: &mut PlanState, request: &PlanRequest) -> Result<()> {
    let bindings = match request.node_buffers {
        Some(bindings) => bindings,
        None => return Ok(()),
    };
    for desc in &request.graph.nodes {
        if !desc.is_input || !bindings.contains_key(&desc.id) {
            continue;
        }
        let record = state.record(desc.id)?;
        if record.allocatable && !record.allocated {
            state.reserve_tensor(desc.id)?;
        }
    }
    Ok(())
}

/// Default phase 4: the core liveness walk. Each node either aliases its
/// view source or reserves fresh bytes, then releases every source whose
/// last consumer it was.
pub fn default_plan_nodes(state: &mut PlanState, request: &PlanRequest) -> Result<()> {
    for desc in &request.graph.nodes {
        if let Some(source) = desc.view_source {
            state.alias_tensor(desc.id, source)?;
        } else {
            let record = state.record(desc.id)?;
            if record.allocatable && !record.allocated {
                state.reserve_tensor(desc.id)?;
            }
        }

        for source in desc.source_ids() {
            if !state.record(source)?.allocated {
                return Err(Error::InvalidArgument(format!(
                    "tensor {} ({}) consumes tensor {} which was never allocated",
                    desc.id, desc.name, source
                )));
            }
            state.consume_source(source, desc.is_view())?;
        }
    }
    Ok(())
}

/// Default phase 5: report per-buffer totals and placements; optionally
/// partition each total into physical chunk sizes.
pub fn default_finalize(state: &mut PlanState, request: &PlanRequest) -> Result<PlanReport> {
    let buffer_totals: Vec<usize> = (0..request.buffer_count)
        .map(|buffer_id| {
            state
                .layout(buffer_id)
                .map(|layout| layout.bytes_used())
                .unwrap_or(0)
        })
        .collect();

    let chunk_splits = match request.max_chunk_sizes {
        Some(max_chunk_sizes) => {
            let mut splits = Vec::with_capacity(buffer_totals.len());
            for (buffer_id, &total) in buffer_totals.iter().enumerate() {
                let max_chunk_size = max_chunk_sizes.get(buffer_id).copied().unwrap_or(0);
                if max_chunk_size == 0 {
                    return Err(Error::InvalidArgument(format!(
                        "max chunk size for buffer {} must be greater than zero",
                        buffer_id
                    )));
                }
                splits.push(split_chunk_sizes(total, max_chunk_size));
            }
            Some(splits)
        }
        None => None,
    };

    let placements = state
        .records
        .iter()
        .filter(|(_, record)| record.allocated)
        .map(|(&tensor_id, record)| {
            (
                tensor_id,
                TensorPlacement {
                    tensor_id,
                    buffer_id: record.buffer_id,
                    offset: record.offset,
                    reserved: record.reserved,
                    alias_of: record.view_source,
                },
            )
        })
        .collect();

    Ok(PlanReport {
        placements,
        buffer_totals,
        chunk_splits,
        leaf_count: request.graph.leafs.len(),
        node_count: request.graph.nodes.len(),
    })
}

/// Partition `total` bytes into the smallest number of chunks not exceeding
/// `max_chunk_size`, ceiling-divided with the remainder front-loaded one
/// byte per chunk.
pub(crate) fn split_chunk_sizes(total: usize, max_chunk_size: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    let count = total.div_ceil(max_chunk_size);
    let base = total / count;
    let remainder = total % count;
    (0..count)
        .map(|idx| if idx < remainder { base + 1 } else { base })
        .collect()
}

/// Single-pass, liveness-driven buffer planner.
///
/// For each logical buffer the planner computes a byte offset per tensor
/// and a total byte requirement without touching physical memory. A
/// tensor's bytes return to the free list as soon as its last consumer has
/// been planned, so tensors with disjoint lifetimes share the same ranges.
#[derive(Debug, Default)]
pub struct GraphPlanner;

impl GraphPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan with the default strategy.
    pub fn plan(&self, request: &PlanRequest) -> Result<PlanReport> {
        self.plan_with(&DefaultStrategy, request)
    }

    /// Plan with caller-supplied phase overrides.
    pub fn plan_with(
        &self,
        strategy: &dyn PlanStrategy,
        request: &PlanRequest,
    ) -> Result<PlanReport> {
        request.graph.validate()?;
        if request.buffer_count == 0 {
            return Err(Error::InvalidArgument(
                "buffer count must be greater than zero".to_string(),
            ));
        }
        if let Some(alignments) = request.alignments {
            if alignments.len() != request.buffer_count {
                return Err(Error::InvalidArgument(format!(
                    "{} alignments supplied for {} buffers",
                    alignments.len(),
                    request.buffer_count
                )));
            }
        }
        if let Some(max_chunk_sizes) = request.max_chunk_sizes {
            if max_chunk_sizes.len() != request.buffer_count {
                return Err(Error::InvalidArgument(format!(
                    "{} max chunk sizes supplied for {} buffers",
                    max_chunk_sizes.len(),
                    request.buffer_count
                )));
            }
        }
        if request.graph.tensor_count() > MAX_GRAPH_TENSORS {
            return Err(Error::Backend(format!(
                "graph exceeds {} tensors",
                MAX_GRAPH_TENSORS
            )));
        }

        let mut state = PlanState::new(request);
        strategy
            .seed_leafs(&mut state, request)
            .map_err(|e| in_phase(PlanPhase::SeedLeafs, e))?;
        strategy
            .count_references(&mut state, request)
            .map_err(|e| in_phase(PlanPhase::CountReferences, e))?;
        strategy
            .allocate_inputs(&mut state, request)
            .map_err(|e| in_phase(PlanPhase::AllocateInputs, e))?;
        strategy
            .plan_nodes(&mut state, request)
            .map_err(|e| in_phase(PlanPhase::PlanNodes, e))?;
        let report = strategy
            .finalize(&mut state, request)
            .map_err(|e| in_phase(PlanPhase::Finalize, e))?;

        debug!(
            "planned {} tensors across {} buffers, totals {:?}",
            request.graph.tensor_count(),
            request.buffer_count,
            report.buffer_totals
        );
        Ok(report)
    }
}

fn in_phase(phase: PlanPhase, error: Error) -> Error {
    match error {
        Error::InvalidArgument(msg) => Error::InvalidArgument(format!("{}: {}", phase, msg)),
        Error::Backend(msg) => Error::Backend(format!("{}: {}", phase, msg)),
    }
}
