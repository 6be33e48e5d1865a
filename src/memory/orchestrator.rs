use std::collections::HashMap;
use std::fmt;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::{Error, Result};
use crate::graph::{GraphView, TensorId};
use crate::memory::chunks::ChunkAllocator;
use crate::memory::planner::{GraphPlanner, PlanReport, PlanRequest};
use crate::memory::realloc::ReallocAnalyzer;

/// Maximum number of logical buffers one orchestrator may manage
pub const MAX_BUFFERS: usize = 16;

/// Per-buffer configuration supplied to `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferOptions {
    /// Byte alignment for every reservation in the buffer
    pub alignment: usize,
    /// Upper bound for a single physical chunk backing the buffer
    pub max_chunk_size: usize,
}

impl BufferOptions {
    pub fn new(alignment: usize, max_chunk_size: usize) -> Self {
        Self {
            alignment,
            max_chunk_size,
        }
    }
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            alignment: 64,
            max_chunk_size: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum AllocatorState {
    #[strum(serialize = "uninitialized")]
    Uninitialized,
    #[strum(serialize = "initialized")]
    Initialized,
}

/// One contiguous physical range backing part of a buffer's logical space.
#[derive(Debug, Clone, Copy)]
struct BindingSegment {
    chunk: usize,
    chunk_offset: usize,
    size: usize,
    /// First logical byte of the buffer covered by this segment
    logical_start: usize,
}

/// Committed physical backing of one logical buffer. Grows monotonically
/// between releases.
#[derive(Debug, Clone, Default)]
struct BufferBinding {
    committed: usize,
    segments: Vec<BindingSegment>,
}

/// Summary of the orchestrator's committed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub buffer_count: usize,
    /// Committed bytes per buffer
    pub committed_bytes: Vec<usize>,
    /// Physical chunks per buffer
    pub chunk_counts: Vec<usize>,
    /// Sum of all chunk high-water marks across buffers
    pub reserved_bytes: usize,
    /// Times `release` has been called since initialization
    pub release_count: u64,
}

impl AllocatorStats {
    /// Serialize the stats to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Backend(format!("failed to serialize allocator stats: {}", e)))
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocatorStats: {} buffers, {} bytes committed, {} bytes reserved in {} chunks, {} releases",
            self.buffer_count,
            self.committed_bytes.iter().sum::<usize>(),
            self.reserved_bytes,
            self.chunk_counts.iter().sum::<usize>(),
            self.release_count
        )
    }
}

/// Composes the planner, the reallocation analyzer, and one chunk allocator
/// per logical buffer into the allocation front-end used by the inference
/// loop.
///
/// `reserve` establishes (and monotonically grows) the committed sizes and
/// physical chunk bindings; `alloc_graph` is the per-step hot path that
/// reuses the last reserve whenever the resubmitted graph still fits.
/// Every operation validates before mutating, so a failed call leaves the
/// instance exactly as it was.
#[derive(Debug)]
pub struct GraphAllocator {
    state: AllocatorState,
    options: Vec<BufferOptions>,
    chunk_allocators: Vec<ChunkAllocator>,
    bindings: Vec<BufferBinding>,
    /// Placement table from the last full `reserve`
    snapshot: Option<PlanReport>,
    /// Placement table backing the read-only accessors
    current: Option<PlanReport>,
    release_count: u64,
    planner: GraphPlanner,
}

impl Default for GraphAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphAllocator {
    pub fn new() -> Self {
        Self {
            state: AllocatorState::Uninitialized,
            options: Vec::new(),
            chunk_allocators: Vec::new(),
            bindings: Vec::new(),
            snapshot: None,
            current: None,
            release_count: 0,
            planner: GraphPlanner::new(),
        }
    }

    /// Configure one chunk allocator per logical buffer and clear all
    /// committed state.
    pub fn initialize(&mut self, buffers: &[BufferOptions]) -> Result<()> {
        if buffers.is_empty() || buffers.len() > MAX_BUFFERS {
            return Err(Error::InvalidArgument(format!(
                "buffer count must be between 1 and {}, got {}",
                MAX_BUFFERS,
                buffers.len()
            )));
        }
        let chunk_allocators = buffers
            .iter()
            .map(|options| ChunkAllocator::new(options.alignment, options.max_chunk_size))
            .collect::<Result<Vec<_>>>()?;

        self.options = buffers.to_vec();
        self.chunk_allocators = chunk_allocators;
        self.bindings = vec![BufferBinding::default(); buffers.len()];
        self.snapshot = None;
        self.current = None;
        self.release_count = 0;
        self.state = AllocatorState::Initialized;
        debug!("initialized allocator with {} buffers", buffers.len());
        Ok(())
    }

    fn require_initialized(&self) -> Result<()> {
        if self.state != AllocatorState::Initialized {
            return Err(Error::InvalidArgument(format!(
                "allocator is {}; call initialize first",
                self.state
            )));
        }
        Ok(())
    }

    fn alignments(&self) -> Vec<usize> {
        self.options.iter().map(|options| options.alignment).collect()
    }

    fn max_chunk_sizes(&self) -> Vec<usize> {
        self.options
            .iter()
            .map(|options| options.max_chunk_size)
            .collect()
    }

    /// Run the planner without touching any committed state and return the
    /// per-buffer byte requirements. Used for worst-case sizing.
    pub fn reserve_size_only(
        &self,
        graph: &GraphView,
        leaf_buffers: Option<&HashMap<TensorId, usize>>,
        node_buffers: Option<&HashMap<TensorId, usize>>,
    ) -> Result<Vec<usize>> {
        self.require_initialized()?;
        let report = self.plan(graph, leaf_buffers, node_buffers, false)?;
        Ok(report.buffer_totals)
    }

    /// Run the planner and commit the result: each buffer's committed size
    /// is raised to the maximum of its prior commitment and the new
    /// requirement, growth is carved from the buffer's chunk allocator, and
    /// the placement table becomes the new reserve snapshot.
    pub fn reserve(
        &mut self,
        graph: &GraphView,
        leaf_buffers: Option<&HashMap<TensorId, usize>>,
        node_buffers: Option<&HashMap<TensorId, usize>>,
    ) -> Result<PlanReport> {
        self.require_initialized()?;
        let report = self.plan(graph, leaf_buffers, node_buffers, true)?;

        // stage growth on scratch copies so nothing commits on failure
        let mut staged_allocators = self.chunk_allocators.clone();
        let mut staged_bindings = self.bindings.clone();
        for (buffer_id, &required) in report.buffer_totals.iter().enumerate() {
            let binding = &mut staged_bindings[buffer_id];
            if required > binding.committed {
                let delta = required - binding.committed;
                grow_binding(
                    &mut staged_allocators[buffer_id],
                    binding,
                    delta,
                    &self.options[buffer_id],
                )?;
                trace!(
                    "buffer {} grown by {} bytes to {} committed",
                    buffer_id,
                    delta,
                    binding.committed
                );
            }
        }

        self.chunk_allocators = staged_allocators;
        self.bindings = staged_bindings;
        self.snapshot = Some(report.clone());
        self.current = Some(report.clone());
        debug!("reserve committed totals {:?}", report.buffer_totals);
        Ok(report)
    }

    /// The per-inference-step hot path. Reuses the last reserve snapshot
    /// when the resubmitted graph has the same shape and still fits the
    /// reserved placements; otherwise recomputes sizes and either succeeds
    /// within the committed bytes, grows a single-buffer configuration in
    /// place, or demands an explicit `reserve`.
    pub fn alloc_graph(&mut self, graph: &GraphView) -> Result<()> {
        self.require_initialized()?;

        if let Some(snapshot) = &self.snapshot {
            if snapshot.leaf_count == graph.leafs.len()
                && snapshot.node_count == graph.nodes.len()
            {
                if !ReallocAnalyzer::needs_replan(graph, snapshot) {
                    trace!("alloc_graph reusing last reserve snapshot");
                    self.current = Some(snapshot.clone());
                    return Ok(());
                }
                // same shape, new sizes: keep the snapshot's buffer
                // assignment as a placement hint
                let (leaf_hint, node_hint) = self.binding_hints(graph, snapshot);
                let report = self.plan(graph, Some(&leaf_hint), Some(&node_hint), false)?;
                return self.commit_alloc(graph, report);
            }
        }

        let report = self.plan(graph, None, None, false)?;
        self.commit_alloc(graph, report)
    }

    fn commit_alloc(&mut self, graph: &GraphView, report: PlanReport) -> Result<()> {
        let oversized = report
            .buffer_totals
            .iter()
            .zip(self.bindings.iter())
            .position(|(&required, binding)| required > binding.committed);

        match oversized {
            None => {
                self.current = Some(report);
                Ok(())
            }
            Some(buffer_id) if self.bindings.len() == 1 => {
                // a single-buffer configuration grows transparently
                debug!(
                    "alloc_graph growing buffer {} from {} to {} bytes",
                    buffer_id, self.bindings[buffer_id].committed, report.buffer_totals[buffer_id]
                );
                self.reserve(graph, None, None)?;
                Ok(())
            }
            Some(buffer_id) => Err(Error::Backend(format!(
                "graph needs {} bytes in buffer {} but only {} are committed; call reserve first",
                report.buffer_totals[buffer_id],
                buffer_id,
                self.bindings[buffer_id].committed
            ))),
        }
    }

    /// Build explicit buffer-id maps from a snapshot's placements.
    fn binding_hints(
        &self,
        graph: &GraphView,
        snapshot: &PlanReport,
    ) -> (HashMap<TensorId, usize>, HashMap<TensorId, usize>) {
        let hint = |descs: &[crate::graph::TensorDesc]| {
            descs
                .iter()
                .filter_map(|desc| {
                    snapshot
                        .placements
                        .get(&desc.id)
                        .map(|placement| (desc.id, placement.buffer_id))
                })
                .collect::<HashMap<_, _>>()
        };
        (hint(&graph.leafs), hint(&graph.nodes))
    }

    fn plan(
        &self,
        graph: &GraphView,
        leaf_buffers: Option<&HashMap<TensorId, usize>>,
        node_buffers: Option<&HashMap<TensorId, usize>>,
        with_chunk_split: bool,
    ) -> Result<PlanReport> {
        let alignments = self.alignments();
        let max_chunk_sizes = self.max_chunk_sizes();
        let mut request =
            PlanRequest::new(graph, self.options.len()).with_alignments(&alignments);
        if with_chunk_split {
            request = request.with_max_chunk_sizes(&max_chunk_sizes);
        }
        if let Some(bindings) = leaf_buffers {
            request = request.with_leaf_buffers(bindings);
        }
        if let Some(bindings) = node_buffers {
            request = request.with_node_buffers(bindings);
        }
        self.planner.plan(&request)
    }

    /// Unbind every chunk allocation, clear committed sizes and snapshots,
    /// and keep the per-buffer configuration.
    pub fn release(&mut self) -> Result<()> {
        self.require_initialized()?;
        for allocator in &mut self.chunk_allocators {
            allocator.reset();
        }
        self.bindings = vec![BufferBinding::default(); self.options.len()];
        self.snapshot = None;
        self.current = None;
        self.release_count += 1;
        debug!("released all buffers (release #{})", self.release_count);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state == AllocatorState::Initialized
    }

    pub fn buffer_count(&self) -> usize {
        self.options.len()
    }

    /// Committed bytes for a buffer.
    pub fn committed_size(&self, buffer_id: usize) -> Option<usize> {
        self.bindings.get(buffer_id).map(|binding| binding.committed)
    }

    /// Number of physical chunks backing a buffer.
    pub fn chunk_count(&self, buffer_id: usize) -> Option<usize> {
        self.chunk_allocators
            .get(buffer_id)
            .map(|allocator| allocator.chunk_count())
    }

    /// Bytes the physical backend must provide for one chunk of a buffer.
    pub fn chunk_size(&self, buffer_id: usize, chunk: usize) -> Option<usize> {
        self.chunk_allocators
            .get(buffer_id)?
            .chunk_size(chunk)
    }

    /// Logical buffer a tensor was placed in by the latest call.
    pub fn tensor_buffer(&self, id: TensorId) -> Option<usize> {
        self.current
            .as_ref()?
            .placements
            .get(&id)
            .map(|placement| placement.buffer_id)
    }

    /// Bytes held for a tensor by the latest call.
    pub fn tensor_alloc_size(&self, id: TensorId) -> Option<usize> {
        self.current
            .as_ref()?
            .placements
            .get(&id)
            .map(|placement| placement.reserved)
    }

    /// Physical `(chunk, offset)` of a tensor's first byte, resolved through
    /// the buffer's binding segments.
    pub fn tensor_chunk(&self, id: TensorId) -> Option<(usize, usize)> {
        let placement = self.current.as_ref()?.placements.get(&id)?;
        let binding = self.bindings.get(placement.buffer_id)?;
        binding
            .segments
            .iter()
            .find(|segment| {
                placement.offset >= segment.logical_start
                    && placement.offset < segment.logical_start + segment.size
            })
            .map(|segment| {
                (
                    segment.chunk,
                    segment.chunk_offset + (placement.offset - segment.logical_start),
                )
            })
    }

    pub fn release_count(&self) -> u64 {
        self.release_count
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            buffer_count: self.options.len(),
            committed_bytes: self
                .bindings
                .iter()
                .map(|binding| binding.committed)
                .collect(),
            chunk_counts: self
                .chunk_allocators
                .iter()
                .map(|allocator| allocator.chunk_count())
                .collect(),
            reserved_bytes: self
                .chunk_allocators
                .iter()
                .map(|allocator| allocator.total_reserved())
                .sum(),
            release_count: self.release_count,
        }
    }
}

/// Carve `delta` bytes of fresh physical space for a buffer, in
/// alignment-rounded pieces no larger than the buffer's chunk ceiling, and
/// append the resulting segments to the binding.
fn grow_binding(
    allocator: &mut ChunkAllocator,
    binding: &mut BufferBinding,
    delta: usize,
    options: &BufferOptions,
) -> Result<()> {
    let max_piece = (options.max_chunk_size / options.alignment).max(1) * options.alignment;
    let mut remaining = delta;
    while remaining > 0 {
        let piece = remaining.min(max_piece);
        let placement = allocator.allocate(piece)?;
        binding.segments.push(BindingSegment {
            chunk: placement.chunk,
            chunk_offset: placement.offset,
            size: placement.size,
            logical_start: binding.committed,
        });
        binding.committed = binding
            .committed
            .checked_add(placement.size)
            .ok_or_else(|| Error::Backend("committed size overflows".to_string()))?;
        remaining = remaining.saturating_sub(placement.size);
    }
    Ok(())
}
