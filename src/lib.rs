pub mod error;
pub mod graph;
pub mod memory;

// Re-export commonly used types
pub use error::{Error, Result};
pub use graph::{GraphView, TensorDesc, TensorId, MAX_TENSOR_SOURCES};
pub use memory::{
    AllocatorStats, BufferOptions, ChunkAllocator, ChunkPlacement, DefaultStrategy,
    GraphAllocator, GraphPlanner, PlanReport, PlanRequest, PlanState, PlanStrategy,
    ReallocAnalyzer, TensorPlacement, MAX_BUFFERS, MAX_CHUNKS, MAX_FREE_BLOCKS,
    MAX_GRAPH_TENSORS,
};
