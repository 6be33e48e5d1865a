use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories reported by the planner and allocators.
///
/// `InvalidArgument` covers malformed input: bad graph shape, duplicate or
/// dangling tensor ids, zero sizes, capacity misconfiguration. `Backend`
/// covers internal capacity exhaustion: too many chunks or free blocks,
/// arithmetic overflow, and free-list corruption detected during release.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend failure: {0}")]
    Backend(String),
}
