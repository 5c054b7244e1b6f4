//! Error types for the tree engines.
//!
//! The error surface is intentionally small. "Key not found" is never an
//! error (it is reported through `Option`/`bool` return values), and
//! structural invariant violations are defects caught by debug assertions
//! rather than recoverable conditions. What remains is the batched engine's
//! request plumbing: a request can fail to enqueue or fail to complete only
//! when the scheduler has shut down underneath the caller.

use thiserror::Error;

/// Errors produced by the batched engine's request paths.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request could not be enqueued because the scheduler has shut down.
    #[error("scheduler is shut down")]
    Shutdown,

    /// The completion channel for a request was dropped before a reply
    /// arrived. This happens only if the scheduler died mid-request.
    #[error("request completion channel disconnected")]
    Disconnected,
}

/// Result alias for operations that can observe scheduler shutdown.
pub type Result<T> = std::result::Result<T, Error>;
