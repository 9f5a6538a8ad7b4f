//! Crate-wide error type.
//!
//! Every fallible operation in the crate surfaces one of these variants
//! synchronously; nothing is logged at error level or retried internally.

use crate::forest::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForestError {
    #[error("genesis id {0} repeats")]
    DuplicateGenesisId(NodeId),

    #[error("parent {0} not found in forest")]
    UnknownParent(NodeId),

    #[error("node {0} already exists in forest")]
    NodeExists(NodeId),

    #[error("child id {child} must exceed parent id {parent}")]
    NonMonotonicId { parent: NodeId, child: NodeId },

    #[error("query id {0} not found in forest")]
    UnknownQueryId(NodeId),

    #[error("batch shape mismatch: {forests} forests vs {queries} query sets")]
    BatchShapeMismatch { forests: usize, queries: usize },

    /// Parent id 0 or below collides with the wire sentinel for "no parent".
    #[error("parent id {0} cannot be encoded (0 is the no-parent sentinel)")]
    UnencodableParentId(NodeId),

    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForestError>;
