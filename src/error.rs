use thiserror::Error;

use crate::middle::flow::{BlockId, EdgeId, FunctionId, NodeId};

/// Broken invariants inside the passes. These never describe a problem with
/// the user's program: they abort compilation of the current component so a
/// half-rewritten graph is never handed to the back end.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InternalError {
    #[error("check placeholder for {edge:?} not found in spliced block {block:?}")]
    PlaceholderMissing { edge: EdgeId, block: BlockId },

    #[error("type check of {checks} values spliced into a binding of {arity} values")]
    CheckCountMismatch { checks: usize, arity: usize },

    #[error("edge {0:?} was expected to have a consumer")]
    MissingConsumer(EdgeId),

    #[error("edge {0:?} was expected to have exactly one producer")]
    MissingProducer(EdgeId),

    #[error("node {0:?} is not a call")]
    NotACall(NodeId),

    #[error("node {node:?} is not in block {block:?}")]
    NodeNotInBlock { node: NodeId, block: BlockId },

    #[error("function {0:?} has no entry binding")]
    MissingBind(FunctionId),

    #[error("unbound variable `{variable}` in `{function}`")]
    UnboundVariable { variable: String, function: String },

    #[error("function `{0}` is defined more than once")]
    DuplicateFunction(String),

    #[error("graph invariants broken: {}", .0.join("; "))]
    BrokenInvariants(Vec<String>),
}

pub type Result<T, E = InternalError> = std::result::Result<T, E>;
