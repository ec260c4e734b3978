use thiserror::Error;

pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors surfaced by the partitioned-frame algebra.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A broadcast operand had the wrong number of columns, or an array-like
    /// operand's length disagrees with the target axis length.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Invalid or incompatible join/label/dtype policy for the operand kind,
    /// or a structurally inconsistent frame was requested.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A no-join alignment was requested but the label sequences differ.
    #[error("alignment failure: {0}")]
    AlignmentFailure(String),

    /// A partition's deferred computation failed in an earlier stage. Raised
    /// only when the partition (or a dependent) is materialized.
    #[error("deferred computation for partition ({row}, {col}) failed: {message}")]
    DeferredPartition {
        row: usize,
        col: usize,
        message: String,
    },

    /// An error from the local table engine, tagged with the coordinates of
    /// the partition it occurred in.
    #[error("local computation failed in partition ({row}, {col})")]
    Local {
        row: usize,
        col: usize,
        #[source]
        source: anyhow::Error,
    },
}

impl FrameError {
    /// Wrap a local-engine error with the grid coordinates it came from.
    pub fn local(row: usize, col: usize, err: impl Into<anyhow::Error>) -> Self {
        FrameError::Local {
            row,
            col,
            source: err.into(),
        }
    }
}
