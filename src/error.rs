//! Error types shared by every likelihood component.

use thiserror::Error;

/// Errors raised while building data, evaluating a likelihood or simulating.
///
/// Every variant is local to the current evaluation: the caller rejects the
/// proposal and restores, nothing here is process-fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraitError {
    /// An index (taxon, character, node or site) past the end of its container.
    #[error("{what} index {index} out of range (only {len} available)")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// A taxon name that is not present in the matrix or on the tree.
    #[error("taxon '{name}' not found")]
    TaxonNotFound { name: String },

    /// Two matrices whose taxon-name sets differ.
    #[error("taxon sets differ: {message}")]
    TaxaMismatch { message: String },

    /// Fewer included characters than the process expects.
    #[error("insufficient data: {requested} sites requested but only {available} included characters")]
    InsufficientData { requested: usize, available: usize },

    /// Degenerate covariance (zero-length edges, non positive-definite matrix).
    #[error("singular model: {message}")]
    SingularModel { message: String },

    /// A parameter value or vector length the model cannot use.
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Malformed input data or tree structure.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Newick parse failure.
    #[error("parse error at byte {position}: {message}")]
    Parse { position: usize, message: String },
}

/// Type alias for results using [`TraitError`].
pub type Result<T> = std::result::Result<T, TraitError>;

impl TraitError {
    /// Create an index-out-of-range error.
    pub fn out_of_range(what: &'static str, index: usize, len: usize) -> Self {
        Self::IndexOutOfRange { what, index, len }
    }

    /// Create a taxon-not-found error.
    pub fn taxon_not_found(name: impl Into<String>) -> Self {
        Self::TaxonNotFound { name: name.into() }
    }

    /// Create a taxa-mismatch error.
    pub fn taxa_mismatch(message: impl Into<String>) -> Self {
        Self::TaxaMismatch {
            message: message.into(),
        }
    }

    /// Create a singular-model error.
    pub fn singular(message: impl Into<String>) -> Self {
        Self::SingularModel {
            message: message.into(),
        }
    }

    /// Create an invalid-parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }
}
