use thiserror::Error;

/// Unified error type for `tapgp` operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TapError {
    /// Raised when the solver configuration is rejected before a run starts.
    #[error("invalid solver configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Raised when a solve is attempted while a network rebuild is pending.
    #[error("network must be rebuilt after a cost model change before solving")]
    StaleNetworkState,

    /// Raised when no path connects an OD pair with positive demand.
    #[error("no path connects origin {origin} to destination {destination}")]
    InfeasiblePath { origin: usize, destination: usize },

    /// Raised when the objective or gap evaluates to a non-finite value.
    #[error("encountered non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Raised when a link or OD pair refers to a node outside the network.
    #[error("node {node} is out of range for a network with {node_count} nodes")]
    UnknownNode { node: usize, node_count: usize },

    /// Raised when link cost parameters are negative or non-finite.
    #[error("link {link} has invalid {parameter}: {value}")]
    InvalidLink {
        link: usize,
        parameter: &'static str,
        value: f64,
    },

    /// Raised when an OD demand is negative or non-finite.
    #[error("OD pair {origin}->{destination} has invalid demand {demand}")]
    InvalidDemand {
        origin: usize,
        destination: usize,
        demand: f64,
    },

    /// Raised when supplied vectors have incompatible lengths.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },
}

impl TapError {
    /// Helper to format a [`DimensionMismatch`](TapError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for configuration rejections.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Helper for non-finite objective or gap values.
    pub fn numerical(context: &'static str) -> Self {
        Self::NumericalError { context }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, TapError>;
