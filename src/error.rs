use thiserror::Error;

/// Error types for the xrfcal-rs library.
#[derive(Error, Debug)]
pub enum XrfError {
    /// Invalid method name, out-of-range parameter or a window too small for the method.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Too few usable measurements left after quality filtering or outlier removal.
    #[error("Insufficient data: {usable} usable measurements, {required} required")]
    InsufficientData { usable: usize, required: usize },

    /// The optimizer did not converge. `last_params` holds the final estimate.
    #[error("Fit did not converge: {message} (last parameters: {last_params:?})")]
    Convergence {
        message: String,
        last_params: Vec<f64>,
    },

    /// Error indicating a mismatch in array dimensions.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Error indicating a singular matrix was encountered.
    #[error("Singular matrix encountered: {0}")]
    SingularMatrix(String),

    /// Error during function evaluation.
    #[error("Function evaluation error: {0}")]
    FunctionEvaluation(String),

    /// Invalid input data.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error for boundary constraint violations.
    #[error("Bounds error: {0}")]
    Bounds(String),

    /// A long-running calculation observed its cancellation token.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<crate::parameters::bounds::BoundsError> for XrfError {
    fn from(err: crate::parameters::bounds::BoundsError) -> Self {
        XrfError::Bounds(format!("{}", err))
    }
}

/// Result type alias for xrfcal-rs operations.
pub type Result<T> = std::result::Result<T, XrfError>;
