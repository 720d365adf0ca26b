/// Main error type
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// A factor was declared without any level.
    #[error("factor {factor} has an empty level set")]
    EmptyLevelSet {
        /// Index of the offending factor.
        factor: usize,
    },
    /// The candidate set does not contain any point.
    #[error("candidate set is empty")]
    EmptyCandidateSet,
    /// A search parameter is malformed or infeasible.
    #[error("invalid configuration of {parameter}: {reason}")]
    InvalidConfiguration {
        /// Name of the parameter.
        parameter: &'static str,
        /// Human readable description of the violation.
        reason: String,
    },
    /// Two given tensors do not have the same shape.
    #[error(
        "mat {mat1} with shape {shape1:?} and {mat2} with {shape2:?} have different len on dim {dim1} and {dim2}"
    )]
    ShapeMismatch {
        /// Name of matrix 1.
        mat1: &'static str,
        /// Name of matrix 2.
        mat2: &'static str,
        /// Affected shape of dimension on matrix 1.
        dim1: usize,
        /// Affected shape of dimension on matrix 2.
        dim2: usize,
        /// Shape of matrix 1.
        shape1: (usize, usize),
        /// Shape of matrix 2.
        shape2: (usize, usize),
    },
    /// A rank-one downdate of the information matrix would leave it (near) singular.
    #[error("downdate pivot {pivot:e} is below tolerance {tolerance:e}")]
    NearSingular {
        /// Pivot `1 - v^T M^{-1} v` of the downdate.
        pivot: f64,
        /// Required minimum pivot.
        tolerance: f64,
    },
    /// No achievable design makes the information matrix regular.
    #[error("information matrix has rank {rank} but the model has {parameters} parameters")]
    NonEstimableModel {
        /// Numerical rank of the best information matrix found.
        rank: usize,
        /// Number of model parameters.
        parameters: usize,
    },
}

impl Error {
    pub(crate) fn invalid(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            parameter,
            reason: reason.into(),
        }
    }
}

/// Main result type
pub type Result<T> = std::result::Result<T, Error>;
