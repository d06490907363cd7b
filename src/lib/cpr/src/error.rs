/// All errors the preconditioner can surface to the outer solver.
///
/// Non-convergence of the inner pressure solve is deliberately absent:
/// the tightened solve is best-effort and reports through
/// [`crate::PressureSolveStats`] instead.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CprError {
    /// Malformed update-schedule configuration (unknown interval tag,
    /// zero frequency).
    #[error("bad update schedule configuration: {reason}")]
    BadScheduleConfig { reason: String },
    /// Unknown weight-strategy tag, or a strategy whose required inputs
    /// were not supplied.
    #[error("unsupported weight strategy: {strategy}")]
    UnsupportedStrategy { strategy: String },
    /// A per-cell weight system was singular.
    #[error("singular weight system for cell {cell}")]
    WeightSolveFailure { cell: usize },
    /// The block Jacobian disagrees with the preconditioner's stored
    /// dimensions or sparsity. Indicates a caller bug.
    #[error("dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    /// A pivot block could not be inverted while factorizing the
    /// full-system smoother.
    #[error("singular pivot block in row {row} during smoother factorization")]
    SmootherFactorization { row: usize },
    /// `apply` was called before the first `update`.
    #[error("preconditioner applied before its first update")]
    NotInitialized,
}
