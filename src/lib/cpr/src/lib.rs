// File: `src/lib/cpr/src/lib.rs`
//
// CONSTRAINED PRESSURE RESIDUAL (CPR) PRECONDITIONING
// ===================================================
// Two-stage preconditioner for the block-sparse Jacobians of fully
// implicit reservoir simulation. Conventions used throughout:
//
// Block size b: primary unknowns per cell (= conservation equations
//   per cell), pressure first. Typical b in {2, 3, 4, 5, 8}.
// Unknown ordering: cell-major, so the scalar vector index of variable
//   j in cell i is i*b + j. Index 0 within a block is the pressure.
// Block storage: column-major b×b, equation = block row, variable =
//   block column. Block column 0 is the pressure column.
//
// Stage one restricts the block residual to a scalar pressure system
// via dynamically recomputed per-cell weights and solves it with an
// externally supplied algebraic multigrid. Stage two corrects the
// residual with the lifted pressure update and applies a full-system
// smoother (block ILU(0) by default). The pressure hierarchy rebuild
// is rationed by an update schedule; in between, only matrix values
// are refreshed.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sprs::CsMat;

mod apply;
mod error;
mod ilu;
mod matrix;
mod pressure;
mod schedule;
mod solver;
mod update;
mod weights;

pub use error::CprError;
pub use ilu::BlockIlu0;
pub use matrix::BlockMatrix;
pub use schedule::{ProgressRecorder, UpdateInterval, UpdateSchedule};
pub use solver::PressureSolveStats;
pub use weights::{
    AccumulationSource, AnalyticalWeights, DenseAccumulation, WeightScaling, WeightStrategy,
};

use solver::FgmresWorkspace;

/// The full-system linear operator, as exposed by the outer solver's
/// linear-system abstraction. For a plain reservoir system this is the
/// block Jacobian itself; multi-block systems (wells, facility
/// equations) expose their reservoir coupling through it.
pub trait LinearOperator {
    /// Scalar operator dimension.
    fn rows(&self) -> usize;
    /// `y = A * x`.
    fn apply(&self, y: &mut DVector<f64>, x: &DVector<f64>);
}

/// The pressure-subsystem solver collaborator, conventionally an
/// algebraic multigrid. Multigrid construction is outside this crate;
/// the customary default collaborator is a smoothed-aggregation AMG
/// running V-cycles with one forward Gauss–Seidel pre- and post-smooth,
/// at most 10 levels and a max coarse size of 10.
pub trait PressureSolver {
    /// Build the full hierarchy for a (new) pressure matrix.
    fn setup(&mut self, a_p: &CsMat<f64>, r_p: &DVector<f64>) -> Result<(), CprError>;
    /// Refresh numerics for updated values on the unchanged sparsity;
    /// coarsening is reused.
    fn partial_refresh(&mut self, a_p: &CsMat<f64>, r_p: &DVector<f64>) -> Result<(), CprError>;
    /// One cycle: `x ≈ A_p⁻¹ r`. Overwrites `x`.
    fn apply(&mut self, x: &mut DVector<f64>, r: &DVector<f64>);
}

/// The full-system smoother collaborator. Rebuilt on every `update`
/// call; applied once per `apply`.
pub trait SystemPreconditioner {
    fn setup(&mut self, jacobian: &BlockMatrix) -> Result<(), CprError>;
    /// `x = S⁻¹ r`. Overwrites `x`.
    fn apply(&mut self, x: &mut DVector<f64>, r: &DVector<f64>);
}

/// Per-update inputs that live outside the linear system itself.
#[derive(Clone, Copy, Default)]
pub struct UpdateContext<'a> {
    /// Scaling of the pressure variable relative to the remaining
    /// unknowns; enters the first row of the true-IMPES weight systems.
    /// `None` means unscaled (factor 1).
    pub pressure_scale: Option<f64>,
    /// Accumulation-term partials for the true-IMPES strategy.
    pub accumulation: Option<&'a dyn AccumulationSource>,
}

impl<'a> UpdateContext<'a> {
    pub(crate) fn pressure_scale(&self) -> f64 {
        self.pressure_scale.unwrap_or(1.0)
    }
}

/// CPR configuration. Serializable; the analytical weight callback is
/// attached separately through
/// [`CprPreconditioner::with_analytical_weights`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CprConfig {
    /// Weight-computation method for the pressure restriction.
    pub strategy: WeightStrategy,
    /// Post-solve normalization of the per-cell weight vectors.
    pub weight_scaling: WeightScaling,
    /// Schedule for full pressure-hierarchy rebuilds.
    pub update_interval: UpdateInterval,
    pub update_frequency: usize,
    /// Schedule for cheap value-only pressure refreshes.
    pub update_interval_partial: UpdateInterval,
    pub update_frequency_partial: usize,
    /// Whether the partial-refresh branch is taken at all.
    pub partial_update: bool,
    /// Relative tolerance for the inner flexible-GMRES tightening of
    /// the pressure solve. `None` leaves a single multigrid cycle.
    pub p_rtol: Option<f64>,
    /// Minimum rayon batch size for the cell-parallel loops.
    pub min_batch_size: usize,
}

impl Default for CprConfig {
    fn default() -> Self {
        CprConfig {
            strategy: WeightStrategy::QuasiImpes,
            weight_scaling: WeightScaling::Unit,
            update_interval: UpdateInterval::Iteration,
            update_frequency: 1,
            update_interval_partial: UpdateInterval::Iteration,
            update_frequency_partial: 1,
            partial_update: true,
            p_rtol: None,
            min_batch_size: 64,
        }
    }
}

impl CprConfig {
    /// Validate schedule parameters. A zero frequency would poison the
    /// modulo test in the scheduler.
    pub fn validate(&self) -> Result<(), CprError> {
        if self.update_frequency == 0 {
            return Err(CprError::BadScheduleConfig {
                reason: "update_frequency must be at least 1".to_string(),
            });
        }
        if self.update_frequency_partial == 0 {
            return Err(CprError::BadScheduleConfig {
                reason: "update_frequency_partial must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn amg_schedule(&self) -> UpdateSchedule {
        UpdateSchedule::new(self.update_interval, self.update_frequency)
    }

    pub(crate) fn partial_schedule(&self) -> UpdateSchedule {
        UpdateSchedule::new(self.update_interval_partial, self.update_frequency_partial)
    }
}

/// Buffers and matrices sized on the first `update`; absent until then.
pub(crate) struct CprState {
    pub(crate) n_cells: usize,
    pub(crate) block_size: usize,
    /// Scalar pressure matrix over the Jacobian's exact sparsity.
    pub(crate) a_p: CsMat<f64>,
    /// Per-cell weight vectors, one `b`-column per cell.
    pub(crate) weights: DMatrix<f64>,
    /// Restricted (pressure) residual, length `n_cells`.
    pub(crate) r_p: DVector<f64>,
    /// Pressure correction; doubles as the warm start of the next
    /// tightened pressure solve.
    pub(crate) dp: DVector<f64>,
    /// Full-system scratch, length `n_cells * block_size`.
    pub(crate) buf: DVector<f64>,
}

impl CprState {
    pub(crate) fn allocate(jacobian: &BlockMatrix) -> Self {
        let n = jacobian.n_cells();
        let b = jacobian.block_size();
        CprState {
            n_cells: n,
            block_size: b,
            a_p: jacobian.pressure_shell(),
            weights: DMatrix::zeros(b, n),
            r_p: DVector::zeros(n),
            dp: DVector::zeros(n),
            buf: DVector::zeros(n * b),
        }
    }
}

/// Constrained pressure residual preconditioner.
///
/// Opaque to the Krylov solver consuming it: `update` per nonlinear
/// iteration, `apply` per Krylov iteration, `rows` for the operator
/// dimension. Owns its pressure matrix, weights and work buffers; the
/// caller's Jacobian and operator are only borrowed for the duration
/// of a single call.
pub struct CprPreconditioner {
    config: CprConfig,
    pressure: Box<dyn PressureSolver>,
    smoother: Box<dyn SystemPreconditioner>,
    analytical: Option<Box<dyn AnalyticalWeights>>,
    state: Option<CprState>,
    fgmres: Option<FgmresWorkspace>,
    last_pressure_solve: Option<PressureSolveStats>,
}

impl CprPreconditioner {
    /// Build from a pressure-subsystem solver (the AMG collaborator)
    /// and an explicit full-system smoother.
    pub fn new(
        config: CprConfig,
        pressure: Box<dyn PressureSolver>,
        smoother: Box<dyn SystemPreconditioner>,
    ) -> Result<Self, CprError> {
        config.validate()?;
        Ok(CprPreconditioner {
            config,
            pressure,
            smoother,
            analytical: None,
            state: None,
            fgmres: None,
            last_pressure_solve: None,
        })
    }

    /// Build with the default full-system smoother, block ILU(0).
    pub fn with_default_smoother(
        config: CprConfig,
        pressure: Box<dyn PressureSolver>,
    ) -> Result<Self, CprError> {
        Self::new(config, pressure, Box::new(BlockIlu0::new()))
    }

    /// Attach the weight callback used by
    /// [`WeightStrategy::Analytical`].
    pub fn with_analytical_weights(mut self, weights: Box<dyn AnalyticalWeights>) -> Self {
        self.analytical = Some(weights);
        self
    }

    pub fn config(&self) -> &CprConfig {
        &self.config
    }

    /// Scalar operator dimension `n_cells * block_size`, or 0 before
    /// the first `update`.
    pub fn rows(&self) -> usize {
        self.state
            .as_ref()
            .map(|s| s.n_cells * s.block_size)
            .unwrap_or(0)
    }

    /// Statistics of the most recent pressure solve, if any.
    pub fn last_pressure_solve(&self) -> Option<&PressureSolveStats> {
        self.last_pressure_solve.as_ref()
    }

    /// Drop all sized state so the next `update` re-allocates. Needed
    /// when the outer solver changes the Jacobian sparsity (re-gridding
    /// between report steps).
    pub fn reset(&mut self) {
        self.state = None;
        self.fgmres = None;
        self.last_pressure_solve = None;
    }
}
