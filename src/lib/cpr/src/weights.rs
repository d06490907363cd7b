use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::UpdateContext;
use crate::error::CprError;
use crate::matrix::BlockMatrix;

/// How the per-cell pressure-extraction weights are computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightStrategy {
    /// Invert the transposed diagonal block of the Jacobian.
    QuasiImpes,
    /// Invert the accumulation-term Jacobian (mass-storage coupling
    /// only); requires an [`AccumulationSource`] in the update context.
    TrueImpes,
    /// Caller-provided callback fills the weights from physical state.
    Analytical,
    /// Select the first (pressure) equation of every cell.
    None,
}

impl FromStr for WeightStrategy {
    type Err = CprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quasi_impes" => Ok(WeightStrategy::QuasiImpes),
            "true_impes" => Ok(WeightStrategy::TrueImpes),
            "analytical" => Ok(WeightStrategy::Analytical),
            "none" => Ok(WeightStrategy::None),
            other => Err(CprError::UnsupportedStrategy {
                strategy: other.to_string(),
            }),
        }
    }
}

/// Post-solve normalization of each weight vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightScaling {
    /// Normalize to unit Euclidean length.
    Unit,
    /// Leave the solved weights unscaled.
    None,
}

/// Read-only view of the accumulation-term partial derivatives used by
/// the true-IMPES strategy. `partial(cell, equation, variable)` is
/// ∂acc[equation]/∂x[variable] at `cell`, as carried by the caller's
/// automatic-differentiation numbers. This crate only reads partials,
/// it never constructs them.
pub trait AccumulationSource: Sync {
    fn n_cells(&self) -> usize;
    fn block_size(&self) -> usize;
    fn partial(&self, cell: usize, equation: usize, variable: usize) -> f64;
}

/// Flat accumulation-partial storage: cell-major, then equation-major,
/// so `partial(c, e, v)` lives at `c·b² + e·b + v`.
pub struct DenseAccumulation {
    n_cells: usize,
    block_size: usize,
    partials: Vec<f64>,
}

impl DenseAccumulation {
    pub fn new(n_cells: usize, block_size: usize, partials: Vec<f64>) -> Self {
        assert_eq!(
            partials.len(),
            n_cells * block_size * block_size,
            "accumulation partial length"
        );
        DenseAccumulation {
            n_cells,
            block_size,
            partials,
        }
    }
}

impl AccumulationSource for DenseAccumulation {
    fn n_cells(&self) -> usize {
        self.n_cells
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn partial(&self, cell: usize, equation: usize, variable: usize) -> f64 {
        let b = self.block_size;
        self.partials[cell * b * b + equation * b + variable]
    }
}

/// Callback for [`WeightStrategy::Analytical`]: fill the `b × n` weight
/// matrix directly from physical state, one column per cell.
pub trait AnalyticalWeights {
    fn fill(&self, weights: &mut DMatrix<f64>);
}

impl<F: Fn(&mut DMatrix<f64>)> AnalyticalWeights for F {
    fn fill(&self, weights: &mut DMatrix<f64>) {
        self(weights)
    }
}

/// Recompute the pressure-extraction weights for every cell.
///
/// Cells are independent; the quasi-/true-IMPES paths run their small
/// dense solves cell-parallel in batches of at least `min_batch`.
pub(crate) fn compute_weights(
    weights: &mut DMatrix<f64>,
    jacobian: &BlockMatrix,
    strategy: WeightStrategy,
    scaling: WeightScaling,
    analytical: Option<&dyn AnalyticalWeights>,
    context: &UpdateContext<'_>,
    min_batch: usize,
) -> Result<(), CprError> {
    let b = jacobian.block_size();
    debug_assert_eq!(weights.nrows(), b);
    debug_assert_eq!(weights.ncols(), jacobian.n_cells());
    let min_batch = min_batch.max(1);

    match strategy {
        WeightStrategy::QuasiImpes => {
            weights
                .as_mut_slice()
                .par_chunks_mut(b)
                .with_min_len(min_batch)
                .enumerate()
                .try_for_each(|(cell, column)| {
                    let diag = jacobian
                        .diag_block(cell)
                        .ok_or(CprError::WeightSolveFailure { cell })?;
                    // D_c = J[c,c]ᵀ; the stored block is column-major.
                    let d_t = DMatrix::from_fn(b, b, |i, j| diag[i * b + j]);
                    solve_unit_pressure_rhs(d_t, cell, column)?;
                    scale_column(column, scaling);
                    Ok(())
                })?;
        }
        WeightStrategy::TrueImpes => {
            let acc = context
                .accumulation
                .ok_or_else(|| CprError::UnsupportedStrategy {
                    strategy: "true_impes without an accumulation source".to_string(),
                })?;
            if acc.n_cells() != jacobian.n_cells() || acc.block_size() != b {
                return Err(CprError::DimensionMismatch {
                    expected: jacobian.n_cells() * b,
                    found: acc.n_cells() * acc.block_size(),
                });
            }
            let p_scale = context.pressure_scale();
            weights
                .as_mut_slice()
                .par_chunks_mut(b)
                .with_min_len(min_batch)
                .enumerate()
                .try_for_each(|(cell, column)| {
                    // Row 0 of the cell system carries the scaled
                    // pressure partials, rows 1.. the remaining
                    // variables: M[i][j] = ∂acc[j]/∂x[i].
                    let m = DMatrix::from_fn(b, b, |i, j| {
                        let p = acc.partial(cell, j, i);
                        if i == 0 { p_scale * p } else { p }
                    });
                    solve_unit_pressure_rhs(m, cell, column)?;
                    scale_column(column, scaling);
                    Ok(())
                })?;
        }
        WeightStrategy::Analytical => {
            let f = analytical.ok_or_else(|| CprError::UnsupportedStrategy {
                strategy: "analytical without an attached weight callback".to_string(),
            })?;
            f.fill(weights);
            if scaling == WeightScaling::Unit {
                weights
                    .as_mut_slice()
                    .par_chunks_mut(b)
                    .with_min_len(min_batch)
                    .for_each(|column| scale_column(column, scaling));
            }
        }
        WeightStrategy::None => {
            weights
                .as_mut_slice()
                .par_chunks_mut(b)
                .with_min_len(min_batch)
                .for_each(|column| {
                    column.fill(0.0);
                    column[0] = 1.0;
                });
        }
    }
    Ok(())
}

/// Solve `M w = e₁` and store `w` into the cell's weight column.
fn solve_unit_pressure_rhs(
    m: DMatrix<f64>,
    cell: usize,
    column: &mut [f64],
) -> Result<(), CprError> {
    let mut rhs = DVector::zeros(m.nrows());
    rhs[0] = 1.0;
    let solved = m
        .lu()
        .solve(&rhs)
        .ok_or(CprError::WeightSolveFailure { cell })?;
    column.copy_from_slice(solved.as_slice());
    Ok(())
}

fn scale_column(column: &mut [f64], scaling: WeightScaling) {
    if scaling == WeightScaling::Unit {
        let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in column.iter_mut() {
                *v /= norm;
            }
        }
    }
}
