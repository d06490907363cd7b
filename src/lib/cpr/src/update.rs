use log::debug;
use nalgebra::DVector;

use crate::error::CprError;
use crate::matrix::BlockMatrix;
use crate::pressure::update_pressure_values;
use crate::schedule::ProgressRecorder;
use crate::weights::compute_weights;
use crate::{CprPreconditioner, CprState, UpdateContext};

impl CprPreconditioner {
    /// Refresh the preconditioner for a new linearization.
    ///
    /// The first call sizes every buffer from the Jacobian; later calls
    /// mutate in place and expect the same dimensions and sparsity. Per
    /// call the scheduler picks one of three branches:
    ///
    /// - full: weights, pressure values, smoother, pressure hierarchy;
    /// - partial: weights, pressure values, smoother, value-only
    ///   refresh of the pressure solver;
    /// - neither: only the smoother is rebuilt.
    ///
    /// The residual is only consulted for its dimensions and as the
    /// advisory right-hand side handed to the pressure-solver setup.
    pub fn update(
        &mut self,
        jacobian: &BlockMatrix,
        residual: &DVector<f64>,
        context: &UpdateContext<'_>,
        recorder: &ProgressRecorder,
    ) -> Result<(), CprError> {
        if residual.len() != jacobian.rows() {
            return Err(CprError::DimensionMismatch {
                expected: jacobian.rows(),
                found: residual.len(),
            });
        }

        let first_call = self.state.is_none();
        if first_call {
            self.state = Some(CprState::allocate(jacobian));
        } else {
            let state = self.state.as_ref().unwrap();
            if state.n_cells != jacobian.n_cells() || state.block_size != jacobian.block_size() {
                return Err(CprError::DimensionMismatch {
                    expected: state.n_cells * state.block_size,
                    found: jacobian.rows(),
                });
            }
            if state.a_p.nnz() != jacobian.nnz() {
                return Err(CprError::DimensionMismatch {
                    expected: state.a_p.nnz(),
                    found: jacobian.nnz(),
                });
            }
        }

        let full = self.config.amg_schedule().should_update(recorder, first_call);
        let partial = !full
            && self.config.partial_update
            && self.config.partial_schedule().should_update(recorder, first_call);

        if full || partial {
            let state = self.state.as_mut().unwrap();
            compute_weights(
                &mut state.weights,
                jacobian,
                self.config.strategy,
                self.config.weight_scaling,
                self.analytical.as_deref(),
                context,
                self.config.min_batch_size,
            )?;
            update_pressure_values(
                &mut state.a_p,
                jacobian,
                &state.weights,
                self.config.min_batch_size,
            )?;
        }

        // The smoother follows every linearization, whatever the
        // pressure subsystem does.
        self.smoother.setup(jacobian)?;

        let state = self.state.as_ref().unwrap();
        if full {
            debug!(
                "cpr full update at step {} ministep {} iteration {}: rebuilding pressure hierarchy",
                recorder.step, recorder.ministep, recorder.subiteration
            );
            self.pressure.setup(&state.a_p, &state.r_p)?;
        } else if partial {
            debug!(
                "cpr partial update at step {} ministep {} iteration {}: refreshing pressure values",
                recorder.step, recorder.ministep, recorder.subiteration
            );
            self.pressure.partial_refresh(&state.a_p, &state.r_p)?;
        }
        Ok(())
    }
}
