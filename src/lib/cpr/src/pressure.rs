use nalgebra::DMatrix;
use rayon::prelude::*;
use sprs::{CompressedStorage, CsMat};

use crate::error::CprError;
use crate::matrix::{BlockMatrix, outer_value_chunks};

/// Rewrite the pressure-matrix values in place from the block Jacobian
/// and the current weights:
///
/// `A_p[k] = Σ_i J.block(k)[i, 0] · W[i, row(k)]`
///
/// i.e. every block's pressure column projected onto the weight vector
/// of the equation row owning that block. The sparsity of `A_p` is
/// untouched; both matrices iterate structural nonzeros in identical
/// order (CSC with CSC, CSR with CSR), so index `k` aligns pointwise.
///
/// Writes are disjoint per outer slot, which makes the loop safely
/// parallel over columns (CSC) or rows (CSR).
pub(crate) fn update_pressure_values(
    a_p: &mut CsMat<f64>,
    jacobian: &BlockMatrix,
    weights: &DMatrix<f64>,
    min_batch: usize,
) -> Result<(), CprError> {
    if a_p.nnz() != jacobian.nnz() {
        return Err(CprError::DimensionMismatch {
            expected: jacobian.nnz(),
            found: a_p.nnz(),
        });
    }
    let b = jacobian.block_size();
    let storage = jacobian.storage();
    let outer_ptr = jacobian.outer_ptr();
    let inner_idx = jacobian.inner_idx();

    outer_value_chunks(outer_ptr, a_p.data_mut())
        .into_par_iter()
        .with_min_len(min_batch.max(1))
        .for_each(|(outer, values)| {
            let start = outer_ptr[outer];
            for (offset, value) in values.iter_mut().enumerate() {
                let k = start + offset;
                let row = match storage {
                    CompressedStorage::CSR => outer,
                    CompressedStorage::CSC => inner_idx[k],
                };
                let mut sum = 0.0;
                for i in 0..b {
                    sum += jacobian.entry(k, i, 0) * weights[(i, row)];
                }
                *value = sum;
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UpdateContext;
    use crate::weights::{WeightScaling, WeightStrategy, compute_weights};

    // Two cells, full 2x2 block pattern. Diagonal blocks [[2,1],[1,3]],
    // off-diagonal blocks [[-1, 0], [0.5, -0.5]] (row-major reading).
    fn coupled_jacobian(storage: CompressedStorage) -> BlockMatrix {
        let d = [2.0, 1.0, 1.0, 3.0];
        let o = [-1.0, 0.5, 0.0, -0.5];
        BlockMatrix::from_triplets(
            storage,
            2,
            2,
            &[(0, 0, &d), (0, 1, &o), (1, 0, &o), (1, 1, &d)],
        )
    }

    fn computed_weights(jac: &BlockMatrix) -> DMatrix<f64> {
        let mut w = DMatrix::zeros(jac.block_size(), jac.n_cells());
        compute_weights(
            &mut w,
            jac,
            WeightStrategy::QuasiImpes,
            WeightScaling::Unit,
            None,
            &UpdateContext::default(),
            1,
        )
        .expect("weights");
        w
    }

    #[test]
    fn projects_pressure_column_onto_row_weights() {
        let jac = coupled_jacobian(CompressedStorage::CSR);
        let w = computed_weights(&jac);
        let mut a_p = jac.pressure_shell();
        update_pressure_values(&mut a_p, &jac, &w, 1).expect("rebuild");

        // Expected entry for block k in row r: w[0,r]*B[0,0] + w[1,r]*B[1,0].
        let dense = a_p.to_dense();
        for (k, (r, c)) in [(0usize, (0usize, 0usize)), (1, (0, 1)), (2, (1, 0)), (3, (1, 1))] {
            let expect = w[(0, r)] * jac.entry(k, 0, 0) + w[(1, r)] * jac.entry(k, 1, 0);
            assert!(
                (dense[[r, c]] - expect).abs() < 1e-14,
                "entry ({r},{c}): {} vs {expect}",
                dense[[r, c]]
            );
        }
    }

    #[test]
    fn csc_and_csr_builders_agree() {
        let csr = coupled_jacobian(CompressedStorage::CSR);
        let csc = coupled_jacobian(CompressedStorage::CSC);
        let w = computed_weights(&csr);

        let mut a_csr = csr.pressure_shell();
        let mut a_csc = csc.pressure_shell();
        update_pressure_values(&mut a_csr, &csr, &w, 1).expect("csr");
        update_pressure_values(&mut a_csc, &csc, &w, 1).expect("csc");

        let d1 = a_csr.to_dense();
        let d2 = a_csc.to_dense();
        for r in 0..2 {
            for c in 0..2 {
                assert!((d1[[r, c]] - d2[[r, c]]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn sparsity_is_preserved_across_rebuilds() {
        let mut jac = coupled_jacobian(CompressedStorage::CSR);
        let w = computed_weights(&jac);
        let mut a_p = jac.pressure_shell();
        update_pressure_values(&mut a_p, &jac, &w, 1).expect("rebuild");
        let indices_before = a_p.indices().to_vec();
        let values_before = a_p.data().to_vec();

        // Perturb the Jacobian values and rebuild; only values move.
        for v in jac.blocks_mut() {
            *v *= 1.5;
        }
        update_pressure_values(&mut a_p, &jac, &w, 1).expect("rebuild");
        assert_eq!(a_p.indices(), &indices_before[..]);
        for (after, before) in a_p.data().iter().zip(&values_before) {
            assert!((after - before * 1.5).abs() < 1e-14);
        }
    }

    #[test]
    fn quasi_impes_keeps_diagonal_dominance() {
        // Diagonally dominant block Jacobian: strong diagonal blocks,
        // weak couplings. The projected pressure matrix must stay
        // diagonally dominant.
        let d = [10.0, 1.0, 1.0, 8.0];
        let o = [-1.0, 0.2, 0.1, -0.3];
        let jac = BlockMatrix::from_triplets(
            CompressedStorage::CSR,
            2,
            2,
            &[(0, 0, &d), (0, 1, &o), (1, 0, &o), (1, 1, &d)],
        );
        let w = computed_weights(&jac);
        let mut a_p = jac.pressure_shell();
        update_pressure_values(&mut a_p, &jac, &w, 1).expect("rebuild");
        let dense = a_p.to_dense();
        for r in 0..2 {
            let off: f64 = (0..2).filter(|&c| c != r).map(|c| dense[[r, c]].abs()).sum();
            assert!(
                dense[[r, r]].abs() > off,
                "row {r} lost diagonal dominance: {} vs {off}",
                dense[[r, r]]
            );
        }
    }

    #[test]
    fn nnz_disagreement_is_a_dimension_mismatch() {
        let jac = coupled_jacobian(CompressedStorage::CSR);
        let d = [2.0, 1.0, 1.0, 3.0];
        let diag_only =
            BlockMatrix::from_triplets(CompressedStorage::CSR, 2, 2, &[(0, 0, &d), (1, 1, &d)]);
        let w = computed_weights(&jac);
        let mut a_p = diag_only.pressure_shell();
        let err = update_pressure_values(&mut a_p, &jac, &w, 1).unwrap_err();
        assert!(matches!(err, CprError::DimensionMismatch { .. }));
    }
}
