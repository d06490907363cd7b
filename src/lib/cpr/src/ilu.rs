use nalgebra::{DMatrix, DVector};
use sprs::CompressedStorage;

use crate::error::CprError;
use crate::matrix::BlockMatrix;
use crate::SystemPreconditioner;

/// Block incomplete LU with zero fill-in over the Jacobian's block
/// pattern; the default full-system smoother.
///
/// Factorization runs in block-CSR order. A CSC Jacobian is handled by
/// a permutation into CSR slot order, computed once (the pattern is
/// fixed across nonlinear iterations) and reused for every value
/// refresh. Diagonal pivot blocks are inverted densely and stored, so
/// application is two block-triangular sweeps without further solves.
pub struct BlockIlu0 {
    factors: Option<Ilu0Factors>,
}

struct Ilu0Factors {
    n_cells: usize,
    block_size: usize,
    storage: CompressedStorage,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    /// Slot of the diagonal block within each row.
    diag_slot: Vec<usize>,
    /// For CSC input: source block index feeding each CSR slot.
    csr_source: Option<Vec<usize>>,
    /// Factor blocks: strict lower = L (unit diagonal implied),
    /// diagonal + strict upper = U.
    values: Vec<f64>,
    /// Dense inverses of the U diagonal blocks.
    diag_inv: Vec<f64>,
    /// Per-cell scratch for the triangular sweeps; kept here so apply
    /// stays allocation-free.
    acc: Vec<f64>,
    out: Vec<f64>,
}

impl BlockIlu0 {
    pub fn new() -> Self {
        BlockIlu0 { factors: None }
    }
}

impl Default for BlockIlu0 {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPreconditioner for BlockIlu0 {
    fn setup(&mut self, jacobian: &BlockMatrix) -> Result<(), CprError> {
        let rebuild = match &self.factors {
            Some(f) => {
                f.n_cells != jacobian.n_cells()
                    || f.block_size != jacobian.block_size()
                    || f.storage != jacobian.storage()
                    || f.col_idx.len() != jacobian.nnz()
            }
            None => true,
        };
        if rebuild {
            self.factors = Some(Ilu0Factors::structure(jacobian)?);
        }
        let factors = self.factors.as_mut().unwrap();
        factors.load_values(jacobian);
        factors.factorize()
    }

    fn apply(&mut self, x: &mut DVector<f64>, r: &DVector<f64>) {
        let factors = self
            .factors
            .as_mut()
            .expect("smoother applied before setup");
        factors.solve(x, r);
    }
}

impl Ilu0Factors {
    /// Build the CSR-ordered pattern (and the CSC permutation when
    /// needed). Values are loaded separately on every setup.
    fn structure(jacobian: &BlockMatrix) -> Result<Self, CprError> {
        let n = jacobian.n_cells();
        let b = jacobian.block_size();
        let nnz = jacobian.nnz();

        let (row_ptr, col_idx, csr_source) = match jacobian.storage() {
            CompressedStorage::CSR => (
                jacobian.outer_ptr().to_vec(),
                jacobian.inner_idx().to_vec(),
                None,
            ),
            CompressedStorage::CSC => {
                // Transpose walk: count row occupancy, then scatter the
                // CSC slots into rows. Columns are visited in ascending
                // order, so each row's column indices come out sorted.
                let mut row_ptr = vec![0usize; n + 1];
                for &row in jacobian.inner_idx() {
                    row_ptr[row + 1] += 1;
                }
                for row in 0..n {
                    row_ptr[row + 1] += row_ptr[row];
                }
                let mut next = row_ptr.clone();
                let mut col_idx = vec![0usize; nnz];
                let mut source = vec![0usize; nnz];
                for col in 0..n {
                    for k in jacobian.outer_ptr()[col]..jacobian.outer_ptr()[col + 1] {
                        let row = jacobian.inner_idx()[k];
                        let slot = next[row];
                        next[row] += 1;
                        col_idx[slot] = col;
                        source[slot] = k;
                    }
                }
                (row_ptr, col_idx, Some(source))
            }
        };

        let mut diag_slot = vec![0usize; n];
        for row in 0..n {
            let range = row_ptr[row]..row_ptr[row + 1];
            let slot = col_idx[range.clone()]
                .binary_search(&row)
                .map_err(|_| CprError::SmootherFactorization { row })?;
            diag_slot[row] = range.start + slot;
        }

        Ok(Ilu0Factors {
            n_cells: n,
            block_size: b,
            storage: jacobian.storage(),
            row_ptr,
            col_idx,
            diag_slot,
            csr_source,
            values: vec![0.0; nnz * b * b],
            diag_inv: vec![0.0; n * b * b],
            acc: vec![0.0; b],
            out: vec![0.0; b],
        })
    }

    fn load_values(&mut self, jacobian: &BlockMatrix) {
        let bb = self.block_size * self.block_size;
        match &self.csr_source {
            // CSR input: slots already align.
            None => self.values.copy_from_slice(jacobian.blocks()),
            Some(source) => {
                for (slot, &k) in source.iter().enumerate() {
                    self.values[slot * bb..(slot + 1) * bb].copy_from_slice(jacobian.block(k));
                }
            }
        }
    }

    /// IKJ block ILU(0): eliminate each row against the already
    /// factored rows above it, restricted to the existing pattern.
    fn factorize(&mut self) -> Result<(), CprError> {
        let n = self.n_cells;
        let b = self.block_size;
        let bb = b * b;
        let mut l_ik = vec![0.0; bb];
        let mut tmp = vec![0.0; bb];

        for i in 0..n {
            let row_start = self.row_ptr[i];
            let row_end = self.row_ptr[i + 1];
            for idx in row_start..row_end {
                let k = self.col_idx[idx];
                if k >= i {
                    break;
                }
                // L_ik = A_ik * U_kk⁻¹
                tmp.copy_from_slice(&self.values[idx * bb..(idx + 1) * bb]);
                block_mul(&mut l_ik, &tmp, &self.diag_inv[k * bb..(k + 1) * bb], b);
                self.values[idx * bb..(idx + 1) * bb].copy_from_slice(&l_ik);

                // A_ij -= L_ik * U_kj for structural j > k in row i.
                for idx2 in (idx + 1)..row_end {
                    let j = self.col_idx[idx2];
                    let k_row = self.row_ptr[k]..self.row_ptr[k + 1];
                    if let Ok(slot) = self.col_idx[k_row.clone()].binary_search(&j) {
                        let pos = k_row.start + slot;
                        tmp.copy_from_slice(&self.values[pos * bb..(pos + 1) * bb]);
                        let target = &mut self.values[idx2 * bb..(idx2 + 1) * bb];
                        block_mul_sub(target, &l_ik, &tmp, b);
                    }
                }
            }

            let d = self.diag_slot[i];
            let pivot = &self.values[d * bb..(d + 1) * bb];
            let inv = DMatrix::from_column_slice(b, b, pivot)
                .try_inverse()
                .ok_or(CprError::SmootherFactorization { row: i })?;
            self.diag_inv[i * bb..(i + 1) * bb].copy_from_slice(inv.as_slice());
        }
        Ok(())
    }

    /// `x = (L U)⁻¹ r`: unit-lower forward sweep, then backward sweep
    /// with the stored pivot inverses. Both sweeps are sequential by
    /// construction.
    fn solve(&mut self, x: &mut DVector<f64>, r: &DVector<f64>) {
        let n = self.n_cells;
        let b = self.block_size;
        let bb = b * b;

        // Forward: x_i = r_i - sum_{j<i} L_ij x_j
        for i in 0..n {
            self.acc.copy_from_slice(&r.as_slice()[i * b..(i + 1) * b]);
            for idx in self.row_ptr[i]..self.row_ptr[i + 1] {
                let j = self.col_idx[idx];
                if j >= i {
                    break;
                }
                let l = &self.values[idx * bb..(idx + 1) * bb];
                block_vec_sub(&mut self.acc, l, &x.as_slice()[j * b..(j + 1) * b], b);
            }
            x.as_mut_slice()[i * b..(i + 1) * b].copy_from_slice(&self.acc);
        }

        // Backward: x_i = U_ii⁻¹ (x_i - sum_{j>i} U_ij x_j)
        for i in (0..n).rev() {
            self.acc.copy_from_slice(&x.as_slice()[i * b..(i + 1) * b]);
            for idx in (self.row_ptr[i]..self.row_ptr[i + 1]).rev() {
                let j = self.col_idx[idx];
                if j <= i {
                    break;
                }
                let u = &self.values[idx * bb..(idx + 1) * bb];
                block_vec_sub(&mut self.acc, u, &x.as_slice()[j * b..(j + 1) * b], b);
            }
            block_vec_mul(&mut self.out, &self.diag_inv[i * bb..(i + 1) * bb], &self.acc, b);
            x.as_mut_slice()[i * b..(i + 1) * b].copy_from_slice(&self.out);
        }
    }
}

// Small dense helpers on column-major b×b blocks.

/// `out = a · b`
fn block_mul(out: &mut [f64], a: &[f64], b_: &[f64], bs: usize) {
    for j in 0..bs {
        for i in 0..bs {
            let mut sum = 0.0;
            for k in 0..bs {
                sum += a[k * bs + i] * b_[j * bs + k];
            }
            out[j * bs + i] = sum;
        }
    }
}

/// `c -= a · b`
fn block_mul_sub(c: &mut [f64], a: &[f64], b_: &[f64], bs: usize) {
    for j in 0..bs {
        for i in 0..bs {
            let mut sum = 0.0;
            for k in 0..bs {
                sum += a[k * bs + i] * b_[j * bs + k];
            }
            c[j * bs + i] -= sum;
        }
    }
}

/// `y -= a · x`
fn block_vec_sub(y: &mut [f64], a: &[f64], x: &[f64], bs: usize) {
    for j in 0..bs {
        let xj = x[j];
        for i in 0..bs {
            y[i] -= a[j * bs + i] * xj;
        }
    }
}

/// `y = a · x`
fn block_vec_mul(y: &mut [f64], a: &[f64], x: &[f64], bs: usize) {
    y.fill(0.0);
    for j in 0..bs {
        let xj = x[j];
        for i in 0..bs {
            y[i] += a[j * bs + i] * xj;
        }
    }
}
