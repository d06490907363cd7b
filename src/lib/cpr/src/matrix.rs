use nalgebra::DVector;
use sprs::{CompressedStorage, CsMat};

use crate::LinearOperator;

/// Sparse matrix of dense `b × b` blocks over a fixed structural pattern.
///
/// One block row/column per cell; the scalar operator has `n_cells * b`
/// rows. Blocks are stored column-major, so entry `(i, j)` of block `k`
/// lives at `k * b² + j * b + i`, with `i` the equation row and `j` the
/// variable column regardless of the outer storage layout.
///
/// The pattern (outer pointers + inner indices) never changes after
/// construction; nonlinear iterations only rewrite block values.
pub struct BlockMatrix {
    storage: CompressedStorage,
    n_cells: usize,
    block_size: usize,
    outer_ptr: Vec<usize>,
    inner_idx: Vec<usize>,
    blocks: Vec<f64>,
}

impl BlockMatrix {
    /// Build from raw compressed arrays.
    ///
    /// Panics if the pattern is malformed (non-monotone pointers,
    /// unsorted or out-of-bounds inner indices, wrong value length),
    /// matching the construction contract of `sprs::CsMat::new`.
    pub fn from_parts(
        storage: CompressedStorage,
        n_cells: usize,
        block_size: usize,
        outer_ptr: Vec<usize>,
        inner_idx: Vec<usize>,
        blocks: Vec<f64>,
    ) -> Self {
        assert!(block_size > 0, "block size must be positive");
        assert_eq!(outer_ptr.len(), n_cells + 1, "outer pointer length");
        assert_eq!(outer_ptr[0], 0, "outer pointers must start at zero");
        let nnz = *outer_ptr.last().unwrap();
        assert_eq!(inner_idx.len(), nnz, "inner index length");
        assert_eq!(
            blocks.len(),
            nnz * block_size * block_size,
            "block value length"
        );
        for outer in 0..n_cells {
            let range = outer_ptr[outer]..outer_ptr[outer + 1];
            assert!(range.start <= range.end, "outer pointers must be monotone");
            for k in range.clone() {
                assert!(inner_idx[k] < n_cells, "inner index out of bounds");
                if k > range.start {
                    assert!(inner_idx[k - 1] < inner_idx[k], "inner indices must be sorted");
                }
            }
        }
        BlockMatrix {
            storage,
            n_cells,
            block_size,
            outer_ptr,
            inner_idx,
            blocks,
        }
    }

    /// Build from `(row_cell, col_cell, block)` triplets, each block given
    /// column-major with `b²` entries. Duplicate positions are rejected.
    pub fn from_triplets(
        storage: CompressedStorage,
        n_cells: usize,
        block_size: usize,
        entries: &[(usize, usize, &[f64])],
    ) -> Self {
        let bb = block_size * block_size;
        let mut order: Vec<usize> = (0..entries.len()).collect();
        // Outer dimension is the row for CSR, the column for CSC.
        let key = |e: &(usize, usize, &[f64])| match storage {
            CompressedStorage::CSR => (e.0, e.1),
            CompressedStorage::CSC => (e.1, e.0),
        };
        order.sort_by_key(|&idx| key(&entries[idx]));

        let mut outer_ptr = vec![0usize; n_cells + 1];
        let mut inner_idx = Vec::with_capacity(entries.len());
        let mut blocks = Vec::with_capacity(entries.len() * bb);
        for &idx in &order {
            let (outer, inner) = key(&entries[idx]);
            assert!(outer < n_cells && inner < n_cells, "triplet out of bounds");
            assert_eq!(entries[idx].2.len(), bb, "triplet block length");
            outer_ptr[outer + 1] += 1;
            inner_idx.push(inner);
            blocks.extend_from_slice(entries[idx].2);
        }
        for outer in 0..n_cells {
            outer_ptr[outer + 1] += outer_ptr[outer];
        }
        Self::from_parts(storage, n_cells, block_size, outer_ptr, inner_idx, blocks)
    }

    pub fn storage(&self) -> CompressedStorage {
        self.storage
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Scalar operator dimension, `n_cells * block_size`.
    pub fn rows(&self) -> usize {
        self.n_cells * self.block_size
    }

    /// Number of structural (block) nonzeros.
    pub fn nnz(&self) -> usize {
        self.inner_idx.len()
    }

    pub fn outer_ptr(&self) -> &[usize] {
        &self.outer_ptr
    }

    pub fn inner_idx(&self) -> &[usize] {
        &self.inner_idx
    }

    /// The `k`-th structural block, column-major `b²` values.
    pub fn block(&self, k: usize) -> &[f64] {
        let bb = self.block_size * self.block_size;
        &self.blocks[k * bb..(k + 1) * bb]
    }

    /// All block values, `nnz · b²` long, in structural order.
    pub fn blocks(&self) -> &[f64] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [f64] {
        &mut self.blocks
    }

    /// Entry `(i, j)` of the `k`-th structural block.
    #[inline]
    pub fn entry(&self, k: usize, i: usize, j: usize) -> f64 {
        let b = self.block_size;
        self.blocks[k * b * b + j * b + i]
    }

    /// The diagonal block of `cell`, if it is structurally present.
    pub fn diag_block(&self, cell: usize) -> Option<&[f64]> {
        let range = self.outer_ptr[cell]..self.outer_ptr[cell + 1];
        let slot = self.inner_idx[range.clone()]
            .binary_search(&cell)
            .ok()?;
        Some(self.block(range.start + slot))
    }

    /// Scalar matrix over the exact same structural pattern, all values
    /// zero. CSC input yields a CSC shell, CSR a CSR shell, so shell and
    /// Jacobian iterate structural nonzeros in identical order.
    pub fn pressure_shell(&self) -> CsMat<f64> {
        let shape = (self.n_cells, self.n_cells);
        let indptr = self.outer_ptr.clone();
        let indices = self.inner_idx.clone();
        let values = vec![0.0; self.nnz()];
        match self.storage {
            CompressedStorage::CSR => CsMat::new(shape, indptr, indices, values),
            CompressedStorage::CSC => CsMat::new_csc(shape, indptr, indices, values),
        }
    }

    /// Block sparse mat-vec, `y = A * x`.
    pub fn spmv(&self, y: &mut DVector<f64>, x: &DVector<f64>) {
        let b = self.block_size;
        match self.storage {
            CompressedStorage::CSR => {
                for row in 0..self.n_cells {
                    let out = &mut y.as_mut_slice()[row * b..(row + 1) * b];
                    out.fill(0.0);
                    for k in self.outer_ptr[row]..self.outer_ptr[row + 1] {
                        let col = self.inner_idx[k];
                        let block = self.block(k);
                        for j in 0..b {
                            let xj = x[col * b + j];
                            for i in 0..b {
                                out[i] += block[j * b + i] * xj;
                            }
                        }
                    }
                }
            }
            CompressedStorage::CSC => {
                y.fill(0.0);
                for col in 0..self.n_cells {
                    for k in self.outer_ptr[col]..self.outer_ptr[col + 1] {
                        let row = self.inner_idx[k];
                        let block = self.block(k);
                        for j in 0..b {
                            let xj = x[col * b + j];
                            for i in 0..b {
                                y[row * b + i] += block[j * b + i] * xj;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl LinearOperator for BlockMatrix {
    fn rows(&self) -> usize {
        BlockMatrix::rows(self)
    }

    fn apply(&self, y: &mut DVector<f64>, x: &DVector<f64>) {
        self.spmv(y, x);
    }
}

/// Split a value slice into per-outer-slot chunks `(outer, values)` for
/// disjoint parallel writes. The pointer array must describe `values`.
pub(crate) fn outer_value_chunks<'a>(
    outer_ptr: &[usize],
    values: &'a mut [f64],
) -> Vec<(usize, &'a mut [f64])> {
    let mut rest = values;
    let mut chunks = Vec::with_capacity(outer_ptr.len().saturating_sub(1));
    for outer in 0..outer_ptr.len() - 1 {
        let len = outer_ptr[outer + 1] - outer_ptr[outer];
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
        chunks.push((outer, head));
        rest = tail;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2x2 block matrix of 2x2 blocks:
    //   [ A  B ]        A = [1 2; 3 4], B = [5 6; 7 8] (row-major reading)
    //   [ 0  C ]        C = [9 10; 11 12]
    fn sample(storage: CompressedStorage) -> BlockMatrix {
        let a = [1.0, 3.0, 2.0, 4.0];
        let b = [5.0, 7.0, 6.0, 8.0];
        let c = [9.0, 11.0, 10.0, 12.0];
        BlockMatrix::from_triplets(storage, 2, 2, &[(0, 0, &a), (0, 1, &b), (1, 1, &c)])
    }

    #[test]
    fn triplet_construction_orders_both_layouts() {
        let csr = sample(CompressedStorage::CSR);
        assert_eq!(csr.outer_ptr(), &[0, 2, 3]);
        assert_eq!(csr.inner_idx(), &[0, 1, 1]);

        let csc = sample(CompressedStorage::CSC);
        assert_eq!(csc.outer_ptr(), &[0, 1, 3]);
        assert_eq!(csc.inner_idx(), &[0, 0, 1]);
    }

    #[test]
    fn entry_and_diag_block_access() {
        let m = sample(CompressedStorage::CSR);
        assert_eq!(m.entry(0, 0, 1), 2.0);
        assert_eq!(m.entry(0, 1, 0), 3.0);
        let d = m.diag_block(1).expect("diagonal block present");
        assert_eq!(d, &[9.0, 11.0, 10.0, 12.0]);
        // Cell 1 has no block in column 0 of the CSR layout.
        let lower = BlockMatrix::from_triplets(
            CompressedStorage::CSR,
            2,
            1,
            &[(0, 0, &[1.0]), (1, 0, &[2.0])],
        );
        assert!(lower.diag_block(1).is_none());
    }

    #[test]
    fn spmv_matches_between_layouts() {
        let csr = sample(CompressedStorage::CSR);
        let csc = sample(CompressedStorage::CSC);
        let x = DVector::from_vec(vec![1.0, -1.0, 2.0, 0.5]);
        let mut y1 = DVector::zeros(4);
        let mut y2 = DVector::zeros(4);
        csr.spmv(&mut y1, &x);
        csc.spmv(&mut y2, &x);
        // Dense check: row 0 = 1*1 + 2*(-1) + 5*2 + 6*0.5 = 12
        assert!((y1[0] - 12.0).abs() < 1e-14);
        for i in 0..4 {
            assert!((y1[i] - y2[i]).abs() < 1e-14, "row {}: {} vs {}", i, y1[i], y2[i]);
        }
    }

    #[test]
    fn pressure_shell_shares_pattern() {
        for storage in [CompressedStorage::CSR, CompressedStorage::CSC] {
            let m = sample(storage);
            let shell = m.pressure_shell();
            assert_eq!(shell.nnz(), m.nnz());
            assert_eq!(shell.storage(), storage);
            assert_eq!(shell.indices(), m.inner_idx());
            for (outer, vec) in shell.outer_iterator().enumerate() {
                let expect = m.outer_ptr()[outer + 1] - m.outer_ptr()[outer];
                assert_eq!(vec.nnz(), expect);
            }
            assert!(shell.data().iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn outer_chunks_cover_values_disjointly() {
        let m = sample(CompressedStorage::CSR);
        let mut values = vec![0.0; m.nnz()];
        let chunks = outer_value_chunks(m.outer_ptr(), &mut values);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].1.len(), 2);
        assert_eq!(chunks[1].1.len(), 1);
    }
}
