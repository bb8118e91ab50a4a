use anyhow::Result;
use nalgebra::{DMatrix, DVector};

use crate::error::OrbitError;
use crate::hit::{HitLike, MapHit};

/// The external tracking collaborator.
///
/// `track_one` pushes a single particle through the lattice and reports
/// every sample recorded at the cell end, the first sample conventionally
/// echoing the seed. Each call is synchronous and treated as
/// non-idempotent; the core never re-invokes it redundantly within a
/// single search step. Backend failures are opaque to the core and travel
/// as `anyhow::Error`.
pub trait Tracking {
    type Hit: HitLike;

    fn track_one(&mut self, seed: &Self::Hit) -> Result<Vec<Self::Hit>>;
}

/// Tracking through a linear lattice described by explicit transfer
/// matrices: `u_i = M_i (u_in - v_in) + v_i`, where `u` is built from the
/// configured variable names in order.
///
/// `matrices[i]` maps the seed directly to sample `i + 1`; for a periodic
/// cell the list is the cumulative powers of the one-turn matrix.
#[derive(Debug, Clone)]
pub struct MatrixTracking {
    names: Vec<String>,
    matrices: Vec<DMatrix<f64>>,
    offsets: Vec<DVector<f64>>,
    offset_in: DVector<f64>,
}

impl MatrixTracking {
    pub fn new(
        names: Vec<String>,
        matrices: Vec<DMatrix<f64>>,
        offsets: Vec<DVector<f64>>,
        offset_in: DVector<f64>,
    ) -> crate::error::Result<Self> {
        let dim = names.len();
        if dim == 0 {
            return Err(OrbitError::InvalidArgument {
                reason: "tracking needs at least one variable name".into(),
            });
        }
        if matrices.len() != offsets.len() {
            return Err(OrbitError::InvalidArgument {
                reason: format!(
                    "got {} matrices but {} offsets; the lists must be the same length",
                    matrices.len(),
                    offsets.len()
                ),
            });
        }
        if offset_in.len() != dim {
            return Err(OrbitError::InvalidArgument {
                reason: format!("offset_in has length {}, expected {dim}", offset_in.len()),
            });
        }
        for matrix in &matrices {
            if matrix.nrows() != dim || matrix.ncols() != dim {
                return Err(OrbitError::InvalidArgument {
                    reason: format!(
                        "transfer matrix is {}x{}, expected {dim}x{dim}",
                        matrix.nrows(),
                        matrix.ncols()
                    ),
                });
            }
        }
        for offset in &offsets {
            if offset.len() != dim {
                return Err(OrbitError::InvalidArgument {
                    reason: format!("offset has length {}, expected {dim}", offset.len()),
                });
            }
        }
        Ok(Self {
            names,
            matrices,
            offsets,
            offset_in,
        })
    }

    /// Convenience for a periodic cell: track `turns` turns of a single
    /// one-turn matrix around a fixed closed-orbit `offset`.
    pub fn turns(
        names: Vec<String>,
        one_turn: DMatrix<f64>,
        offset: DVector<f64>,
        turns: usize,
    ) -> crate::error::Result<Self> {
        let dim = one_turn.nrows();
        let mut matrices = Vec::with_capacity(turns);
        let mut power = DMatrix::identity(dim, dim);
        for _ in 0..turns {
            power = &one_turn * power;
            matrices.push(power.clone());
        }
        let offsets = vec![offset.clone(); turns];
        Self::new(names, matrices, offsets, offset)
    }
}

impl Tracking for MatrixTracking {
    type Hit = MapHit;

    fn track_one(&mut self, seed: &MapHit) -> Result<Vec<MapHit>> {
        let mut vec_in = DVector::zeros(self.names.len());
        for (i, name) in self.names.iter().enumerate() {
            vec_in[i] = seed
                .get(name)
                .ok_or_else(|| OrbitError::UnknownVariable { name: name.clone() })?;
        }
        vec_in -= &self.offset_in;

        let mut hits = vec![seed.clone()];
        for (matrix, offset) in self.matrices.iter().zip(&self.offsets) {
            let vec_out = matrix * &vec_in + offset;
            let mut hit = seed.clone();
            for (i, name) in self.names.iter().enumerate() {
                hit.set(name, vec_out[i]);
            }
            hits.push(hit);
        }
        Ok(hits)
    }
}
