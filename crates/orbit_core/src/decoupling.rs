//! Decoupling of a 2N-dimensional symplectic transfer matrix into N
//! independent 2x2 blocks, following Parzen, "Linear Parameters and the
//! Decoupling Matrix for Linearly Coupled Motion in 6 Dimensional Phase
//! Space" (arxiv:acc-phys/9510006).
//!
//! The decoupling transformation yields periodic solutions to the
//! general beam ellipse problem, including per-mode Twiss parameters and
//! the matched covariance for a set of eigen-emittances.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, Result};

/// Decoupler configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecouplerSettings {
    /// Accept a transfer matrix while its determinant deviates from one
    /// by no more than this.
    pub det_tolerance: f64,
}

impl Default for DecouplerSettings {
    fn default() -> Self {
        Self {
            det_tolerance: 1e-6,
        }
    }
}

/// Twiss parameters of one decoupled mode.
///
/// A mode whose eigenvalue pair is real carries no phase-space rotation
/// and has no Twiss parametrisation; it is flagged `degenerate` and the
/// parameters are pinned at `beta = -1`, `alpha = 0`, `gamma = -1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeOptics {
    pub phase_advance: f64,
    pub beta: f64,
    pub alpha: f64,
    pub gamma: f64,
    pub degenerate: bool,
}

/// Decoupling transformation of a single transfer matrix.
///
/// Construction runs the whole eigenanalysis; every accessor afterwards
/// is a cheap read. Mode indices run from `0` to `modes() - 1` and the
/// per-mode accessors panic when given an index out of that range.
#[derive(Debug, Clone)]
pub struct TransferMatrixDecoupler {
    matrix: DMatrix<f64>,
    eigenvalues: Vec<Complex<f64>>,
    transform: DMatrix<Complex<f64>>,
    decoupled: DMatrix<Complex<f64>>,
    v_t: DMatrix<f64>,
    optics: Vec<ModeOptics>,
}

impl TransferMatrixDecoupler {
    /// Decouple `matrix`, which must be square with even, nonzero size
    /// and determinant within `settings.det_tolerance` of one.
    pub fn new(matrix: DMatrix<f64>, settings: &DecouplerSettings) -> Result<Self> {
        let dim = matrix.nrows();
        if matrix.ncols() != dim {
            return Err(OrbitError::Construction {
                reason: format!("matrix is {}x{}, not square", dim, matrix.ncols()),
            });
        }
        if dim == 0 || dim % 2 != 0 {
            return Err(OrbitError::Construction {
                reason: format!("matrix size {dim} is not a positive even number"),
            });
        }
        let det = matrix.determinant();
        if (det - 1.0).abs() > settings.det_tolerance {
            return Err(OrbitError::Construction {
                reason: format!(
                    "determinant deviates from 1 by {}, tolerance is {}",
                    det - 1.0,
                    settings.det_tolerance
                ),
            });
        }

        let complex = matrix.map(|value| Complex::new(value, 0.0));
        let eigenvalues = paired_eigenvalues(&matrix)?;
        let eigenvectors = eigenvector_matrix(&complex, &eigenvalues)?;

        let modes = dim / 2;
        let mut t_eigenvectors = DMatrix::<Complex<f64>>::zeros(dim, dim);
        let mut v_t = DMatrix::<f64>::zeros(dim, dim);
        let mut optics = Vec::with_capacity(modes);
        for mode in 0..modes {
            let j = 2 * mode;
            let lead = eigenvectors[(j, j)];
            let next = eigenvectors[(j + 1, j)];
            let (beta, alpha, degenerate) = mode_parameters(lead, next);
            let gamma = (1.0 + alpha * alpha) / beta;

            // The eigenvector phase is folded into the uncoupled
            // eigenvector so that the transformation comes out real.
            let rotation = Complex::from_polar(1.0, lead.arg());
            let sqrt_beta = Complex::new(beta, 0.0).sqrt();
            t_eigenvectors[(j, j)] = sqrt_beta * rotation;
            t_eigenvectors[(j + 1, j)] = Complex::new(-alpha, 1.0) / sqrt_beta * rotation;
            t_eigenvectors[(j, j + 1)] = t_eigenvectors[(j, j)].conj();
            t_eigenvectors[(j + 1, j + 1)] = t_eigenvectors[(j + 1, j)].conj();

            let sign = if beta < 0.0 { -1.0 } else { 1.0 };
            v_t[(j, j)] = sign * beta;
            v_t[(j, j + 1)] = -sign * alpha;
            v_t[(j + 1, j)] = -sign * alpha;
            v_t[(j + 1, j + 1)] = sign * gamma;

            optics.push(ModeOptics {
                phase_advance: eigenvalues[j].arg(),
                beta,
                alpha,
                gamma,
                degenerate,
            });
        }

        let t_inverse = t_eigenvectors
            .try_inverse()
            .ok_or_else(|| OrbitError::Construction {
                reason: "uncoupled eigenvector basis is singular".into(),
            })?;
        let transform = &eigenvectors * t_inverse;
        let transform_inverse =
            transform
                .clone()
                .try_inverse()
                .ok_or_else(|| OrbitError::Construction {
                    reason: "eigenvector basis is singular; matrix may be defective".into(),
                })?;
        let decoupled = transform_inverse * &complex * &transform;

        Ok(Self {
            matrix,
            eigenvalues,
            transform,
            decoupled,
            v_t,
            optics,
        })
    }

    /// Number of decoupled 2x2 modes.
    pub fn modes(&self) -> usize {
        self.optics.len()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Eigenvalues sorted into conjugate pairs, the positive-imaginary
    /// partner first; pair `i` belongs to mode `i`.
    pub fn eigenvalues(&self) -> &[Complex<f64>] {
        &self.eigenvalues
    }

    /// The similarity transformation `R` with `M = R T R^-1`.
    pub fn transform(&self) -> &DMatrix<Complex<f64>> {
        &self.transform
    }

    /// The decoupled matrix `T`, block diagonal up to numerical noise.
    pub fn decoupled(&self) -> &DMatrix<Complex<f64>> {
        &self.decoupled
    }

    pub fn mode_optics(&self, mode: usize) -> &ModeOptics {
        &self.optics[mode]
    }

    /// Phase advance [rad] of the given mode.
    pub fn phase_advance(&self, mode: usize) -> f64 {
        self.optics[mode].phase_advance
    }

    pub fn beta(&self, mode: usize) -> f64 {
        self.optics[mode].beta
    }

    pub fn alpha(&self, mode: usize) -> f64 {
        self.optics[mode].alpha
    }

    pub fn gamma(&self, mode: usize) -> f64 {
        self.optics[mode].gamma
    }

    /// Largest magnitude among elements of `T` outside the diagonal 2x2
    /// blocks. Zero for a perfectly decoupled matrix.
    pub fn coupling_residual(&self) -> f64 {
        let dim = self.matrix.nrows();
        let mut residual: f64 = 0.0;
        for row in 0..dim {
            for column in 0..dim {
                if row / 2 == column / 2 {
                    continue;
                }
                residual = residual.max(self.decoupled[(row, column)].norm());
            }
        }
        residual
    }

    /// Matched covariance for the given eigen-emittances: a real matrix
    /// `V` with `M V M^T = V`, one emittance per mode.
    ///
    /// The projection back onto the reals fails with
    /// [`OrbitError::ImaginaryResidual`] when the discarded imaginary
    /// part is not negligible against the real part.
    pub fn v_m(&self, eigen_emittances: &[f64]) -> Result<DMatrix<f64>> {
        if eigen_emittances.len() != self.modes() {
            return Err(OrbitError::InvalidArgument {
                reason: format!(
                    "got {} eigen-emittances for {} modes",
                    eigen_emittances.len(),
                    self.modes()
                ),
            });
        }
        let dim = self.matrix.nrows();
        let mut scaled = DMatrix::<Complex<f64>>::zeros(dim, dim);
        for (mode, emittance) in eigen_emittances.iter().enumerate() {
            let j = 2 * mode;
            for row in j..j + 2 {
                for column in j..j + 2 {
                    scaled[(row, column)] = Complex::new(self.v_t[(row, column)] * emittance, 0.0);
                }
            }
        }
        // Plain transpose, not the adjoint: the periodic ellipse follows
        // the complex-symmetric form of the transformation.
        let matched = &self.transform * scaled * self.transform.transpose();

        let mut max_real: f64 = 1.0;
        let mut max_imaginary: f64 = 0.0;
        for value in matched.iter() {
            max_real = max_real.max(value.re.abs());
            max_imaginary = max_imaginary.max(value.im.abs());
        }
        if max_imaginary > 1e-6 * max_real {
            return Err(OrbitError::ImaginaryResidual {
                magnitude: max_imaginary,
            });
        }
        Ok(matched.map(|value| value.re))
    }
}

/// Sort the eigenvalues of `matrix` into conjugate pairs, each pair
/// adjacent with the positive-imaginary partner first.
fn paired_eigenvalues(matrix: &DMatrix<f64>) -> Result<Vec<Complex<f64>>> {
    let raw = matrix.clone().complex_eigenvalues();
    let count = raw.len();
    let mut used = vec![false; count];
    let mut ordered = Vec::with_capacity(count);
    for i in 0..count {
        if used[i] {
            continue;
        }
        used[i] = true;
        let target = raw[i].conj();
        let mut partner: Option<(usize, f64)> = None;
        for k in 0..count {
            if used[k] {
                continue;
            }
            let distance = (raw[k] - target).norm();
            match partner {
                Some((_, best)) if distance >= best => {}
                _ => partner = Some((k, distance)),
            }
        }
        let (k, _) = partner.ok_or_else(|| OrbitError::Construction {
            reason: "eigenvalues do not form conjugate pairs".into(),
        })?;
        used[k] = true;
        if raw[i].im >= raw[k].im {
            ordered.push(raw[i]);
            ordered.push(raw[k]);
        } else {
            ordered.push(raw[k]);
            ordered.push(raw[i]);
        }
    }
    Ok(ordered)
}

/// Eigenvalues closer than this are one eigenspace and share a null
/// basis, so equal-tune lattices keep independent eigenvector columns.
const DEGENERACY_TOLERANCE: f64 = 1e-8;

/// One unit-norm eigenvector per eigenvalue, repeats included, assembled
/// column by column in eigenvalue order.
fn eigenvector_matrix(
    matrix: &DMatrix<Complex<f64>>,
    eigenvalues: &[Complex<f64>],
) -> Result<DMatrix<Complex<f64>>> {
    let dim = matrix.nrows();
    let mut eigenvectors = DMatrix::<Complex<f64>>::zeros(dim, dim);
    let mut grouped = vec![false; dim];
    for i in 0..dim {
        if grouped[i] {
            continue;
        }
        grouped[i] = true;
        let mut columns = vec![i];
        for k in (i + 1)..dim {
            if !grouped[k] && (eigenvalues[k] - eigenvalues[i]).norm() <= DEGENERACY_TOLERANCE {
                grouped[k] = true;
                columns.push(k);
            }
        }
        let basis = null_space_basis(matrix, eigenvalues[i], columns.len())?;

        // Each column belongs to a mode reading components 2m, 2m + 1;
        // give it the basis vector with the strongest lead component so
        // the per-mode ratio stays well defined where possible.
        let mut taken = vec![false; basis.len()];
        for &column in &columns {
            let lead_row = column - column % 2;
            let mut best: Option<(usize, f64)> = None;
            for (index, vector) in basis.iter().enumerate() {
                if taken[index] {
                    continue;
                }
                let weight = vector[lead_row].norm();
                match best {
                    Some((_, strongest)) if weight <= strongest => {}
                    _ => best = Some((index, weight)),
                }
            }
            let (index, _) = best.ok_or_else(|| OrbitError::Construction {
                reason: format!("no eigenvector left for eigenvalue {}", eigenvalues[column]),
            })?;
            taken[index] = true;
            eigenvectors.set_column(column, &basis[index]);
        }
    }
    Ok(eigenvectors)
}

/// The `count` trailing right singular vectors of the shifted matrix,
/// spanning the (near-)null space of `matrix - eigenvalue I`.
fn null_space_basis(
    matrix: &DMatrix<Complex<f64>>,
    eigenvalue: Complex<f64>,
    count: usize,
) -> Result<Vec<DVector<Complex<f64>>>> {
    let dim = matrix.nrows();
    let mut shifted = matrix.clone();
    for i in 0..dim {
        shifted[(i, i)] -= eigenvalue;
    }
    let svd = shifted.svd(true, true);
    let v_t = svd.v_t.ok_or_else(|| OrbitError::Construction {
        reason: format!("eigenvector extraction failed for eigenvalue {eigenvalue}"),
    })?;
    // Singular values come back sorted descending; the trailing rows
    // span the null space, one per repeat of the eigenvalue.
    let mut basis = Vec::with_capacity(count);
    for repeat in 0..count {
        let row = v_t.nrows() - 1 - repeat;
        basis.push(DVector::from_fn(dim, |i, _| v_t[(row, i)].conj()));
    }
    Ok(basis)
}

/// Twiss `beta` and `alpha` from the leading two components of a mode
/// eigenvector, plus the degeneracy flag for real-eigenvalue modes.
fn mode_parameters(lead: Complex<f64>, next: Complex<f64>) -> (f64, f64, bool) {
    if lead.norm() <= f64::EPSILON {
        return (-1.0, 0.0, true);
    }
    let ratio = next / lead;
    if !ratio.re.is_finite() || !ratio.im.is_finite() || ratio.im == 0.0 {
        return (-1.0, 0.0, true);
    }
    let beta = 1.0 / ratio.im;
    if !beta.is_finite() {
        return (-1.0, 0.0, true);
    }
    (beta, -beta * ratio.re, false)
}

#[cfg(test)]
mod tests {
    use super::{DecouplerSettings, TransferMatrixDecoupler};
    use crate::error::OrbitError;
    use nalgebra::DMatrix;

    /// One-turn matrix of a periodic cell with the given Twiss
    /// parameters and phase advance, in (q, p) coordinates.
    fn twiss_block(beta: f64, alpha: f64, mu: f64) -> DMatrix<f64> {
        let gamma = (1.0 + alpha * alpha) / beta;
        let (s, c) = mu.sin_cos();
        DMatrix::from_row_slice(
            2,
            2,
            &[c + alpha * s, beta * s, -gamma * s, c - alpha * s],
        )
    }

    fn block_diagonal(blocks: &[DMatrix<f64>]) -> DMatrix<f64> {
        let dim: usize = blocks.iter().map(|block| block.nrows()).sum();
        let mut matrix = DMatrix::zeros(dim, dim);
        let mut offset = 0;
        for block in blocks {
            let size = block.nrows();
            matrix.view_mut((offset, offset), (size, size)).copy_from(block);
            offset += size;
        }
        matrix
    }

    /// Symplectic rotation mixing the two transverse modes by `angle`.
    fn mode_rotation(angle: f64) -> DMatrix<f64> {
        let (s, c) = angle.sin_cos();
        DMatrix::from_row_slice(
            4,
            4,
            &[
                c, 0.0, s, 0.0, //
                0.0, c, 0.0, s, //
                -s, 0.0, c, 0.0, //
                0.0, -s, 0.0, c,
            ],
        )
    }

    #[test]
    fn uncoupled_cell_recovers_its_twiss_parameters() {
        let mu = std::f64::consts::FRAC_PI_4;
        let matrix = twiss_block(2.0, 0.5, mu);
        let decoupler = TransferMatrixDecoupler::new(matrix, &DecouplerSettings::default())
            .expect("decoupling should succeed");

        assert_eq!(decoupler.modes(), 1);
        let optics = decoupler.mode_optics(0);
        assert!(!optics.degenerate);
        assert!((decoupler.phase_advance(0) - mu).abs() < 1e-9);
        assert!((decoupler.beta(0) - 2.0).abs() < 1e-9);
        assert!((decoupler.alpha(0) - 0.5).abs() < 1e-9);
        assert!((decoupler.gamma(0) - 0.625).abs() < 1e-9);
        assert!(decoupler.coupling_residual() < 1e-12);
    }

    #[test]
    fn block_diagonal_matrix_recovers_both_modes() {
        let mu = [std::f64::consts::FRAC_PI_4, 1.0];
        let matrix = block_diagonal(&[
            twiss_block(2.0, 0.5, mu[0]),
            twiss_block(3.0, -0.2, mu[1]),
        ]);
        let decoupler = TransferMatrixDecoupler::new(matrix, &DecouplerSettings::default())
            .expect("decoupling should succeed");

        assert_eq!(decoupler.modes(), 2);
        // Mode order is not pinned; sort by phase advance.
        let mut modes = [
            *decoupler.mode_optics(0),
            *decoupler.mode_optics(1),
        ];
        modes.sort_by(|a, b| a.phase_advance.total_cmp(&b.phase_advance));
        assert!((modes[0].phase_advance - mu[0]).abs() < 1e-8);
        assert!((modes[0].beta - 2.0).abs() < 1e-8);
        assert!((modes[0].alpha - 0.5).abs() < 1e-8);
        assert!((modes[1].phase_advance - mu[1]).abs() < 1e-8);
        assert!((modes[1].beta - 3.0).abs() < 1e-8);
        assert!((modes[1].alpha - (-0.2)).abs() < 1e-8);
        assert!(decoupler.coupling_residual() < 1e-9);
    }

    #[test]
    fn equal_tune_lattice_keeps_its_modes_apart() {
        // Both modes share the eigenvalue pair e^(+-i pi/4); the
        // eigenspaces are two-dimensional and each mode must still get
        // its own eigenvector.
        let mu = std::f64::consts::FRAC_PI_4;
        let matrix = block_diagonal(&[
            twiss_block(2.0, 0.5, mu),
            twiss_block(3.0, -0.2, mu),
        ]);
        let decoupler =
            TransferMatrixDecoupler::new(matrix.clone(), &DecouplerSettings::default())
                .expect("equal tunes are a valid lattice");

        assert!((decoupler.phase_advance(0) - mu).abs() < 1e-8);
        assert!((decoupler.phase_advance(1) - mu).abs() < 1e-8);
        let mut modes = [*decoupler.mode_optics(0), *decoupler.mode_optics(1)];
        modes.sort_by(|a, b| a.beta.total_cmp(&b.beta));
        assert!(!modes[0].degenerate && !modes[1].degenerate);
        assert!((modes[0].beta - 2.0).abs() < 1e-8);
        assert!((modes[0].alpha - 0.5).abs() < 1e-8);
        assert!((modes[1].beta - 3.0).abs() < 1e-8);
        assert!((modes[1].alpha - (-0.2)).abs() < 1e-8);
        assert!(decoupler.coupling_residual() < 1e-8);

        let matched = decoupler
            .v_m(&[1.0, 1.0])
            .expect("matched ellipse should project onto the reals");
        let transported = &matrix * &matched * matrix.transpose();
        for row in 0..4 {
            for column in 0..4 {
                assert!(
                    (transported[(row, column)] - matched[(row, column)]).abs() < 1e-8,
                    "matched ellipse is not periodic at ({row}, {column})"
                );
            }
        }
    }

    #[test]
    fn rotated_lattice_decouples_and_yields_a_matched_ellipse() {
        let mu = [std::f64::consts::FRAC_PI_4, 1.0];
        let block = block_diagonal(&[
            twiss_block(2.0, 0.5, mu[0]),
            twiss_block(3.0, -0.2, mu[1]),
        ]);
        let rotation = mode_rotation(0.3);
        let matrix = &rotation * block * rotation.transpose();
        let decoupler =
            TransferMatrixDecoupler::new(matrix.clone(), &DecouplerSettings::default())
                .expect("decoupling should succeed");

        assert!(decoupler.coupling_residual() < 1e-8);
        let mut phases = [decoupler.phase_advance(0), decoupler.phase_advance(1)];
        phases.sort_by(f64::total_cmp);
        assert!((phases[0] - mu[0]).abs() < 1e-8);
        assert!((phases[1] - mu[1]).abs() < 1e-8);

        let matched = decoupler
            .v_m(&[1.0, 1.0])
            .expect("matched ellipse should project onto the reals");
        let transported = &matrix * &matched * matrix.transpose();
        for row in 0..4 {
            for column in 0..4 {
                assert!(
                    (matched[(row, column)] - matched[(column, row)]).abs() < 1e-8,
                    "matched ellipse is not symmetric"
                );
                assert!(
                    (transported[(row, column)] - matched[(row, column)]).abs() < 1e-8,
                    "matched ellipse is not periodic at ({row}, {column})"
                );
            }
        }
    }

    #[test]
    fn real_eigenvalues_flag_the_mode_degenerate() {
        let matrix = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 0.5]);
        let decoupler = TransferMatrixDecoupler::new(matrix, &DecouplerSettings::default())
            .expect("a hyperbolic cell still decouples");

        let optics = decoupler.mode_optics(0);
        assert!(optics.degenerate);
        assert_eq!(optics.beta, -1.0);
        assert_eq!(optics.alpha, 0.0);
        assert_eq!(optics.gamma, -1.0);
        assert!(decoupler.phase_advance(0).abs() < 1e-12);
    }

    #[test]
    fn rejects_malformed_transfer_matrices() {
        let settings = DecouplerSettings::default();

        let non_unit_det = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 1.0]);
        match TransferMatrixDecoupler::new(non_unit_det, &settings) {
            Err(OrbitError::Construction { reason }) => {
                assert!(reason.contains("determinant"), "reason was {reason:?}");
            }
            other => panic!("expected a construction error, got {other:?}"),
        }

        let odd = DMatrix::<f64>::identity(3, 3);
        assert!(TransferMatrixDecoupler::new(odd, &settings).is_err());

        let rectangular = DMatrix::<f64>::zeros(2, 3);
        assert!(TransferMatrixDecoupler::new(rectangular, &settings).is_err());
    }

    #[test]
    fn determinant_within_tolerance_is_accepted() {
        let matrix = twiss_block(2.0, 0.5, 1.0) * (1.0 + 2e-7);
        assert!(TransferMatrixDecoupler::new(matrix, &DecouplerSettings::default()).is_ok());
    }

    #[test]
    fn wrong_emittance_count_is_rejected() {
        let decoupler = TransferMatrixDecoupler::new(
            twiss_block(2.0, 0.5, 1.0),
            &DecouplerSettings::default(),
        )
        .expect("decoupling should succeed");
        match decoupler.v_m(&[1.0, 2.0]) {
            Err(OrbitError::InvalidArgument { .. }) => {}
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }
}
