use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, Result};

/// A beam ellipse: centre vector and symmetric covariance matrix `V`,
/// describing the confidence region `(x - mean)^T V^-1 (x - mean) = const`.
#[derive(Debug, Clone, PartialEq)]
pub struct Ellipse {
    pub mean: DVector<f64>,
    pub cov: DMatrix<f64>,
}

impl Ellipse {
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Rescale the covariance to unit determinant. Fails when the
    /// determinant is not strictly positive, since the covariance is
    /// then degenerate rather than an ellipse.
    pub fn normalized(&self) -> Result<Ellipse> {
        let det = self.cov.determinant();
        if !det.is_finite() || det <= 0.0 {
            return Err(OrbitError::FitSingularity {
                last_estimate: Some(self.clone()),
            });
        }
        let scale = det.powf(1.0 / self.dimension() as f64);
        Ok(Ellipse {
            mean: self.mean.clone(),
            cov: &self.cov / scale,
        })
    }
}

/// Settings for the iteratively reweighted ellipse fit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitSettings {
    /// Keep a point while its normalised quadratic distance
    /// `(x - mean)^T V^-1 (x - mean) * det(V^-1)^(1/n)` stays below this
    /// cut. Must be positive.
    pub eps_cut: f64,
    /// Cap on reweighting passes; the loop has no fixed-point guarantee.
    pub max_iterations: usize,
    /// Stop once the covariance determinant moves by less than this
    /// between passes.
    pub det_tolerance: f64,
}

impl FitSettings {
    pub fn with_eps_cut(eps_cut: f64) -> Self {
        Self {
            eps_cut,
            max_iterations: 10,
            det_tolerance: 1e-9,
        }
    }
}

impl Default for FitSettings {
    fn default() -> Self {
        // The default cut is high enough to disable outlier rejection.
        Self::with_eps_cut(1e6)
    }
}

/// Outcome of a fit: the ellipse plus which points survived the cut.
#[derive(Debug, Clone)]
pub struct EllipseFit {
    pub ellipse: Ellipse,
    /// One flag per input point; `false` marks a rejected outlier.
    pub in_cut: Vec<bool>,
    pub iterations: usize,
}

/// Fit an ellipse of arbitrary dimension to a set of points, iteratively
/// rejecting points whose normalised distance exceeds `eps_cut`.
///
/// `weights` holds one statistical weight per point; `None` weights every
/// point equally. A singular or ill-conditioned covariance at any pass
/// raises [`OrbitError::FitSingularity`] carrying the last estimate that
/// inverted cleanly; the caller decides whether that is fatal.
pub fn fit_ellipse(
    points: &[DVector<f64>],
    weights: Option<&[f64]>,
    settings: &FitSettings,
) -> Result<EllipseFit> {
    let n_points = points.len();
    if n_points == 0 {
        return Err(OrbitError::InvalidArgument {
            reason: "cannot fit an ellipse to zero points".into(),
        });
    }
    let dim = points[0].len();
    if dim == 0 {
        return Err(OrbitError::InvalidArgument {
            reason: "points must have positive dimension".into(),
        });
    }
    if points.iter().any(|point| point.len() != dim) {
        return Err(OrbitError::InvalidArgument {
            reason: "all points must have the same dimension".into(),
        });
    }
    if !(settings.eps_cut > 0.0) {
        return Err(OrbitError::InvalidArgument {
            reason: format!("eps_cut must be positive, got {}", settings.eps_cut),
        });
    }
    if settings.max_iterations == 0 {
        return Err(OrbitError::InvalidArgument {
            reason: "max_iterations must be at least 1".into(),
        });
    }
    if let Some(weights) = weights {
        if weights.len() != n_points {
            return Err(OrbitError::InvalidArgument {
                reason: format!(
                    "got {} weights for {n_points} points",
                    weights.len()
                ),
            });
        }
    }

    let uniform;
    let weights = match weights {
        Some(weights) => weights,
        None => {
            uniform = vec![1.0; n_points];
            &uniform
        }
    };

    let mut in_cut = vec![true; n_points];
    let mut last_estimate: Option<Ellipse> = None;
    let mut previous_det = f64::INFINITY;
    let mut iterations = 0;

    loop {
        let (mean, cov) = match weighted_moments(points, weights, &in_cut) {
            Some(moments) => moments,
            None => return Err(OrbitError::FitSingularity { last_estimate }),
        };
        let det = cov.determinant();
        if !det.is_finite() || det <= 0.0 {
            return Err(OrbitError::FitSingularity { last_estimate });
        }
        let inverse = match cov.clone().try_inverse() {
            Some(inverse) => inverse,
            None => return Err(OrbitError::FitSingularity { last_estimate }),
        };
        let ellipse = Ellipse { mean, cov };
        iterations += 1;

        let converged = (det - previous_det).abs() <= settings.det_tolerance;
        if converged || iterations >= settings.max_iterations {
            return Ok(EllipseFit {
                ellipse,
                in_cut,
                iterations,
            });
        }
        previous_det = det;

        let scale = inverse.determinant().powf(1.0 / dim as f64);
        for (i, point) in points.iter().enumerate() {
            let delta = point - &ellipse.mean;
            let eps = delta.dot(&(&inverse * &delta)) * scale;
            in_cut[i] = eps < settings.eps_cut;
        }
        last_estimate = Some(ellipse);
    }
}

/// Weighted mean and covariance over the points still inside the cut.
/// `None` when no weight remains in the cut.
fn weighted_moments(
    points: &[DVector<f64>],
    weights: &[f64],
    in_cut: &[bool],
) -> Option<(DVector<f64>, DMatrix<f64>)> {
    let dim = points[0].len();
    let mut sum_weight = 0.0;
    for (weight, keep) in weights.iter().zip(in_cut) {
        if *keep {
            sum_weight += weight;
        }
    }
    if sum_weight <= 0.0 {
        return None;
    }

    let mut mean = DVector::zeros(dim);
    let mut second = DMatrix::zeros(dim, dim);
    for ((point, weight), keep) in points.iter().zip(weights).zip(in_cut) {
        if !keep {
            continue;
        }
        let weight = weight / sum_weight;
        mean += point * weight;
        second += point * point.transpose() * weight;
    }
    let cov = second - &mean * mean.transpose();
    Some((mean, cov))
}

#[cfg(test)]
mod tests {
    use super::{fit_ellipse, Ellipse, FitSettings};
    use crate::error::OrbitError;
    use nalgebra::{DMatrix, DVector};

    /// Points evenly spaced on the boundary of an axis-aligned ellipse
    /// with semi-axes `a`, `b`. Their covariance is exactly
    /// diag(a^2 / 2, b^2 / 2).
    fn boundary_points(a: f64, b: f64, count: usize) -> Vec<DVector<f64>> {
        (0..count)
            .map(|k| {
                let theta = 2.0 * std::f64::consts::PI * k as f64 / count as f64;
                DVector::from_column_slice(&[a * theta.cos(), b * theta.sin()])
            })
            .collect()
    }

    #[test]
    fn boundary_points_recover_axis_covariance() {
        let points = boundary_points(2.0, 1.0, 64);
        let fit = fit_ellipse(&points, None, &FitSettings::with_eps_cut(100.0))
            .expect("fit should succeed");
        assert!(fit.ellipse.mean[0].abs() < 1e-9);
        assert!(fit.ellipse.mean[1].abs() < 1e-9);
        assert!((fit.ellipse.cov[(0, 0)] - 2.0).abs() < 1e-9);
        assert!((fit.ellipse.cov[(1, 1)] - 0.5).abs() < 1e-9);
        assert!(fit.ellipse.cov[(0, 1)].abs() < 1e-9);
        assert!(fit.in_cut.iter().all(|&kept| kept));
    }

    #[test]
    fn outliers_are_cut_and_parameters_recovered() {
        let mut points = boundary_points(2.0, 1.0, 64);
        let outliers = [[10.0, 10.0], [-12.0, 8.0], [9.0, -11.0]];
        for outlier in &outliers {
            points.push(DVector::from_column_slice(outlier));
        }

        // Boundary points sit at eps = 2 exactly once the fit is clean,
        // so the cut must stay above that while catching the outliers.
        let fit = fit_ellipse(&points, None, &FitSettings::with_eps_cut(4.0))
            .expect("fit should succeed");
        for (i, &kept) in fit.in_cut.iter().enumerate() {
            assert_eq!(kept, i < 64, "point {i} on the wrong side of the cut");
        }
        assert!(fit.ellipse.mean[0].abs() < 1e-6);
        assert!(fit.ellipse.mean[1].abs() < 1e-6);
        assert!((fit.ellipse.cov[(0, 0)] - 2.0).abs() < 1e-6);
        assert!((fit.ellipse.cov[(1, 1)] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn zero_weight_points_do_not_contribute() {
        let mut points = boundary_points(2.0, 1.0, 64);
        points.push(DVector::from_column_slice(&[50.0, 50.0]));
        let mut weights = vec![1.0; 64];
        weights.push(0.0);

        let fit = fit_ellipse(&points, Some(&weights), &FitSettings::with_eps_cut(1e6))
            .expect("fit should succeed");
        assert!(fit.ellipse.mean[0].abs() < 1e-9);
        assert!((fit.ellipse.cov[(0, 0)] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn identical_points_raise_fit_singularity() {
        let points = vec![DVector::from_column_slice(&[1.0, 2.0]); 10];
        let result = fit_ellipse(&points, None, &FitSettings::with_eps_cut(1.0));
        match result {
            Err(OrbitError::FitSingularity { last_estimate }) => {
                assert!(last_estimate.is_none());
            }
            other => panic!("expected FitSingularity, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_arguments() {
        let points = boundary_points(1.0, 1.0, 8);
        assert!(fit_ellipse(&[], None, &FitSettings::with_eps_cut(1.0)).is_err());
        assert!(fit_ellipse(&points, None, &FitSettings::with_eps_cut(0.0)).is_err());
        assert!(fit_ellipse(&points, None, &FitSettings::with_eps_cut(-1.0)).is_err());
        assert!(fit_ellipse(&points, Some(&[1.0; 3]), &FitSettings::with_eps_cut(1.0)).is_err());
        let mut settings = FitSettings::with_eps_cut(1.0);
        settings.max_iterations = 0;
        assert!(fit_ellipse(&points, None, &settings).is_err());
    }

    #[test]
    fn normalized_ellipse_has_unit_determinant() {
        let ellipse = Ellipse {
            mean: DVector::zeros(2),
            cov: DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 2.0]),
        };
        let normalized = ellipse.normalized().expect("normalization should succeed");
        assert!((normalized.cov.determinant() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_ellipse_cannot_be_normalized() {
        let ellipse = Ellipse {
            mean: DVector::zeros(2),
            cov: DMatrix::zeros(2, 2),
        };
        assert!(ellipse.normalized().is_err());
    }
}
