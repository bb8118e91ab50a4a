use crate::ellipse::Ellipse;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrbitError>;

/// Error taxonomy for the convergence core.
///
/// Only numerical failures and collaborator failures live here. "No more
/// work" conditions (a fully walked scan grid, an exhausted iteration
/// budget) are terminal variants of the step enums in
/// [`crate::closed_orbit`] and are never reported as errors.
#[derive(Debug, Error)]
pub enum OrbitError {
    /// A transfer matrix failed shape or symplecticity validation.
    #[error("transfer matrix rejected: {reason}")]
    Construction { reason: String },

    /// The covariance became singular or ill-conditioned during an
    /// ellipse fit. Carries the last estimate that inverted cleanly,
    /// if one exists.
    #[error("covariance matrix is singular or ill-conditioned")]
    FitSingularity { last_estimate: Option<Ellipse> },

    /// A noise sample came out NaN or infinite. Never clamped or dropped.
    #[error("noise for point {index} is not finite ({value}); ellipse is ill-conditioned")]
    NoiseDegenerate { index: usize, value: f64 },

    /// Tracking returned no new samples; the particle has fallen out of
    /// the acceptance.
    #[error("tracking produced no new points; particle lost")]
    TrackingExhausted,

    /// A hit does not carry the requested dynamical variable.
    #[error("hit has no variable named {name:?}")]
    UnknownVariable { name: String },

    /// The imaginary part left over after projecting a matrix back onto
    /// the reals was too large to discard.
    #[error("imaginary residual {magnitude} too large; matrix is ill-conditioned")]
    ImaginaryResidual { magnitude: f64 },

    /// A caller-supplied argument failed validation.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Failure inside the external tracking collaborator.
    #[error("tracking backend failed")]
    Tracking(#[from] anyhow::Error),
}
