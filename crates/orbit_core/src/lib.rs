//! The `orbit_core` crate implements the convergence core for finding
//! closed orbits in particle tracking data and decoupling the optics of
//! the surrounding lattice.
//!
//! Key components:
//! - **Ellipse fitting**: iteratively reweighted covariance fits with
//!   outlier rejection (`ellipse`).
//! - **Closed orbits**: fixed-point search, grid scan and one-shot
//!   diagnostics over a tracking backend (`closed_orbit`).
//! - **Decoupling**: Parzen decoupling of symplectic transfer matrices
//!   into per-mode Twiss parameters and matched ellipses (`decoupling`).
//! - **Tracking**: the collaborator trait plus a linear transfer-matrix
//!   reference backend (`tracking`).

pub mod closed_orbit;
pub mod decoupling;
pub mod ellipse;
pub mod error;
pub mod hit;
pub mod tracking;

pub use error::{OrbitError, Result};
