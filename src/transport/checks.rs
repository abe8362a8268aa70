//! Post-projection constraint checks.
//!
//! Every check is an explicit boolean evaluation with a reported magnitude
//! on normalized quantities (mass divided by the batch element's total), so
//! tolerances are comparable across image sizes. The checks are diagnostic:
//! the attack loop logs violations and decides whether they are fatal.

use ndarray::{Array1, Array3, Array4};

use crate::config::DIV_GUARD;
use crate::transport::cost::CostMatrix;

/// Result of one constraint check.
#[derive(Clone, Copy, Debug)]
pub struct CheckReport {
    /// Whether the worst violation is within tolerance.
    pub ok: bool,

    /// Worst violation magnitude (negative or zero means slack).
    pub worst: f32,

    /// Tolerance the magnitude was compared against.
    pub tol: f32,
}

impl CheckReport {
    fn new(worst: f32, tol: f32) -> Self {
        Self {
            ok: worst <= tol,
            worst,
            tol,
        }
    }
}

/// Worst normalized negative entry of the plan.
pub fn check_nonnegativity(pi: &Array4<f32>, normalization: &Array1<f32>, tol: f32) -> CheckReport {
    let batch = pi.dim().0;
    let mut worst = f32::NEG_INFINITY;
    for b in 0..batch {
        let norm = normalization[b] + DIV_GUARD;
        for &v in pi.index_axis(ndarray::Axis(0), b).iter() {
            worst = worst.max(-v / norm);
        }
    }
    CheckReport::new(worst, tol)
}

/// Worst normalized gap between a row's transported mass and its source
/// pixel's mass.
pub fn check_marginal_constraint(
    pi: &Array4<f32>,
    source: &Array3<f32>,
    normalization: &Array1<f32>,
    tol: f32,
) -> CheckReport {
    let (batch, channels, n, window) = pi.dim();
    let mut worst = f32::NEG_INFINITY;
    for b in 0..batch {
        let norm = normalization[b] + DIV_GUARD;
        for c in 0..channels {
            for i in 0..n {
                let mut row = 0.0f32;
                for l in 0..window {
                    row += pi[[b, c, i, l]];
                }
                worst = worst.max((row - source[[b, c, i]]).abs() / norm);
            }
        }
    }
    CheckReport::new(worst, tol)
}

/// Worst normalized excess of the transport cost over the budget ε.
pub fn check_transport_cost(
    pi: &Array4<f32>,
    cost: &CostMatrix,
    eps: f32,
    normalization: &Array1<f32>,
    tol: f32,
) -> CheckReport {
    let (batch, channels, n, window) = pi.dim();
    let mut worst = f32::NEG_INFINITY;
    for b in 0..batch {
        let norm = normalization[b] + DIV_GUARD;
        let mut spent = 0.0f32;
        for c in 0..channels {
            for i in 0..n {
                for l in 0..window {
                    spent += pi[[b, c, i, l]] * cost.costs[[i, l]];
                }
            }
        }
        worst = worst.max(spent / norm - eps);
    }
    CheckReport::new(worst, tol)
}

/// Worst escape of an image from `[clip_min, clip_max]`.
pub fn check_hypercube(
    image: &Array4<f32>,
    clip_min: f32,
    clip_max: f32,
    tol: f32,
) -> CheckReport {
    let mut worst = f32::NEG_INFINITY;
    for &v in image.iter() {
        worst = worst.max(v - clip_max).max(clip_min - v);
    }
    CheckReport::new(worst, tol)
}
