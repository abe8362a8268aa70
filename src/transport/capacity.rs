//! Capacity-constrained projection.
//!
//! Same feasible set as [`crate::transport::projection`], plus an image-space
//! capacity: no decoded pixel may exceed `clip_max`. The marginal constraint
//! lives in the source-major orientation of the plan while the capacity is
//! destination-major, so the solver alternates: budget/marginal projection,
//! reindex, clip each destination's incoming mass against its headroom,
//! reindex back. The headroom is recomputed from the *current* decode each
//! sweep, since it depends on image state rather than geometry alone.
//!
//! This path is intentionally slower than the budget-only projection and is
//! run periodically (or as a final postprocess) rather than at every
//! gradient step.

use ndarray::{Array1, Array3, Array4};

use crate::config::{CAPACITY_DUAL_MAX_ITER, CAPACITY_SWEEP_LIMIT};
use crate::transport::cost::CostMatrix;
use crate::transport::coupling::{coupling_to_image_flat, detranspose_coupling, transpose_coupling};
use crate::transport::projection::{dual_projection, ProjectionOutcome, SolverOptions};

/// Controls for the alternating capacity solver.
#[derive(Clone, Debug)]
pub struct CapacityOptions {
    /// Maximum alternating sweeps.
    pub sweep_limit: usize,

    /// Inner dual-ascent controls, applied once per sweep.
    pub dual: SolverOptions,

    /// Valid image range.
    pub clip_min: f32,
    pub clip_max: f32,

    /// Tolerance on decoded-pixel overshoot above `clip_max`.
    pub tol: f32,
}

impl Default for CapacityOptions {
    fn default() -> Self {
        Self {
            sweep_limit: CAPACITY_SWEEP_LIMIT,
            dual: SolverOptions {
                max_iter: CAPACITY_DUAL_MAX_ITER,
                ..Default::default()
            },
            clip_min: 0.0,
            clip_max: 1.0,
            tol: 1e-4,
        }
    }
}

/// Projects `pi` in place onto {non-negative, correct marginals, cost within
/// budget, decode within `[clip_min, clip_max]`}. The lower face of the
/// range is implied by non-negativity of mass when `clip_min` is zero; the
/// upper face is enforced by capacity-clipping incoming mass. Reports the
/// accumulated inner dual iterations.
pub fn dual_capacity_constrained_projection(
    pi: &mut Array4<f32>,
    source: &Array3<f32>,
    cost: &CostMatrix,
    budgets: &Array1<f32>,
    opts: &CapacityOptions,
) -> ProjectionOutcome {
    let (batch, channels, _n, window) = pi.dim();
    let n = cost.n_pixels();

    let mut last = dual_projection(pi, source, cost, budgets, &opts.dual);
    let mut total_iterations = last.iterations;
    let mut capacity_ok = false;

    for _sweep in 0..opts.sweep_limit {
        let decoded = coupling_to_image_flat(pi, cost);
        let overshoot = decoded
            .iter()
            .fold(0.0f32, |m, &v| m.max(v - opts.clip_max));
        if overshoot <= opts.tol {
            capacity_ok = true;
            break;
        }

        // Destination-major capacity pass: scale each overfull pixel's
        // incoming mass down to its headroom.
        let mut pit = transpose_coupling(pi, cost);
        for b in 0..batch {
            for c in 0..channels {
                for t in 0..n {
                    let received = decoded[[b, c, t]];
                    if received > opts.clip_max {
                        let scale = opts.clip_max / received;
                        for l in 0..window {
                            pit[[b, c, t, l]] *= scale;
                        }
                    }
                }
            }
        }
        *pi = detranspose_coupling(&pit, cost);

        // Source-major pass: restore marginals and the cost budget.
        last = dual_projection(pi, source, cost, budgets, &opts.dual);
        total_iterations += last.iterations;
    }

    ProjectionOutcome {
        iterations: total_iterations,
        converged: capacity_ok && last.converged,
        ..last
    }
}
