//! Euclidean projection onto the Wasserstein ball by dual ascent.
//!
//! Given a raw (possibly infeasible) plan `π̂`, finds the nearest plan in
//!
//! ```text
//! { π ≥ 0,  Σ_l π_il = x_i ∀i,  ⟨π, C⟩ ≤ ε·mass }
//! ```
//!
//! per batch element. The Lagrangian dual has one multiplier α_i per
//! `(channel, pixel)` row and one scalar β ≥ 0 per batch element for the
//! cost budget, and the primal minimizer is available in closed form:
//!
//! ```text
//! π_il = max(0, π̂_il − α_i − β·C_il)
//! ```
//!
//! Each iteration evaluates the constraint violations under the current
//! duals and ascends them with Newton-scaled steps (violation divided by
//! the active-set curvature). Both residual functions are piecewise linear
//! and convex in their multiplier, so the scaled step never crosses the
//! root from the shrinking side and the ascent settles in a handful of
//! iterations. The loop exits early once the marginal residual and the
//! dual increment fall below tolerance; the iteration count actually used
//! is reported to the caller.

use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut3, Axis};
use rayon::prelude::*;

use crate::config::{DEFAULT_DUAL_MAX_ITER, DEFAULT_GRAD_TOL, DEFAULT_INT_TOL, DIV_GUARD};
use crate::transport::cost::CostMatrix;

/// Convergence controls for the dual ascent.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// Iteration cap.
    pub max_iter: usize,

    /// Tolerance on the infinity norm of the marginal residual.
    pub grad_tol: f32,

    /// Tolerance on the infinity norm of the dual increment.
    pub int_tol: f32,

    /// Record the per-iteration marginal residual norm (diagnostics).
    pub trace: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iter: DEFAULT_DUAL_MAX_ITER,
            grad_tol: DEFAULT_GRAD_TOL,
            int_tol: DEFAULT_INT_TOL,
            trace: false,
        }
    }
}

/// Outcome of a projection call, merged over the batch.
#[derive(Clone, Debug, Default)]
pub struct ProjectionOutcome {
    /// Dual iterations used (worst batch element).
    pub iterations: usize,

    /// Whether every batch element met both tolerances before the cap.
    pub converged: bool,

    /// Infinity norm of the marginal residual at exit.
    pub marginal_residual: f32,

    /// Transport cost minus budget at exit (negative = slack).
    pub cost_gap: f32,

    /// Infinity norm of the last dual increment.
    pub dual_increment: f32,

    /// Per-iteration marginal residual norms, elementwise max over the
    /// batch. Empty unless [`SolverOptions::trace`] is set.
    pub residual_history: Vec<f32>,
}

impl ProjectionOutcome {
    fn merge(outcomes: Vec<ProjectionOutcome>) -> ProjectionOutcome {
        let mut merged = ProjectionOutcome {
            converged: true,
            cost_gap: f32::NEG_INFINITY,
            ..Default::default()
        };
        for o in outcomes {
            merged.iterations = merged.iterations.max(o.iterations);
            merged.converged &= o.converged;
            merged.marginal_residual = merged.marginal_residual.max(o.marginal_residual);
            merged.cost_gap = merged.cost_gap.max(o.cost_gap);
            merged.dual_increment = merged.dual_increment.max(o.dual_increment);
            for (i, r) in o.residual_history.into_iter().enumerate() {
                if i < merged.residual_history.len() {
                    merged.residual_history[i] = merged.residual_history[i].max(r);
                } else {
                    merged.residual_history.push(r);
                }
            }
        }
        merged
    }
}

/// Projects `pi` in place onto the feasible set, one independent solve per
/// batch element (rayon-parallel). `source` is the flattened image
/// `[b, c, n]`; `budgets` holds ε·mass per batch element.
pub fn dual_projection(
    pi: &mut ndarray::Array4<f32>,
    source: &Array3<f32>,
    cost: &CostMatrix,
    budgets: &ndarray::Array1<f32>,
    opts: &SolverOptions,
) -> ProjectionOutcome {
    let blocks: Vec<_> = pi.axis_iter_mut(Axis(0)).collect();
    let outcomes: Vec<ProjectionOutcome> = blocks
        .into_par_iter()
        .enumerate()
        .map(|(b, block)| {
            project_single(
                block,
                source.index_axis(Axis(0), b),
                &cost.costs,
                budgets[b],
                opts,
            )
        })
        .collect();
    ProjectionOutcome::merge(outcomes)
}

/// Dual ascent for one batch element. `pi` is `[c, n, window]`, `x` is
/// `[c, n]`.
fn project_single(
    mut pi: ArrayViewMut3<f32>,
    x: ArrayView2<f32>,
    costs: &Array2<f32>,
    budget: f32,
    opts: &SolverOptions,
) -> ProjectionOutcome {
    let (channels, n, window) = pi.dim();
    let pihat = pi.to_owned();

    let mut alpha = Array2::<f32>::zeros((channels, n));
    let mut beta = 0.0f32;

    let mut outcome = ProjectionOutcome::default();

    for iter in 1..=opts.max_iter {
        outcome.iterations = iter;

        // Marginal pass: one Newton-scaled step per row.
        let mut max_r = 0.0f32;
        let mut max_dalpha = 0.0f32;
        for c in 0..channels {
            for i in 0..n {
                let a = alpha[[c, i]];
                let mut row_sum = 0.0f32;
                let mut active = 0usize;
                let mut top = f32::NEG_INFINITY;
                for l in 0..window {
                    let shifted = pihat[[c, i, l]] - a - beta * costs[[i, l]];
                    top = top.max(shifted + a);
                    if shifted > 0.0 {
                        row_sum += shifted;
                        active += 1;
                    }
                }
                let r = row_sum - x[[c, i]];
                max_r = max_r.max(r.abs());
                let step = if active > 0 {
                    r / active as f32
                } else {
                    // Row fully clamped: re-anchor just below the largest
                    // shifted entry so the row can carry its mass again.
                    top - x[[c, i]] - a
                };
                alpha[[c, i]] = a + step;
                max_dalpha = max_dalpha.max(step.abs());
            }
        }

        // Budget pass under the updated marginals.
        let mut cost_sum = 0.0f32;
        let mut curvature = 0.0f32;
        for c in 0..channels {
            for i in 0..n {
                let a = alpha[[c, i]];
                for l in 0..window {
                    let cil = costs[[i, l]];
                    let v = pihat[[c, i, l]] - a - beta * cil;
                    if v > 0.0 {
                        cost_sum += v * cil;
                        curvature += cil * cil;
                    }
                }
            }
        }
        let gap = cost_sum - budget;
        let mut dbeta = 0.0f32;
        if gap > 0.0 || beta > 0.0 {
            let next = (beta + gap / (curvature + DIV_GUARD)).max(0.0);
            dbeta = next - beta;
            beta = next;
        }

        outcome.marginal_residual = max_r;
        outcome.cost_gap = gap;
        outcome.dual_increment = max_dalpha.max(dbeta.abs());
        if opts.trace {
            outcome.residual_history.push(max_r);
        }

        if max_r < opts.grad_tol && outcome.dual_increment < opts.int_tol {
            outcome.converged = true;
            break;
        }
    }

    // Best-effort primal under the final duals, converged or not.
    for c in 0..channels {
        for i in 0..n {
            let a = alpha[[c, i]];
            for l in 0..window {
                pi[[c, i, l]] = (pihat[[c, i, l]] - a - beta * costs[[i, l]]).max(0.0);
            }
        }
    }

    outcome
}
