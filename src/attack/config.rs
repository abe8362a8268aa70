//! Attack configuration.

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_DUAL_MAX_ITER, DEFAULT_EPS, DEFAULT_GRAD_TOL, DEFAULT_INT_TOL, DEFAULT_KERNEL_SIZE,
    DEFAULT_LR, DEFAULT_NB_ITER,
};
use crate::transport::projection::SolverOptions;

/// Which projection runs after each gradient step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionSchedule {
    /// Budget-only dual projection every iteration.
    BudgetOnly,

    /// Budget-only projection normally; the capacity-constrained projection
    /// every `period` iterations.
    Capacity { period: usize },
}

impl ProjectionSchedule {
    /// Whether the capacity path is due at the given (0-based) iteration.
    pub fn capacity_due(&self, iteration: usize) -> bool {
        match *self {
            ProjectionSchedule::BudgetOnly => false,
            ProjectionSchedule::Capacity { period } => (iteration + 1) % period == 0,
        }
    }
}

/// Recognized attack options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Wasserstein budget per unit of image mass.
    pub eps: f32,

    /// Side of the square transport window. Odd.
    pub kernel_size: usize,

    /// Gradient step size.
    pub lr: f32,

    /// Outer attack iterations.
    pub nb_iter: usize,

    /// Inner dual-ascent iteration cap.
    pub dual_max_iter: usize,

    /// Inner marginal-residual tolerance.
    pub grad_tol: f32,

    /// Inner dual-increment tolerance.
    pub int_tol: f32,

    /// Projection schedule.
    pub projection: ProjectionSchedule,

    /// Valid image range.
    pub clip_min: f32,
    pub clip_max: f32,

    /// Clamp the returned adversarial image into the valid range.
    pub clipping: bool,

    /// Clamp the decoded image before handing it to the oracle. Fixed at
    /// configuration time so both orderings are explicit and testable.
    pub score_on_clipped: bool,

    /// Run one extra capacity-constrained projection at the end for a
    /// tighter final solution.
    pub postprocess: bool,

    /// Log periodic progress.
    pub verbose: bool,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            eps: DEFAULT_EPS,
            kernel_size: DEFAULT_KERNEL_SIZE,
            lr: DEFAULT_LR,
            nb_iter: DEFAULT_NB_ITER,
            dual_max_iter: DEFAULT_DUAL_MAX_ITER,
            grad_tol: DEFAULT_GRAD_TOL,
            int_tol: DEFAULT_INT_TOL,
            projection: ProjectionSchedule::BudgetOnly,
            clip_min: 0.0,
            clip_max: 1.0,
            clipping: false,
            score_on_clipped: true,
            postprocess: false,
            verbose: true,
        }
    }
}

impl AttackConfig {
    /// Rejects malformed configurations before any state is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.eps < 0.0 {
            bail!("transport budget must be non-negative, got {}", self.eps);
        }
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            bail!(
                "kernel size must be odd and positive, got {}",
                self.kernel_size
            );
        }
        if self.lr <= 0.0 {
            bail!("step size must be positive, got {}", self.lr);
        }
        if self.nb_iter == 0 {
            bail!("at least one attack iteration is required");
        }
        if self.clip_min >= self.clip_max {
            bail!(
                "clip range is empty: [{}, {}]",
                self.clip_min,
                self.clip_max
            );
        }
        if let ProjectionSchedule::Capacity { period: 0 } = self.projection {
            bail!("capacity projection period must be positive");
        }
        Ok(())
    }

    /// Inner solver controls derived from the attack options.
    pub fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            max_iter: self.dual_max_iter,
            grad_tol: self.grad_tol,
            int_tol: self.int_tol,
            trace: false,
        }
    }
}
