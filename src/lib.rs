//! # EARTHMOVER
//!
//! Adversarial image perturbations constrained to a **Wasserstein ball**:
//! instead of bounding the perturbation in an Lp norm, the adversarial image
//! must be reachable from the original by a transport plan of total cost
//! ≤ ε. Mass moves between nearby pixels; the image is "rearranged", not
//! overwritten.
//!
//! ## Components
//!
//! 1. **Cost model** — per-pixel local cost matrix over a k×k transport
//!    window, plus the index maps between source-major and destination-major
//!    orientations of the plan.
//! 2. **Coupling codec** — transport plan ↔ adversarial image, with the
//!    exact linear adjoint used for gradient pullback.
//! 3. **Dual projection** — Euclidean projection of a raw plan onto
//!    {π ≥ 0, correct row marginals, ⟨π, C⟩ ≤ ε·mass} by dual ascent.
//! 4. **Capacity-constrained projection** — additionally keeps every decoded
//!    pixel inside the valid image range, by alternating between the two
//!    plan orientations.
//! 5. **Attack loop** — projected gradient ascent against a classifier
//!    consumed through the [`model::GradientOracle`] boundary.

pub mod attack;
pub mod model;
pub mod transport;

/// Crate-wide constants.
pub mod config {
    /// Cost sentinel for destinations outside the image. Large but finite so
    /// that dual arithmetic stays stable; any realistic budget prices these
    /// slots out of the plan.
    pub const INF_COST: f32 = 1e6;

    /// Additive guard for divisions by data-dependent denominators.
    pub const DIV_GUARD: f32 = 1e-8;

    /// Default Wasserstein budget per unit of image mass.
    pub const DEFAULT_EPS: f32 = 0.5;

    /// Default transport window side. Must be odd.
    pub const DEFAULT_KERNEL_SIZE: usize = 5;

    /// Default gradient step size.
    pub const DEFAULT_LR: f32 = 0.1;

    /// Default outer attack iterations.
    pub const DEFAULT_NB_ITER: usize = 20;

    /// Default inner dual-ascent iteration cap.
    pub const DEFAULT_DUAL_MAX_ITER: usize = 15;

    /// Default marginal-residual tolerance for the inner solver.
    pub const DEFAULT_GRAD_TOL: f32 = 1e-4;

    /// Default dual-increment tolerance for the inner solver.
    pub const DEFAULT_INT_TOL: f32 = 1e-4;

    /// Alternating sweeps allowed in the capacity-constrained projection.
    pub const CAPACITY_SWEEP_LIMIT: usize = 50;

    /// Dual iterations per sweep inside the capacity-constrained projection.
    pub const CAPACITY_DUAL_MAX_ITER: usize = 60;

    /// Progress is logged every this many outer iterations when verbose.
    pub const VERBOSE_PERIOD: usize = 10;

    /// Constraint-check tolerance applied after every projection.
    pub const LOOP_CHECK_TOL: f32 = 1e-6;

    /// Constraint-check tolerance at the final feasibility check.
    pub const FINAL_CHECK_TOL: f32 = 1e-5;

    /// Absolute tolerance on the normalized transport cost during the loop.
    pub const LOOP_COST_TOL: f32 = 1e-3;

    /// Relative factor on ε for the transport-cost tolerance at the final
    /// check.
    pub const FINAL_COST_TOL_FACTOR: f32 = 1e-3;

    /// Relative factor on ε for the hypercube tolerance after the
    /// postprocessing projection.
    pub const POSTPROCESS_HYPERCUBE_TOL_FACTOR: f32 = 5e-2;
}
