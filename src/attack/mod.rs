//! Projected gradient ascent inside the Wasserstein ball.
//!
//! The attack owns the coupling tensor across iterations: each step decodes
//! it, queries the oracle for a loss gradient, ascends, and projects the
//! plan back into the feasible set before the next decode.

pub mod config;
pub mod projected_gradient;
