//! Local optimal transport: cost model, coupling codec, and the projection
//! solvers that keep a transport plan inside the Wasserstein ball.
//!
//! Transport is local: a pixel may only send mass to destinations inside a
//! k×k window centered on it, so the plan is a `[batch, channels, pixels,
//! k²]` tensor rather than a full pixels×pixels matrix.

pub mod capacity;
pub mod checks;
pub mod cost;
pub mod coupling;
pub mod projection;
