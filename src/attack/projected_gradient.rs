//! Projected gradient ascent on the transport plan.
//!
//! State machine per call: build the cost model and the identity plan, then
//! for `nb_iter` iterations: decode → score → pull the loss gradient back
//! to coupling space → normalized ascent step → projection → constraint
//! diagnostics. A final feasibility check is a hard failure; an optional
//! postprocessing pass runs the capacity-constrained projection once more
//! for a tight final solution.

use std::fs::File;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context};
use ndarray::{Array1, Array3, Array4, Axis, Zip};
use serde::Serialize;

use crate::attack::config::{AttackConfig, ProjectionSchedule};
use crate::config::{
    DIV_GUARD, FINAL_CHECK_TOL, FINAL_COST_TOL_FACTOR, LOOP_CHECK_TOL, LOOP_COST_TOL,
    POSTPROCESS_HYPERCUBE_TOL_FACTOR, VERBOSE_PERIOD,
};
use crate::model::{count_correct, GradientOracle};
use crate::transport::capacity::{dual_capacity_constrained_projection, CapacityOptions};
use crate::transport::checks::{
    check_hypercube, check_marginal_constraint, check_nonnegativity, check_transport_cost,
};
use crate::transport::cost::CostMatrix;
use crate::transport::coupling::{
    coupling_inf_norm, coupling_to_image, flatten_image, identity_coupling,
    image_grad_to_coupling_grad, total_mass,
};
use crate::transport::projection::{dual_projection, ProjectionOutcome};

/// Scalar summary of one attack run.
#[derive(Debug, Serialize)]
pub struct AttackSummary {
    /// Accuracy of the attacked model on the adversarial batch.
    pub accuracy: f32,

    /// Final loss value, if any iteration ran.
    pub final_loss: Option<f32>,

    /// Wall-clock time spent inside projections, milliseconds.
    pub run_time_ms: f64,

    /// Inner dual iterations accumulated over the run.
    pub dual_iterations: u64,

    /// Projection calls made.
    pub projection_calls: u64,

    /// Mean dual iterations per projection call.
    pub avg_dual_iterations: f32,

    /// Mean projection wall-clock per call, milliseconds.
    pub avg_projection_time_ms: f64,
}

/// Wasserstein projected-gradient attack. Counters reset at construction
/// and accumulate across `perturb` calls until read.
pub struct ProjectedGradient {
    pub config: AttackConfig,

    /// Wall-clock spent inside projections, milliseconds.
    pub run_time_ms: f64,

    /// Inner dual iterations accumulated over all projection calls.
    pub dual_iterations: u64,

    /// Number of projection calls.
    pub projection_calls: u64,

    /// Loss per outer iteration.
    pub loss_history: Vec<f32>,

    /// Correct predictions per outer iteration.
    pub correct_history: Vec<usize>,
}

impl ProjectedGradient {
    /// Validates the configuration and starts with zeroed counters.
    pub fn new(config: AttackConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            run_time_ms: 0.0,
            dual_iterations: 0,
            projection_calls: 0,
            loss_history: Vec::new(),
            correct_history: Vec::new(),
        })
    }

    /// Runs the attack on one batch and returns the adversarial images.
    ///
    /// Fails only on malformed inputs or when the final plan violates the
    /// Wasserstein-ball constraints beyond tolerance; convergence
    /// shortfalls and mid-loop violations are logged and tolerated.
    pub fn perturb<O: GradientOracle>(
        &mut self,
        oracle: &O,
        images: &Array4<f32>,
        labels: &[usize],
    ) -> anyhow::Result<Array4<f32>> {
        let (batch, _channels, height, width) = images.dim();
        if labels.len() != batch {
            bail!("{} labels for a batch of {}", labels.len(), batch);
        }

        let cfg = self.config.clone();
        let cost = CostMatrix::build(height, width, cfg.kernel_size)?;
        let source = flatten_image(images);
        let normalization = total_mass(images);
        let budgets = normalization.mapv(|m| cfg.eps * m);

        let mut pi = identity_coupling(images, &cost);

        for t in 0..cfg.nb_iter {
            let adv = coupling_to_image(&pi, &cost);
            let scored_input = if cfg.score_on_clipped {
                adv.mapv(|v| v.clamp(cfg.clip_min, cfg.clip_max))
            } else {
                adv.clone()
            };
            let response = oracle.loss_and_grad(&scored_input, labels);
            let correct = count_correct(&response.scores, labels);
            self.loss_history.push(response.loss);
            self.correct_history.push(correct);

            let mut grad = response.input_grad;
            if cfg.score_on_clipped {
                // The clamp has zero slope outside the valid range.
                Zip::from(&mut grad).and(&adv).for_each(|g, &v| {
                    if v < cfg.clip_min || v > cfg.clip_max {
                        *g = 0.0;
                    }
                });
            }
            let mut step = image_grad_to_coupling_grad(&grad, &cost);

            // Constant step length per batch element: normalize by the
            // gradient's infinity norm before applying the learning rate.
            let norms = coupling_inf_norm(&step);
            for b in 0..batch {
                let scale = cfg.lr / (norms[b] + DIV_GUARD);
                step.index_axis_mut(Axis(0), b)
                    .mapv_inplace(|v| v * scale);
            }
            Zip::from(&mut pi).and(&step).for_each(|p, &s| *p += s);

            let started = Instant::now();
            let outcome = self.project(t, &mut pi, &source, &cost, &budgets);
            let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
            self.run_time_ms += elapsed_ms;
            self.dual_iterations += outcome.iterations as u64;
            self.projection_calls += 1;

            if !outcome.converged {
                tracing::debug!(
                    iteration = t + 1,
                    marginal_residual = outcome.marginal_residual as f64,
                    "dual ascent stopped at its iteration cap"
                );
            }
            if cfg.verbose && (t + 1) % VERBOSE_PERIOD == 0 {
                tracing::info!(
                    "iter {:4}, loss {:9.3}, acc {:5.2}%, dual iters {:4}, proj time {:7.3} ms",
                    t + 1,
                    response.loss,
                    correct as f32 / batch as f32 * 100.0,
                    outcome.iterations,
                    elapsed_ms,
                );
            }

            self.diagnose(&pi, &source, &cost, &normalization, t);
        }

        let adv = coupling_to_image(&pi, &cost);
        let cube = check_hypercube(&adv, cfg.clip_min, cfg.clip_max, FINAL_CHECK_TOL);
        if !cube.ok {
            tracing::warn!(
                worst = cube.worst as f64,
                "adversarial image leaves the valid range; capacity projection can tighten it"
            );
        }
        self.final_check(&pi, &source, &cost, &normalization, FINAL_CHECK_TOL)?;

        let adv = if cfg.postprocess {
            tracing::info!("postprocessing projection for a tight final solution");
            let opts = CapacityOptions {
                dual: cfg.solver_options(),
                clip_min: cfg.clip_min,
                clip_max: cfg.clip_max,
                ..Default::default()
            };
            let started = Instant::now();
            let outcome =
                dual_capacity_constrained_projection(&mut pi, &source, &cost, &budgets, &opts);
            self.run_time_ms += started.elapsed().as_secs_f64() * 1e3;
            self.dual_iterations += outcome.iterations as u64;
            self.projection_calls += 1;

            let adv = coupling_to_image(&pi, &cost);
            let tol = cfg.eps * POSTPROCESS_HYPERCUBE_TOL_FACTOR;
            let cube = check_hypercube(&adv, cfg.clip_min, cfg.clip_max, tol);
            if !cube.ok {
                tracing::warn!(
                    worst = cube.worst as f64,
                    tol = tol as f64,
                    "postprocess left range violations"
                );
            }
            self.final_check(&pi, &source, &cost, &normalization, LOOP_CHECK_TOL)?;
            adv
        } else {
            adv
        };

        if cfg.clipping {
            Ok(adv.mapv(|v| v.clamp(cfg.clip_min, cfg.clip_max)))
        } else {
            Ok(adv)
        }
    }

    /// Projection step per the configured schedule.
    fn project(
        &self,
        iteration: usize,
        pi: &mut Array4<f32>,
        source: &Array3<f32>,
        cost: &CostMatrix,
        budgets: &Array1<f32>,
    ) -> ProjectionOutcome {
        if self.config.projection.capacity_due(iteration) {
            let opts = CapacityOptions {
                dual: self.config.solver_options(),
                clip_min: self.config.clip_min,
                clip_max: self.config.clip_max,
                ..Default::default()
            };
            dual_capacity_constrained_projection(pi, source, cost, budgets, &opts)
        } else {
            dual_projection(pi, source, cost, budgets, &self.config.solver_options())
        }
    }

    /// Mid-loop constraint diagnostics; violations are reported, not fatal.
    fn diagnose(
        &self,
        pi: &Array4<f32>,
        source: &Array3<f32>,
        cost: &CostMatrix,
        normalization: &Array1<f32>,
        iteration: usize,
    ) {
        let nn = check_nonnegativity(pi, normalization, LOOP_CHECK_TOL);
        let marginal = check_marginal_constraint(pi, source, normalization, LOOP_CHECK_TOL);
        let spent = check_transport_cost(pi, cost, self.config.eps, normalization, LOOP_COST_TOL);
        for (name, report) in [
            ("nonnegativity", nn),
            ("marginal", marginal),
            ("transport cost", spent),
        ] {
            if !report.ok {
                tracing::debug!(
                    iteration = iteration + 1,
                    constraint = name,
                    worst = report.worst as f64,
                    tol = report.tol as f64,
                    "constraint check exceeded tolerance"
                );
            }
        }
    }

    /// Hard feasibility gate on the returned plan.
    fn final_check(
        &self,
        pi: &Array4<f32>,
        source: &Array3<f32>,
        cost: &CostMatrix,
        normalization: &Array1<f32>,
        tol: f32,
    ) -> anyhow::Result<()> {
        let nn = check_nonnegativity(pi, normalization, tol);
        let marginal = check_marginal_constraint(pi, source, normalization, tol);
        let cost_tol = (self.config.eps * FINAL_COST_TOL_FACTOR).max(f32::EPSILON);
        let spent = check_transport_cost(pi, cost, self.config.eps, normalization, cost_tol);

        if !nn.ok || !marginal.ok || !spent.ok {
            bail!(
                "final plan is infeasible: negativity {:.3e} (tol {:.0e}), \
                 marginal {:.3e} (tol {:.0e}), cost excess {:.3e} (tol {:.0e})",
                nn.worst,
                nn.tol,
                marginal.worst,
                marginal.tol,
                spent.worst,
                spent.tol,
            );
        }
        Ok(())
    }

    /// Scalar summary for reporting and persistence.
    pub fn summary(&self, accuracy: f32) -> AttackSummary {
        let calls = self.projection_calls.max(1) as f64;
        AttackSummary {
            accuracy,
            final_loss: self.loss_history.last().copied(),
            run_time_ms: self.run_time_ms,
            dual_iterations: self.dual_iterations,
            projection_calls: self.projection_calls,
            avg_dual_iterations: self.dual_iterations as f32 / calls as f32,
            avg_projection_time_ms: self.run_time_ms / calls,
        }
    }

    /// Logs the summary through the ambient subscriber.
    pub fn log_summary(&self, accuracy: f32) {
        let summary = self.summary(accuracy);
        tracing::info!(
            accuracy = summary.accuracy as f64,
            run_time_ms = summary.run_time_ms,
            dual_iterations = summary.dual_iterations,
            projection_calls = summary.projection_calls,
            "attack finished"
        );
    }

    /// Persists the summary as JSON.
    pub fn save_summary(&self, accuracy: f32, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating summary file {}", path.display()))?;
        serde_json::to_writer_pretty(file, &self.summary(accuracy))
            .context("serializing attack summary")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearSoftmax;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn demo_batch(batch: usize, h: usize, w: usize, seed: u64) -> (Array4<f32>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let images = Array4::from_shape_fn((batch, 1, h, w), |_| rng.gen_range(0.1..0.9f32));
        let labels = (0..batch).map(|_| rng.gen_range(0..3)).collect();
        (images, labels)
    }

    fn quiet_config() -> AttackConfig {
        AttackConfig {
            nb_iter: 5,
            dual_max_iter: 100,
            grad_tol: 1e-6,
            int_tol: 1e-6,
            verbose: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_attack_returns_feasible_adversarial_batch() {
        let (images, labels) = demo_batch(2, 6, 6, 1);
        let oracle = LinearSoftmax::random(1, 6, 6, 3, 2);
        let mut attack = ProjectedGradient::new(quiet_config()).unwrap();
        let adv = attack.perturb(&oracle, &images, &labels).unwrap();
        assert_eq!(adv.dim(), images.dim());
        assert_eq!(attack.loss_history.len(), 5);
        assert_eq!(attack.correct_history.len(), 5);
        assert_eq!(attack.projection_calls, 5);
        assert!(attack.dual_iterations >= 5);
        // Total image mass is preserved by the transport constraints.
        let mass_in = total_mass(&images);
        let mass_out = total_mass(&adv);
        for b in 0..2 {
            assert!(
                (mass_in[b] - mass_out[b]).abs() / mass_in[b] < 1e-3,
                "mass drifted: {} -> {}",
                mass_in[b],
                mass_out[b]
            );
        }
    }

    #[test]
    fn test_zero_budget_attack_returns_original() {
        let (images, labels) = demo_batch(1, 5, 5, 3);
        let oracle = LinearSoftmax::random(1, 5, 5, 3, 4);
        let config = AttackConfig {
            eps: 0.0,
            dual_max_iter: 300,
            ..quiet_config()
        };
        let mut attack = ProjectedGradient::new(config).unwrap();
        let adv = attack.perturb(&oracle, &images, &labels).unwrap();
        for (a, b) in adv.iter().zip(images.iter()) {
            assert!((a - b).abs() < 1e-4, "adv {} original {}", a, b);
        }
    }

    #[test]
    fn test_capacity_schedule_and_postprocess_run() {
        let (images, labels) = demo_batch(1, 5, 5, 5);
        let oracle = LinearSoftmax::random(1, 5, 5, 3, 6);
        let config = AttackConfig {
            nb_iter: 4,
            projection: ProjectionSchedule::Capacity { period: 2 },
            postprocess: true,
            ..quiet_config()
        };
        let mut attack = ProjectedGradient::new(config).unwrap();
        let adv = attack.perturb(&oracle, &images, &labels).unwrap();
        // 4 in-loop projections plus the postprocess pass.
        assert_eq!(attack.projection_calls, 5);
        let cube = check_hypercube(&adv, 0.0, 1.0, 0.5 * 5e-2);
        assert!(cube.ok, "worst range escape {}", cube.worst);
    }

    #[test]
    fn test_scoring_policy_orderings_both_run() {
        let (images, labels) = demo_batch(1, 4, 4, 7);
        let oracle = LinearSoftmax::random(1, 4, 4, 3, 8);
        for score_on_clipped in [true, false] {
            let config = AttackConfig {
                score_on_clipped,
                nb_iter: 3,
                ..quiet_config()
            };
            let mut attack = ProjectedGradient::new(config).unwrap();
            assert!(attack.perturb(&oracle, &images, &labels).is_ok());
        }
    }

    #[test]
    fn test_clipping_bounds_output() {
        let (images, labels) = demo_batch(1, 5, 5, 9);
        let oracle = LinearSoftmax::random(1, 5, 5, 3, 10);
        let config = AttackConfig {
            clipping: true,
            ..quiet_config()
        };
        let mut attack = ProjectedGradient::new(config).unwrap();
        let adv = attack.perturb(&oracle, &images, &labels).unwrap();
        for &v in adv.iter() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_rejects_mismatched_labels() {
        let (images, _) = demo_batch(2, 4, 4, 11);
        let oracle = LinearSoftmax::random(1, 4, 4, 3, 12);
        let mut attack = ProjectedGradient::new(quiet_config()).unwrap();
        assert!(attack.perturb(&oracle, &images, &[0]).is_err());
    }

    #[test]
    fn test_summary_aggregates_counters() {
        let (images, labels) = demo_batch(1, 4, 4, 13);
        let oracle = LinearSoftmax::random(1, 4, 4, 3, 14);
        let mut attack = ProjectedGradient::new(quiet_config()).unwrap();
        attack.perturb(&oracle, &images, &labels).unwrap();
        let summary = attack.summary(0.5);
        assert_eq!(summary.projection_calls, 5);
        assert!(summary.avg_dual_iterations >= 1.0);
        assert_eq!(summary.final_loss, attack.loss_history.last().copied());
    }
}
