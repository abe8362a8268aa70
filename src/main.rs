//! EARTHMOVER — Wasserstein adversarial examples.
//!
//! Demo CLI: attacks a randomly initialized linear classifier on a
//! synthetic image batch. Real models and datasets plug in through the
//! [`earthmover::model::GradientOracle`] boundary; this binary exists so
//! the projection machinery can be exercised end to end without model
//! files.

use std::path::PathBuf;

use clap::Parser;
use ndarray::Array4;
use rand::{rngs::StdRng, Rng, SeedableRng};

use earthmover::attack::config::{AttackConfig, ProjectionSchedule};
use earthmover::attack::projected_gradient::ProjectedGradient;
use earthmover::model::{count_correct, GradientOracle, LinearSoftmax};

/// EARTHMOVER attack CLI.
#[derive(Parser, Debug)]
#[command(
    name = "earthmover",
    about = "Wasserstein adversarial examples via projected gradient ascent",
    version
)]
struct Cli {
    /// Wasserstein budget per unit of image mass.
    #[arg(long, default_value_t = earthmover::config::DEFAULT_EPS)]
    eps: f32,

    /// Transport window side (odd).
    #[arg(long, default_value_t = earthmover::config::DEFAULT_KERNEL_SIZE)]
    kernel_size: usize,

    /// Gradient step size.
    #[arg(long, default_value_t = earthmover::config::DEFAULT_LR)]
    lr: f32,

    /// Outer attack iterations.
    #[arg(long, default_value_t = earthmover::config::DEFAULT_NB_ITER)]
    nb_iter: usize,

    /// Inner dual-ascent iteration cap.
    #[arg(long, default_value_t = earthmover::config::DEFAULT_DUAL_MAX_ITER)]
    dual_max_iter: usize,

    /// Inner marginal-residual tolerance.
    #[arg(long, default_value_t = earthmover::config::DEFAULT_GRAD_TOL)]
    grad_tol: f32,

    /// Inner dual-increment tolerance.
    #[arg(long, default_value_t = earthmover::config::DEFAULT_INT_TOL)]
    int_tol: f32,

    /// Run the capacity-constrained projection every N iterations
    /// (0 = never).
    #[arg(long, default_value_t = 0)]
    capacity_proj_mod: usize,

    /// Run one extra capacity-constrained projection at the end.
    #[arg(long, default_value_t = false)]
    postprocess: bool,

    /// Clamp the returned adversarial images into the valid range.
    #[arg(long, default_value_t = false)]
    clipping: bool,

    /// Synthetic batch size.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Synthetic image side.
    #[arg(long, default_value_t = 16)]
    image_size: usize,

    /// Number of classes of the toy classifier.
    #[arg(long, default_value_t = 10)]
    classes: usize,

    /// RNG seed for the batch and the classifier weights.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the run summary as JSON to this path.
    #[arg(long)]
    save_info_loc: Option<PathBuf>,
}

fn synthetic_batch(cli: &Cli) -> (Array4<f32>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let images = Array4::from_shape_fn(
        (cli.batch_size, 1, cli.image_size, cli.image_size),
        |_| rng.gen_range(0.0..1.0),
    );
    let labels = (0..cli.batch_size)
        .map(|_| rng.gen_range(0..cli.classes))
        .collect();
    (images, labels)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = AttackConfig {
        eps: cli.eps,
        kernel_size: cli.kernel_size,
        lr: cli.lr,
        nb_iter: cli.nb_iter,
        dual_max_iter: cli.dual_max_iter,
        grad_tol: cli.grad_tol,
        int_tol: cli.int_tol,
        projection: match cli.capacity_proj_mod {
            0 => ProjectionSchedule::BudgetOnly,
            period => ProjectionSchedule::Capacity { period },
        },
        postprocess: cli.postprocess,
        clipping: cli.clipping,
        ..Default::default()
    };

    tracing::info!("EARTHMOVER v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "eps = {}, kernel = {}, lr = {}, {} iterations",
        config.eps,
        config.kernel_size,
        config.lr,
        config.nb_iter,
    );

    let (images, labels) = synthetic_batch(&cli);
    let oracle = LinearSoftmax::random(
        1,
        cli.image_size,
        cli.image_size,
        cli.classes,
        cli.seed ^ 0x5EED,
    );

    let clean_correct = count_correct(&oracle.predict(&images), &labels);
    tracing::info!(
        "clean accuracy: {:.2}% ({}/{})",
        clean_correct as f32 / cli.batch_size as f32 * 100.0,
        clean_correct,
        cli.batch_size,
    );

    let mut attack = ProjectedGradient::new(config)?;
    let adversarial = attack.perturb(&oracle, &images, &labels)?;

    let adv_correct = count_correct(&oracle.predict(&adversarial), &labels);
    let accuracy = adv_correct as f32 / cli.batch_size as f32;
    tracing::info!(
        "adversarial accuracy: {:.2}% ({}/{})",
        accuracy * 100.0,
        adv_correct,
        cli.batch_size,
    );
    attack.log_summary(accuracy);

    if let Some(path) = &cli.save_info_loc {
        attack.save_summary(accuracy, path)?;
        tracing::info!("summary written to {}", path.display());
    }

    Ok(())
}
