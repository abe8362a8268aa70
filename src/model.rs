//! External classifier boundary.
//!
//! The attack consumes the model purely as an oracle: scores for an image
//! batch, and the gradient of a classification loss with respect to the
//! input. Nothing in the transport core inspects model internals.
//!
//! [`LinearSoftmax`] is a self-contained oracle (linear logits + summed
//! cross-entropy with an analytic input gradient) used by the CLI demo and
//! the end-to-end tests; real models plug in through the same trait.

use ndarray::{Array1, Array2, Array4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Scores, loss, and input gradient for one oracle query.
#[derive(Debug)]
pub struct OracleResponse {
    /// Class scores, `[batch, classes]`.
    pub scores: Array2<f32>,

    /// Summed classification loss over the batch.
    pub loss: f32,

    /// Gradient of the loss with respect to the input images.
    pub input_grad: Array4<f32>,
}

/// A classifier with gradient support, consumed as a black box.
pub trait GradientOracle {
    /// Class scores for a batch of images, `[batch, classes]`.
    fn predict(&self, images: &Array4<f32>) -> Array2<f32>;

    /// Loss and its input gradient for the given labels.
    fn loss_and_grad(&self, images: &Array4<f32>, labels: &[usize]) -> OracleResponse;
}

/// Linear classifier with summed cross-entropy loss.
pub struct LinearSoftmax {
    /// `[classes, channels·height·width]` weight matrix.
    pub weights: Array2<f32>,

    /// Expected input geometry.
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl LinearSoftmax {
    /// Wraps an explicit weight matrix.
    pub fn new(weights: Array2<f32>, channels: usize, height: usize, width: usize) -> Self {
        assert_eq!(weights.dim().1, channels * height * width);
        Self {
            weights,
            channels,
            height,
            width,
        }
    }

    /// Random weights, scaled by the input dimension.
    pub fn random(
        channels: usize,
        height: usize,
        width: usize,
        n_classes: usize,
        seed: u64,
    ) -> Self {
        let d = channels * height * width;
        let scale = 1.0 / (d as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = Array2::from_shape_fn((n_classes, d), |_| {
            let z: f32 = rng.sample(StandardNormal);
            z * scale
        });
        Self::new(weights, channels, height, width)
    }

    fn flatten(&self, images: &Array4<f32>) -> Array2<f32> {
        let (b, c, h, w) = images.dim();
        let mut flat = Array2::zeros((b, c * h * w));
        for bi in 0..b {
            let mut k = 0;
            for ci in 0..c {
                for y in 0..h {
                    for x in 0..w {
                        flat[[bi, k]] = images[[bi, ci, y, x]];
                        k += 1;
                    }
                }
            }
        }
        flat
    }
}

impl GradientOracle for LinearSoftmax {
    fn predict(&self, images: &Array4<f32>) -> Array2<f32> {
        self.flatten(images).dot(&self.weights.t())
    }

    fn loss_and_grad(&self, images: &Array4<f32>, labels: &[usize]) -> OracleResponse {
        let (b, c, h, w) = images.dim();
        let scores = self.predict(images);
        let n_classes = scores.dim().1;

        let mut loss = 0.0f32;
        let mut dscores = Array2::zeros((b, n_classes));
        for bi in 0..b {
            let probs = softmax(scores.row(bi).to_owned());
            loss += -(probs[labels[bi]].max(f32::MIN_POSITIVE)).ln();
            for k in 0..n_classes {
                dscores[[bi, k]] = probs[k] - if k == labels[bi] { 1.0 } else { 0.0 };
            }
        }

        // d loss / d input = dscores · W, unflattened.
        let grad_flat = dscores.dot(&self.weights);
        let mut input_grad = Array4::zeros((b, c, h, w));
        for bi in 0..b {
            let mut k = 0;
            for ci in 0..c {
                for y in 0..h {
                    for x in 0..w {
                        input_grad[[bi, ci, y, x]] = grad_flat[[bi, k]];
                        k += 1;
                    }
                }
            }
        }

        OracleResponse {
            scores,
            loss,
            input_grad,
        }
    }
}

/// Numerically stable softmax over one score row.
fn softmax(mut scores: Array1<f32>) -> Array1<f32> {
    let max = scores.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    scores.mapv_inplace(|v| (v - max).exp());
    let sum = scores.sum();
    scores.mapv_inplace(|v| v / sum);
    scores
}

/// Number of predictions matching the labels.
pub fn count_correct(scores: &Array2<f32>, labels: &[usize]) -> usize {
    let (b, n_classes) = scores.dim();
    let mut correct = 0;
    for bi in 0..b {
        let mut best = 0;
        for k in 1..n_classes {
            if scores[[bi, k]] > scores[[bi, best]] {
                best = k;
            }
        }
        if best == labels[bi] {
            correct += 1;
        }
    }
    correct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_shapes() {
        let model = LinearSoftmax::random(1, 4, 4, 3, 42);
        let images = Array4::zeros((2, 1, 4, 4));
        let scores = model.predict(&images);
        assert_eq!(scores.dim(), (2, 3));
    }

    #[test]
    fn test_softmax_normalizes() {
        let p = softmax(Array1::from_vec(vec![1.0, 2.0, 3.0]));
        assert!((p.sum() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let model = LinearSoftmax::random(1, 3, 3, 2, 7);
        let mut images = Array4::from_elem((1, 1, 3, 3), 0.5f32);
        let labels = [1usize];
        let response = model.loss_and_grad(&images, &labels);

        let delta = 1e-3f32;
        images[[0, 0, 1, 2]] += delta;
        let bumped = model.loss_and_grad(&images, &labels);
        let numeric = (bumped.loss - response.loss) / delta;
        let analytic = response.input_grad[[0, 0, 1, 2]];
        assert!(
            (numeric - analytic).abs() < 1e-2,
            "numeric {} analytic {}",
            numeric,
            analytic
        );
    }

    #[test]
    fn test_count_correct() {
        let mut scores = Array2::zeros((2, 3));
        scores[[0, 2]] = 1.0;
        scores[[1, 0]] = 1.0;
        assert_eq!(count_correct(&scores, &[2, 1]), 1);
        assert_eq!(count_correct(&scores, &[2, 0]), 2);
    }
}
