//! Coupling codec: transport plan ↔ adversarial image, and plan
//! reorientation.
//!
//! A coupling `π` has shape `[batch, channels, n_pixels, kernel²]` in raw
//! mass units: entry `(b, c, i, l)` is the mass that channel `c` of batch
//! element `b` moves from pixel `i` into the `l`-th slot of its window.
//! Decoding scatter-adds every edge into its destination pixel. The decode
//! is linear in `π`, so its adjoint (a gather over the same index map) is
//! the exact gradient pullback used by the attack loop.

use ndarray::{Array1, Array2, Array3, Array4, Axis};

use crate::transport::cost::CostMatrix;

/// Flattens a `[b, c, h, w]` image into `[b, c, h·w]` row-major pixels.
pub fn flatten_image(image: &Array4<f32>) -> Array3<f32> {
    let (b, c, h, w) = image.dim();
    let mut flat = Array3::zeros((b, c, h * w));
    for bi in 0..b {
        for ci in 0..c {
            for y in 0..h {
                for x in 0..w {
                    flat[[bi, ci, y * w + x]] = image[[bi, ci, y, x]];
                }
            }
        }
    }
    flat
}

/// Inverse of [`flatten_image`].
pub fn unflatten_image(flat: &Array3<f32>, height: usize, width: usize) -> Array4<f32> {
    let (b, c, _n) = flat.dim();
    let mut image = Array4::zeros((b, c, height, width));
    for bi in 0..b {
        for ci in 0..c {
            for y in 0..height {
                for x in 0..width {
                    image[[bi, ci, y, x]] = flat[[bi, ci, y * width + x]];
                }
            }
        }
    }
    image
}

/// The identity plan: every pixel keeps all of its mass on the center slot.
/// Decodes back to the source image exactly.
pub fn identity_coupling(image: &Array4<f32>, cost: &CostMatrix) -> Array4<f32> {
    let (b, c, _h, _w) = image.dim();
    let flat = flatten_image(image);
    let mut pi = Array4::zeros((b, c, cost.n_pixels(), cost.window()));
    let center = cost.center_slot();
    for bi in 0..b {
        for ci in 0..c {
            for p in 0..cost.n_pixels() {
                pi[[bi, ci, p, center]] = flat[[bi, ci, p]];
            }
        }
    }
    pi
}

/// Decodes a plan into flattened pixels: mass received per destination.
pub fn coupling_to_image_flat(pi: &Array4<f32>, cost: &CostMatrix) -> Array3<f32> {
    let (b, c, n, window) = pi.dim();
    let mut flat = Array3::zeros((b, c, n));
    for bi in 0..b {
        for ci in 0..c {
            for p in 0..n {
                for l in 0..window {
                    let t = cost.dest_pixel[[p, l]];
                    if t >= 0 {
                        flat[[bi, ci, t as usize]] += pi[[bi, ci, p, l]];
                    }
                }
            }
        }
    }
    flat
}

/// Decodes a plan into the adversarial image.
pub fn coupling_to_image(pi: &Array4<f32>, cost: &CostMatrix) -> Array4<f32> {
    unflatten_image(&coupling_to_image_flat(pi, cost), cost.height, cost.width)
}

/// Adjoint of [`coupling_to_image`]: pulls an image-space gradient back to
/// coupling space. Edges leaving the image receive zero gradient.
pub fn image_grad_to_coupling_grad(grad: &Array4<f32>, cost: &CostMatrix) -> Array4<f32> {
    let (b, c, _h, _w) = grad.dim();
    let flat = flatten_image(grad);
    let n = cost.n_pixels();
    let window = cost.window();
    let mut out = Array4::zeros((b, c, n, window));
    for bi in 0..b {
        for ci in 0..c {
            for p in 0..n {
                for l in 0..window {
                    let t = cost.dest_pixel[[p, l]];
                    if t >= 0 {
                        out[[bi, ci, p, l]] = flat[[bi, ci, t as usize]];
                    }
                }
            }
        }
    }
    out
}

/// Gather along the shared transpose map. The map is its own inverse (the
/// window offsets are centrally symmetric), so the same gather serves both
/// directions; slots whose partner lies outside the image come back as zero,
/// which is exact for any plan that keeps those slots empty.
fn reindex(pi: &Array4<f32>, map: &Array2<i64>) -> Array4<f32> {
    let (b, c, n, window) = pi.dim();
    let mut out = Array4::zeros((b, c, n, window));
    for bi in 0..b {
        for ci in 0..c {
            for p in 0..n {
                for l in 0..window {
                    let idx = map[[p, l]];
                    if idx >= 0 {
                        let (sp, sl) = (idx as usize / window, idx as usize % window);
                        out[[bi, ci, p, l]] = pi[[bi, ci, sp, sl]];
                    }
                }
            }
        }
    }
    out
}

/// Reindexes a source-major plan into destination-major orientation: entry
/// `(t, l)` of the result is the mass received by pixel `t` through the
/// mirrored slot `l`.
pub fn transpose_coupling(pi: &Array4<f32>, cost: &CostMatrix) -> Array4<f32> {
    reindex(pi, &cost.transpose_idx)
}

/// Reindexes a destination-major plan back to source-major orientation.
pub fn detranspose_coupling(pit: &Array4<f32>, cost: &CostMatrix) -> Array4<f32> {
    reindex(pit, &cost.transpose_idx)
}

/// Total mass of each batch element, summed over channels and pixels.
pub fn total_mass(image: &Array4<f32>) -> Array1<f32> {
    let b = image.dim().0;
    let mut mass = Array1::zeros(b);
    for bi in 0..b {
        mass[bi] = image.index_axis(Axis(0), bi).sum();
    }
    mass
}

/// Per-batch infinity norm of a coupling-shaped tensor.
pub fn coupling_inf_norm(t: &Array4<f32>) -> Array1<f32> {
    let b = t.dim().0;
    let mut norms = Array1::zeros(b);
    for bi in 0..b {
        norms[bi] = t
            .index_axis(Axis(0), bi)
            .iter()
            .fold(0.0f32, |m, &v| m.max(v.abs()));
    }
    norms
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn test_image(b: usize, c: usize, h: usize, w: usize, seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_fn((b, c, h, w), |_| rng.gen_range(0.0..1.0))
    }

    #[test]
    fn test_identity_decodes_to_source() {
        let image = test_image(2, 1, 4, 4, 7);
        let cost = CostMatrix::build(4, 4, 3).unwrap();
        let pi = identity_coupling(&image, &cost);
        let decoded = coupling_to_image(&pi, &cost);
        for (a, b) in image.iter().zip(decoded.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_decode_moves_mass_to_destination() {
        let cost = CostMatrix::build(3, 3, 3).unwrap();
        let mut pi = Array4::zeros((1, 1, 9, 9));
        // Pixel 4 (center) sends 0.25 one step right: offset (0, 1) = slot 5.
        pi[[0, 0, 4, 5]] = 0.25;
        let flat = coupling_to_image_flat(&pi, &cost);
        assert_eq!(flat[[0, 0, 5]], 0.25);
        assert_eq!(flat[[0, 0, 4]], 0.0);
    }

    #[test]
    fn test_transpose_roundtrip_on_interior_mass() {
        let cost = CostMatrix::build(4, 4, 3).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut pi = Array4::zeros((1, 1, 16, 9));
        for p in 0..16 {
            for l in 0..9 {
                if cost.dest_pixel[[p, l]] >= 0 {
                    pi[[0, 0, p, l]] = rng.gen_range(0.0..1.0);
                }
            }
        }
        let back = detranspose_coupling(&transpose_coupling(&pi, &cost), &cost);
        for (a, b) in pi.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-7);
        }
    }

    #[test]
    fn test_transpose_reorients_single_edge() {
        let cost = CostMatrix::build(3, 3, 3).unwrap();
        let mut pi = Array4::zeros((1, 1, 9, 9));
        // Edge 4 → 5 sits on slot 5 (offset (0, 1)); seen from pixel 5 the
        // same edge has offset (0, -1) = mirrored slot 3.
        pi[[0, 0, 4, 5]] = 0.5;
        let pit = transpose_coupling(&pi, &cost);
        assert_eq!(pit[[0, 0, 5, 3]], 0.5);
        assert_eq!(pit.sum(), 0.5);
    }

    #[test]
    fn test_column_sums_of_transpose_match_decode() {
        let cost = CostMatrix::build(4, 4, 3).unwrap();
        let image = test_image(1, 1, 4, 4, 11);
        let mut pi = identity_coupling(&image, &cost);
        pi[[0, 0, 5, 1]] = 0.1;
        pi[[0, 0, 10, 7]] = 0.2;
        let flat = coupling_to_image_flat(&pi, &cost);
        let pit = transpose_coupling(&pi, &cost);
        for t in 0..16 {
            let recv: f32 = (0..9).map(|l| pit[[0, 0, t, l]]).sum();
            assert!((recv - flat[[0, 0, t]]).abs() < 1e-6, "pixel {}", t);
        }
    }

    #[test]
    fn test_adjoint_consistency() {
        // ⟨decode(π), g⟩ must equal ⟨π, adjoint(g)⟩ for the gradient
        // pullback to be exact.
        let cost = CostMatrix::build(4, 4, 3).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let pi = Array4::from_shape_fn((2, 1, 16, 9), |_| rng.gen_range(-1.0..1.0f32));
        let g = test_image(2, 1, 4, 4, 13);
        let decoded = coupling_to_image(&pi, &cost);
        let pulled = image_grad_to_coupling_grad(&g, &cost);
        let lhs: f32 = decoded.iter().zip(g.iter()).map(|(a, b)| a * b).sum();
        let rhs: f32 = pi.iter().zip(pulled.iter()).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-4, "lhs = {}, rhs = {}", lhs, rhs);
    }

    #[test]
    fn test_total_mass_per_batch() {
        let mut image = Array4::zeros((2, 1, 2, 2));
        image[[0, 0, 0, 0]] = 1.0;
        image[[1, 0, 1, 1]] = 2.0;
        image[[1, 0, 0, 1]] = 0.5;
        let mass = total_mass(&image);
        assert_eq!(mass[0], 1.0);
        assert_eq!(mass[1], 2.5);
    }
}
