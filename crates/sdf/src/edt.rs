//! Exact Euclidean distance transform (lower envelope of parabolas).
//!
//! The 1D pass computes, for every index `q`, `min_p f[p] + (w * (q - p))^2`
//! in linear time. Running it along X, then Y, then Z over the same buffer
//! yields the exact squared Euclidean distance to the nearest seed in 3D.
//! `w` is the voxel spacing on the pass axis, so anisotropic voxels come out
//! in world units.

use rayon::prelude::*;

use crate::grid::Dims;

/// Reusable buffers for the 1D pass: parabola vertices and boundaries.
#[derive(Debug, Default, Clone)]
pub struct EnvelopeScratch {
    vertices: Vec<usize>,
    bounds: Vec<f32>,
}

impl EnvelopeScratch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            vertices: vec![0; n],
            bounds: vec![0.0; n + 1],
        }
    }

    fn ensure(&mut self, n: usize) {
        if self.vertices.len() < n {
            self.vertices.resize(n, 0);
            self.bounds.resize(n + 1, 0.0);
        }
    }
}

/// 1D squared distance transform of `f` into `out`.
///
/// Seeds are the finite entries of `f` (0 for a seed voxel, or the squared
/// distance carried over from a previous axis). Non-finite entries never
/// contribute; a line without any finite entry produces `f32::INFINITY`.
pub fn squared_edt_1d(f: &[f32], out: &mut [f32], spacing: f32, scratch: &mut EnvelopeScratch) {
    let n = f.len();
    debug_assert_eq!(out.len(), n);
    scratch.ensure(n);
    let w2 = spacing * spacing;
    let v = &mut scratch.vertices;
    let z = &mut scratch.bounds;

    let mut len = 0usize;
    for q in 0..n {
        if !f[q].is_finite() {
            continue;
        }
        let qf = q as f32;
        let mut s = f32::NEG_INFINITY;
        while len > 0 {
            let p = v[len - 1];
            let pf = p as f32;
            s = ((f[q] + w2 * qf * qf) - (f[p] + w2 * pf * pf)) / (2.0 * w2 * (qf - pf));
            if s > z[len - 1] {
                break;
            }
            len -= 1;
            s = f32::NEG_INFINITY;
        }
        v[len] = q;
        z[len] = s;
        z[len + 1] = f32::INFINITY;
        len += 1;
    }

    if len == 0 {
        out.fill(f32::INFINITY);
        return;
    }

    let mut k = 0usize;
    for (q, slot) in out.iter_mut().enumerate() {
        let qf = q as f32;
        while z[k + 1] < qf {
            k += 1;
        }
        let p = v[k];
        let d = qf - p as f32;
        *slot = w2 * d * d + f[p];
    }
}

/// Seed a field from an occupancy mask: voxels whose occupancy equals
/// `seed_value` start at 0, all others at infinity.
pub fn seed_from_mask(mask: &[bool], seed_value: bool) -> Vec<f32> {
    let mut field = vec![0.0; mask.len()];
    seed_into(&mut field, mask, seed_value);
    field
}

/// [`seed_from_mask`] writing into an existing buffer of the same length.
pub fn seed_into(field: &mut [f32], mask: &[bool], seed_value: bool) {
    debug_assert_eq!(field.len(), mask.len());
    field
        .par_iter_mut()
        .zip(mask.par_iter())
        .for_each(|(slot, &occupied)| {
            *slot = if occupied == seed_value {
                0.0
            } else {
                f32::INFINITY
            };
        });
}

/// In-place 3D squared EDT over `field` laid out per [`Dims::index`].
/// `spacing` is the voxel size along X, Y and Z.
pub fn squared_edt_3d(field: &mut [f32], dims: Dims, spacing: [f32; 3]) {
    debug_assert_eq!(field.len(), dims.len());
    if dims.is_empty() {
        return;
    }
    pass_x(field, dims, spacing[0]);
    pass_y(field, dims, spacing[1]);
    pass_z(field, dims, spacing[2]);
}

/// X lines are strided across the whole buffer, so they are transformed from a
/// read-only view and scattered back afterwards.
fn pass_x(field: &mut [f32], dims: Dims, spacing: f32) {
    let stride = dims.stride(0);
    let lines: Vec<Vec<f32>> = {
        let src: &[f32] = field;
        (0..stride)
            .into_par_iter()
            .map_init(
                || (vec![0.0; dims.x], EnvelopeScratch::with_capacity(dims.x)),
                |(line, scratch), yz| {
                    for (x, slot) in line.iter_mut().enumerate() {
                        *slot = src[yz + x * stride];
                    }
                    let mut out = vec![0.0; dims.x];
                    squared_edt_1d(line, &mut out, spacing, scratch);
                    out
                },
            )
            .collect()
    };
    for (yz, line) in lines.into_iter().enumerate() {
        for (x, value) in line.into_iter().enumerate() {
            field[yz + x * stride] = value;
        }
    }
}

/// Y lines stay inside one X slab, so slabs are processed in parallel.
fn pass_y(field: &mut [f32], dims: Dims, spacing: f32) {
    let slab = dims.stride(0);
    field.par_chunks_mut(slab).for_each_init(
        || {
            (
                vec![0.0; dims.y],
                vec![0.0; dims.y],
                EnvelopeScratch::with_capacity(dims.y),
            )
        },
        |(line, out, scratch), slab| {
            for z in 0..dims.z {
                for (y, slot) in line.iter_mut().enumerate() {
                    *slot = slab[z + y * dims.z];
                }
                squared_edt_1d(line, out, spacing, scratch);
                for (y, value) in out.iter().enumerate() {
                    slab[z + y * dims.z] = *value;
                }
            }
        },
    );
}

/// Z lines are contiguous.
fn pass_z(field: &mut [f32], dims: Dims, spacing: f32) {
    field.par_chunks_mut(dims.z).for_each_init(
        || (vec![0.0; dims.z], EnvelopeScratch::with_capacity(dims.z)),
        |(out, scratch), line| {
            squared_edt_1d(line, out, spacing, scratch);
            line.copy_from_slice(out);
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn edt_line(mask: &[bool]) -> Vec<f32> {
        let seeds = seed_from_mask(mask, true);
        let mut out = vec![0.0; mask.len()];
        squared_edt_1d(&seeds, &mut out, 1.0, &mut EnvelopeScratch::default());
        out.into_iter().map(f32::sqrt).collect()
    }

    fn brute_force(mask: &[bool], dims: Dims, spacing: [f32; 3]) -> Vec<f32> {
        (0..dims.len())
            .map(|i| {
                let (x, y, z) = dims.coords(i);
                let mut best = f32::INFINITY;
                for j in 0..dims.len() {
                    if !mask[j] {
                        continue;
                    }
                    let (px, py, pz) = dims.coords(j);
                    let dx = (x as f32 - px as f32) * spacing[0];
                    let dy = (y as f32 - py as f32) * spacing[1];
                    let dz = (z as f32 - pz as f32) * spacing[2];
                    best = best.min(dx * dx + dy * dy + dz * dz);
                }
                best
            })
            .collect()
    }

    #[test]
    fn line_between_two_solids() {
        let d = edt_line(&[true, false, false, false, true]);
        assert_eq!(d, vec![0.0, 1.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn line_without_seeds_is_infinite() {
        let d = edt_line(&[false; 6]);
        assert!(d.iter().all(|v| v.is_infinite()));
    }

    #[test]
    fn single_seed_line() {
        let d = edt_line(&[false, false, true, false, false, false]);
        assert_eq!(d, vec![2.0, 1.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn spacing_scales_distances() {
        let seeds = seed_from_mask(&[true, false, false], true);
        let mut out = vec![0.0; 3];
        squared_edt_1d(&seeds, &mut out, 0.5, &mut EnvelopeScratch::default());
        assert_eq!(out, vec![0.0, 0.25, 1.0]);
    }

    #[test]
    fn carried_over_values_act_as_offsets() {
        // f holds squared distances from a previous pass.
        let f = [4.0, f32::INFINITY, 0.0, f32::INFINITY, 9.0];
        let mut out = vec![0.0; 5];
        squared_edt_1d(&f, &mut out, 1.0, &mut EnvelopeScratch::default());
        assert_eq!(out, vec![4.0, 1.0, 0.0, 1.0, 4.0]);
    }

    #[test]
    fn matches_brute_force_on_random_volumes() {
        let mut rng = StdRng::seed_from_u64(7);
        for (dims, spacing, density) in [
            (Dims::new(7, 5, 6), [1.0, 1.0, 1.0], 0.1),
            (Dims::new(4, 9, 3), [1.0, 2.0, 0.5], 0.2),
            (Dims::new(10, 10, 10), [1.0, 1.0, 1.0], 0.02),
        ] {
            let mask: Vec<bool> = (0..dims.len()).map(|_| rng.gen_bool(density)).collect();
            let mut field = seed_from_mask(&mask, true);
            squared_edt_3d(&mut field, dims, spacing);
            let expected = brute_force(&mask, dims, spacing);
            for (got, want) in field.iter().zip(&expected) {
                if want.is_infinite() {
                    assert!(got.is_infinite());
                } else {
                    assert!((got - want).abs() < 1e-3, "got {got}, want {want}");
                }
            }
        }
    }

    #[test]
    fn empty_volume_stays_infinite() {
        let dims = Dims::cube(4);
        let mut field = seed_from_mask(&vec![false; dims.len()], true);
        squared_edt_3d(&mut field, dims, [1.0; 3]);
        assert!(field.iter().all(|v| v.is_infinite()));
    }
}
