//! Dense 3D arrays shared between the distance transform and its consumers.
//!
//! # Layout
//! Every dense field in this crate is stored flat with **Z fastest, then Y,
//! then X**:
//!
//! ```text
//! i = z + y * sz + x * sz * sy
//! ```
//!
//! Readers and writers must agree on this formula; a swapped axis order
//! silently corrupts sampling, so it lives in exactly one place (`Dims::index`).

use glam::UVec3;

/// Extent of a dense field along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dims {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Dims {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    pub fn cube(n: usize) -> Self {
        Self::new(n, n, n)
    }

    pub fn len(&self) -> usize {
        self.x * self.y * self.z
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of `(x, y, z)`. See the module docs for the layout contract.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        z + y * self.z + x * self.z * self.y
    }

    /// Inverse of [`Dims::index`].
    #[inline]
    pub fn coords(&self, i: usize) -> (usize, usize, usize) {
        let z = i % self.z;
        let y = (i / self.z) % self.y;
        let x = i / (self.z * self.y);
        (x, y, z)
    }

    /// Dimensions grown by `halo` voxels on both sides of every axis.
    pub fn padded(&self, halo: usize) -> Self {
        Self::new(self.x + 2 * halo, self.y + 2 * halo, self.z + 2 * halo)
    }

    /// Stride between consecutive elements along `axis` (0 = X, 1 = Y, 2 = Z).
    pub fn stride(&self, axis: usize) -> usize {
        match axis {
            0 => self.z * self.y,
            1 => self.z,
            _ => 1,
        }
    }

    pub fn extent(&self, axis: usize) -> usize {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }
}

impl From<UVec3> for Dims {
    fn from(v: UVec3) -> Self {
        Self::new(v.x as usize, v.y as usize, v.z as usize)
    }
}

/// A dense signed distance field for one chunk core (halo already trimmed).
/// Values are in world units; negative inside solid.
#[derive(Debug, Clone, PartialEq)]
pub struct SdfGrid {
    dims: Dims,
    values: Vec<f32>,
}

impl SdfGrid {
    /// Wrap a flat array laid out per [`Dims::index`]. Returns `None` if the
    /// length does not match.
    pub fn from_vec(dims: Dims, values: Vec<f32>) -> Option<Self> {
        (values.len() == dims.len()).then_some(Self { dims, values })
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.values[self.dims.index(x, y, z)]
    }

    /// Value at signed integer coordinates clamped into this grid's extent.
    pub fn get_clamped(&self, x: i32, y: i32, z: i32) -> f32 {
        let cx = x.clamp(0, self.dims.x as i32 - 1) as usize;
        let cy = y.clamp(0, self.dims.y as i32 - 1) as usize;
        let cz = z.clamp(0, self.dims.z as i32 - 1) as usize;
        self.get(cx, cy, cz)
    }
}
