//! The density seam. Procedural terrain lives outside the core; the core only
//! evaluates `density(p)` and `color(p)` over padded regions.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use voxstream_common::TerraformEdit;

/// A pure scalar field over world space. Must be safe to evaluate anywhere,
/// including the halo margin around a requested region.
pub trait DensitySource: Send + Sync {
    fn density(&self, p: Vec3) -> f32;

    /// Surface colour at `p`. Channel 0 carries the biome index by convention.
    fn color(&self, _p: Vec3) -> [f32; 4] {
        [0.0, 0.5, 0.5, 1.0]
    }
}

impl<D: DensitySource + ?Sized> DensitySource for std::sync::Arc<D> {
    fn density(&self, p: Vec3) -> f32 {
        (**self).density(p)
    }

    fn color(&self, p: Vec3) -> [f32; 4] {
        (**self).color(p)
    }
}

/// Base density with a list of terraform edits replayed on top.
pub struct EditedDensity<'a, D: ?Sized> {
    pub base: &'a D,
    pub edits: &'a [TerraformEdit],
}

impl<'a, D: DensitySource + ?Sized> EditedDensity<'a, D> {
    pub fn new(base: &'a D, edits: &'a [TerraformEdit]) -> Self {
        Self { base, edits }
    }

    pub fn density(&self, p: Vec3) -> f32 {
        self.base.density(p) + self.edits.iter().map(|e| e.influence(p)).sum::<f32>()
    }
}

/// Device layout of a [`TerraformEdit`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct EditGpu {
    pub position: [f32; 3],
    pub strength: f32,
    pub radius: f32,
}

impl From<&TerraformEdit> for EditGpu {
    fn from(e: &TerraformEdit) -> Self {
        Self {
            position: e.position.to_array(),
            strength: e.strength,
            radius: e.radius,
        }
    }
}

impl From<&EditGpu> for TerraformEdit {
    fn from(e: &EditGpu) -> Self {
        TerraformEdit::new(Vec3::from_array(e.position), e.strength, e.radius)
    }
}

/// Solid below a horizontal plane: `density = height - y`.
#[derive(Debug, Clone, Copy)]
pub struct PlaneDensity {
    pub height: f32,
}

impl DensitySource for PlaneDensity {
    fn density(&self, p: Vec3) -> f32 {
        self.height - p.y
    }
}

/// Solid ball: `density = radius - |p - center|`.
#[derive(Debug, Clone, Copy)]
pub struct SphereDensity {
    pub center: Vec3,
    pub radius: f32,
}

impl DensitySource for SphereDensity {
    fn density(&self, p: Vec3) -> f32 {
        self.radius - p.distance(self.center)
    }
}
