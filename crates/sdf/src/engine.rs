//! SDF construction for one chunk, run as an offloaded job.
//!
//! Pipeline per request, all on the device pool:
//! 1. evaluate density (base + edits) over the padded region `core + 2 * halo`
//! 2. binarize at the iso level into an occupancy mask
//! 3. exact EDT seeded on occupied voxels (distance to nearest solid)
//! 4. exact EDT seeded on empty voxels (distance to nearest empty)
//! 5. combine over the core only: `-sqrt(d_empty)` inside, `+sqrt(d_solid)` outside
//! 6. read the core buffer back to the host
//!
//! Scratch buffers are released before the completion callback runs; the SDF
//! buffer itself travels with the result and belongs to whoever receives it.

use glam::Vec3;
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use voxstream_common::{ChunkCoord, StreamSettings, TerraformEdit};

use crate::density::{DensitySource, EditGpu, EditedDensity};
use crate::device::{Device, DeviceBuffer, DeviceError, DeviceMemory, panic_message};
use crate::edt::{seed_into, squared_edt_3d};
use crate::grid::{Dims, SdfGrid};

/// Magnitude cap of stored distances. Regions with no surface in reach
/// (all solid or all empty padded volumes) read as +/- this value.
pub const MAX_DISTANCE: f32 = 1.0e9;

/// Fixed parameters shared by every build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdfParams {
    pub core: Dims,
    pub halo: usize,
    pub voxel_size: Vec3,
    pub iso_level: f32,
}

impl SdfParams {
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            core: Dims::from(settings.chunk_dims),
            halo: settings.halo as usize,
            voxel_size: settings.voxel_size,
            iso_level: settings.iso_level,
        }
    }

    pub fn padded(&self) -> Dims {
        self.core.padded(self.halo)
    }

    /// World position sampled by padded voxel `(x, y, z)` of a chunk whose core
    /// starts at `origin`.
    pub fn padded_voxel_position(&self, origin: Vec3, x: usize, y: usize, z: usize) -> Vec3 {
        let h = self.halo as f32;
        let local = Vec3::new(x as f32 - h, y as f32 - h, z as f32 - h) + Vec3::splat(0.5);
        origin + local * self.voxel_size
    }
}

/// One chunk's worth of work.
#[derive(Debug, Clone)]
pub struct SdfRequest {
    pub coord: ChunkCoord,
    /// Minimum corner of the chunk core in world space.
    pub origin: Vec3,
    pub edits: Arc<[TerraformEdit]>,
}

/// A finished build: host copy of the field plus the device buffer holding it.
#[derive(Debug)]
pub struct SdfOutput {
    pub field: SdfGrid,
    pub buffer: DeviceBuffer,
}

/// Stateless SDF service. Holds no per-chunk state; every call is independent.
#[derive(Clone)]
pub struct SdfEngine {
    device: Device,
    density: Arc<dyn DensitySource>,
    params: SdfParams,
}

impl SdfEngine {
    pub fn new(device: Device, density: Arc<dyn DensitySource>, params: SdfParams) -> Self {
        Self {
            device,
            density,
            params,
        }
    }

    pub fn params(&self) -> &SdfParams {
        &self.params
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Launch a build on the device pool. `on_complete` runs on a worker thread
    /// with the coordinate and either the output or the failure; it must only
    /// hand the result off, never touch control-thread state. A panic inside
    /// the pipeline (a faulty density source, say) arrives as
    /// [`DeviceError::JobPanicked`].
    pub fn build_async<F>(&self, request: SdfRequest, on_complete: F)
    where
        F: FnOnce(ChunkCoord, Result<SdfOutput, DeviceError>) + Send + 'static,
    {
        let memory = self.device.memory().clone();
        let density = Arc::clone(&self.density);
        let params = self.params;
        self.device.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                run_pipeline(&memory, density.as_ref(), &params, &request)
            }))
            .unwrap_or_else(|payload| Err(DeviceError::JobPanicked(panic_message(&*payload))));
            if let Err(e) = &result {
                tracing::warn!(coord = %request.coord, error = %e, "sdf build failed");
            }
            on_complete(request.coord, result);
        });
    }

    /// Run a build on the device pool and wait for it.
    pub fn build_blocking(&self, request: &SdfRequest) -> Result<SdfOutput, DeviceError> {
        let memory = self.device.memory();
        let density = self.density.as_ref();
        let params = &self.params;
        self.device
            .install(|| run_pipeline(memory, density, params, request))
    }
}

/// Device copy of a build's edits, held until the scratch buffers go.
enum EditBinding {
    Uploaded(DeviceBuffer),
    Placeholder(Arc<DeviceBuffer>),
}

impl EditBinding {
    fn bind(memory: &DeviceMemory, edits: &[TerraformEdit]) -> Result<Self, DeviceError> {
        if edits.is_empty() {
            return Ok(Self::Placeholder(memory.placeholder()));
        }
        let packed: Vec<EditGpu> = edits.iter().map(EditGpu::from).collect();
        Ok(Self::Uploaded(memory.upload("edits", &packed)?))
    }

    fn buffer(&self) -> &DeviceBuffer {
        match self {
            Self::Uploaded(buffer) => buffer,
            Self::Placeholder(buffer) => buffer.as_ref(),
        }
    }
}

fn run_pipeline(
    memory: &DeviceMemory,
    density: &dyn DensitySource,
    params: &SdfParams,
    request: &SdfRequest,
) -> Result<SdfOutput, DeviceError> {
    let _span = tracing::debug_span!("sdf_build", coord = %request.coord).entered();
    let padded = params.padded();
    let spacing = params.voxel_size.to_array();

    let binding = EditBinding::bind(memory, &request.edits)?;
    tracing::trace!(
        edits = request.edits.len(),
        buffer = binding.buffer().label(),
        bytes = binding.buffer().size_bytes(),
        "edits bound"
    );
    let mut density_buf = memory.create_buffer::<f32>("density", padded.len());
    density_kernel(
        density_buf.view_mut::<f32>()?,
        &EditedDensity::new(density, &request.edits),
        params,
        request.origin,
    );

    let iso = params.iso_level;
    let mask: Vec<bool> = density_buf
        .view::<f32>()?
        .par_iter()
        .map(|&d| d > iso)
        .collect();

    let mut to_solid = memory.create_buffer::<f32>("edt_out", padded.len());
    seed_into(to_solid.view_mut::<f32>()?, &mask, true);
    squared_edt_3d(to_solid.view_mut::<f32>()?, padded, spacing);

    let mut to_empty = memory.create_buffer::<f32>("edt_in", padded.len());
    seed_into(to_empty.view_mut::<f32>()?, &mask, false);
    squared_edt_3d(to_empty.view_mut::<f32>()?, padded, spacing);

    let mut sdf_buf = memory.create_buffer::<f32>("sdf", params.core.len());
    combine_kernel(
        sdf_buf.view_mut::<f32>()?,
        &mask,
        to_solid.view::<f32>()?,
        to_empty.view::<f32>()?,
        params,
    );

    density_buf.release();
    to_solid.release();
    to_empty.release();
    drop(binding);

    let values = memory.read_back::<f32>(&sdf_buf)?;
    let field = SdfGrid::from_vec(params.core, values).ok_or(DeviceError::Layout {
        label: "sdf",
        type_name: "SdfGrid",
    })?;
    Ok(SdfOutput {
        field,
        buffer: sdf_buf,
    })
}

fn density_kernel<D: DensitySource + ?Sized>(
    out: &mut [f32],
    density: &EditedDensity<'_, D>,
    params: &SdfParams,
    origin: Vec3,
) {
    let padded = params.padded();
    out.par_iter_mut().enumerate().for_each(|(i, slot)| {
        let (x, y, z) = padded.coords(i);
        *slot = density.density(params.padded_voxel_position(origin, x, y, z));
    });
}

fn combine_kernel(
    out: &mut [f32],
    mask: &[bool],
    to_solid: &[f32],
    to_empty: &[f32],
    params: &SdfParams,
) {
    let core = params.core;
    let padded = params.padded();
    let h = params.halo;
    out.par_iter_mut().enumerate().for_each(|(i, slot)| {
        let (x, y, z) = core.coords(i);
        let j = padded.index(x + h, y + h, z + h);
        let signed = if mask[j] {
            -to_empty[j].sqrt()
        } else {
            to_solid[j].sqrt()
        };
        *slot = signed.clamp(-MAX_DISTANCE, MAX_DISTANCE);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::{PlaneDensity, SphereDensity};
    use approx::assert_relative_eq;

    fn engine(density: impl DensitySource + 'static, core: usize, halo: usize) -> SdfEngine {
        let params = SdfParams {
            core: Dims::cube(core),
            halo,
            voxel_size: Vec3::ONE,
            iso_level: 0.0,
        };
        SdfEngine::new(Device::new(1).unwrap(), Arc::new(density), params)
    }

    fn request(origin: Vec3) -> SdfRequest {
        SdfRequest {
            coord: ChunkCoord::default(),
            origin,
            edits: Arc::from(Vec::new()),
        }
    }

    #[test]
    fn sign_convention_for_plane() {
        // Solid below y = 8 inside a 16^3 chunk at the origin.
        let engine = engine(PlaneDensity { height: 8.0 }, 16, 2);
        let out = engine.build_blocking(&request(Vec3::ZERO)).unwrap();
        let f = &out.field;
        // Voxel y=2 sits at 2.5, solid; nearest empty voxel is y=8 (8.5).
        assert_relative_eq!(f.get(5, 2, 5), -6.0);
        // Voxel y=12 sits at 12.5, empty; nearest solid voxel is y=7 (7.5).
        assert_relative_eq!(f.get(5, 12, 5), 5.0);
        assert_relative_eq!(f.get(0, 7, 15), -1.0);
        assert_relative_eq!(f.get(15, 8, 0), 1.0);
    }

    #[test]
    fn voxel_size_scales_distances() {
        let params = SdfParams {
            core: Dims::cube(8),
            halo: 2,
            voxel_size: Vec3::splat(0.5),
            iso_level: 0.0,
        };
        let engine = SdfEngine::new(
            Device::new(1).unwrap(),
            Arc::new(PlaneDensity { height: 2.0 }),
            params,
        );
        let out = engine.build_blocking(&request(Vec3::ZERO)).unwrap();
        // y index 0 sits at 0.25 (solid); first empty voxel is index 4 at 2.25.
        assert_relative_eq!(out.field.get(3, 0, 3), -2.0);
    }

    #[test]
    fn all_empty_region_is_clamped_positive() {
        let engine = engine(PlaneDensity { height: -100.0 }, 8, 2);
        let out = engine.build_blocking(&request(Vec3::ZERO)).unwrap();
        assert!(out.field.values().iter().all(|&v| v == MAX_DISTANCE));
    }

    #[test]
    fn halo_trimming_matches_a_wider_halo() {
        // Ball sits entirely in the -X halo: every core voxel depends on it.
        let ball = SphereDensity {
            center: Vec3::new(-3.0, 8.0, 8.0),
            radius: 2.0,
        };
        let narrow = engine(ball, 16, 6).build_blocking(&request(Vec3::ZERO)).unwrap();
        let wide = engine(ball, 16, 16).build_blocking(&request(Vec3::ZERO)).unwrap();
        assert_eq!(narrow.field.dims(), Dims::cube(16));
        for (a, b) in narrow.field.values().iter().zip(wide.field.values()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-4);
        }
        assert!(narrow.field.get(0, 8, 8) < 3.0);
    }

    #[test]
    fn edits_carve_material() {
        let engine = engine(PlaneDensity { height: 0.0 }, 8, 4);
        let origin = Vec3::new(0.0, -4.0, 0.0);
        let before = engine.build_blocking(&request(origin)).unwrap();
        let carved = SdfRequest {
            edits: Arc::from(vec![TerraformEdit::new(Vec3::new(4.0, 0.0, 4.0), -1.0, 2.0)]),
            ..request(origin)
        };
        let after = engine.build_blocking(&carved).unwrap();
        // Voxel (3, 3, 3) sits at (3.5, -0.5, 3.5): solid before, carved after.
        assert!(before.field.get(3, 3, 3) < 0.0);
        assert!(after.field.get(3, 3, 3) > 0.0);
    }

    #[test]
    fn scratch_buffers_are_released_and_output_owns_one() {
        let engine = engine(PlaneDensity { height: 4.0 }, 8, 2);
        let memory = engine.device().memory().clone();
        let out = engine.build_blocking(&request(Vec3::ZERO)).unwrap();
        // The SDF buffer plus the shared placeholder for the empty edit list.
        assert_eq!(memory.live_buffers(), 2);
        drop(out);
        memory.teardown();
        assert_eq!(memory.live_buffers(), 0);
    }

    #[test]
    fn failed_readback_releases_everything() {
        let engine = engine(PlaneDensity { height: 4.0 }, 8, 2);
        let memory = engine.device().memory().clone();
        memory.fail_next_readbacks(1);
        let err = engine.build_blocking(&request(Vec3::ZERO)).unwrap_err();
        assert_eq!(err, DeviceError::ReadbackFailed { label: "sdf" });
        memory.teardown();
        assert_eq!(memory.live_buffers(), 0);
    }

    struct FaultyDensity;

    impl DensitySource for FaultyDensity {
        fn density(&self, _p: Vec3) -> f32 {
            panic!("density backend unavailable")
        }
    }

    #[test]
    fn panicking_density_reports_an_error() {
        let engine = engine(FaultyDensity, 4, 1);
        let memory = engine.device().memory().clone();
        let (tx, rx) = std::sync::mpsc::channel();
        engine.build_async(request(Vec3::ZERO), move |_, result| {
            let _ = tx.send(result.map(|o| o.field));
        });
        let result = rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap();
        assert!(matches!(result, Err(DeviceError::JobPanicked(_))));
        memory.teardown();
        assert_eq!(memory.live_buffers(), 0);
    }

    #[test]
    fn async_build_delivers_through_callback() {
        let engine = engine(PlaneDensity { height: 4.0 }, 8, 2);
        let (tx, rx) = std::sync::mpsc::channel();
        let req = SdfRequest {
            coord: ChunkCoord::new(1, 2, 3),
            ..request(Vec3::ZERO)
        };
        engine.build_async(req, move |coord, result| {
            let _ = tx.send((coord, result.map(|o| o.field)));
        });
        let (coord, field) = rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap();
        assert_eq!(coord, ChunkCoord::new(1, 2, 3));
        assert_eq!(field.unwrap().dims(), Dims::cube(8));
    }
}
