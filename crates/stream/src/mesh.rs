//! Surface extraction seam.
//!
//! The coordinator only needs "give me a mesh, a biome mask and spawn
//! candidates for this region"; how the surface is polygonised is up to the
//! [`MeshExtractor`] it was built with.

use glam::Vec3;
use std::sync::Arc;
use voxstream_common::{BiomeMask, ChunkCoord, TerraformEdit};
use voxstream_sdf::{Dims, DensitySource, EditedDensity};

/// Triangle mesh of one chunk, world-space positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMesh {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl ChunkMesh {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Region handed to an extractor.
#[derive(Debug, Clone)]
pub struct MeshRequest {
    pub coord: ChunkCoord,
    /// Minimum corner of the chunk.
    pub origin: Vec3,
    pub dims: Dims,
    pub voxel_size: Vec3,
    pub iso_level: f32,
    pub edits: Arc<[TerraformEdit]>,
}

#[derive(Debug, Clone, Default)]
pub struct MeshOutput {
    /// May be empty when no surface crosses the region; that is not a failure.
    pub mesh: ChunkMesh,
    pub biome_mask: BiomeMask,
    pub spawn_candidates: Vec<Vec3>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractError {
    #[error("mesh extraction for chunk {coord} failed: {reason}")]
    Failed { coord: ChunkCoord, reason: String },
}

/// Turns a density region into a surface. Runs on a worker thread.
pub trait MeshExtractor: Send + Sync {
    fn extract(&self, request: &MeshRequest) -> Result<MeshOutput, ExtractError>;
}

/// Column-crossing extractor.
///
/// Walks every vertical column of voxel centres and emits one horizontal quad
/// wherever occupancy flips between two neighbours, placed at the linearly
/// interpolated iso height. Crossings with solid below face up and become
/// spawn candidates. The sample above the top voxel belongs to the next chunk
/// up, so a surface exactly on a chunk seam is emitted once, by the lower chunk.
pub struct CrossingExtractor {
    density: Arc<dyn DensitySource>,
}

impl CrossingExtractor {
    pub fn new(density: Arc<dyn DensitySource>) -> Self {
        Self { density }
    }
}

impl MeshExtractor for CrossingExtractor {
    fn extract(&self, request: &MeshRequest) -> Result<MeshOutput, ExtractError> {
        let _span = tracing::debug_span!("mesh_extract", coord = %request.coord).entered();
        let field = EditedDensity::new(self.density.as_ref(), &request.edits);
        let v = request.voxel_size;
        let iso = request.iso_level;
        let mut out = MeshOutput::default();
        let mut column = Vec::with_capacity(request.dims.y + 1);

        for x in 0..request.dims.x {
            for z in 0..request.dims.z {
                let x0 = request.origin.x + x as f32 * v.x;
                let z0 = request.origin.z + z as f32 * v.z;
                let cx = x0 + 0.5 * v.x;
                let cz = z0 + 0.5 * v.z;

                column.clear();
                column.extend((0..=request.dims.y).map(|y| {
                    let cy = request.origin.y + (y as f32 + 0.5) * v.y;
                    field.density(Vec3::new(cx, cy, cz)) - iso
                }));

                for (y, pair) in column.windows(2).enumerate() {
                    let (below, above) = (pair[0], pair[1]);
                    let solid_below = below > 0.0;
                    if solid_below == (above > 0.0) {
                        continue;
                    }
                    let t = below / (below - above);
                    let height = request.origin.y + (y as f32 + 0.5 + t) * v.y;
                    let surface = Vec3::new(cx, height, cz);

                    push_quad(&mut out.mesh, x0, z0, v, height, solid_below);
                    out.biome_mask
                        .insert(self.density.color(surface)[0].max(0.0) as u32);
                    if solid_below {
                        out.spawn_candidates.push(surface);
                    }
                }
            }
        }

        tracing::trace!(
            coord = %request.coord,
            triangles = out.mesh.triangle_count(),
            "mesh extracted"
        );
        Ok(out)
    }
}

fn push_quad(mesh: &mut ChunkMesh, x0: f32, z0: f32, v: Vec3, height: f32, facing_up: bool) {
    let base = mesh.vertices.len() as u32;
    let (x1, z1) = (x0 + v.x, z0 + v.z);
    mesh.vertices.extend([
        Vec3::new(x0, height, z0),
        Vec3::new(x0, height, z1),
        Vec3::new(x1, height, z1),
        Vec3::new(x1, height, z0),
    ]);
    if facing_up {
        mesh.indices
            .extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    } else {
        mesh.indices
            .extend([base, base + 2, base + 1, base, base + 3, base + 2]);
    }
}
