use glam::Vec3;
use std::collections::{HashMap, HashSet};
use voxstream_common::{BiomeMask, ChunkCoord, TerraformEdit};
use voxstream_sdf::{DeviceBuffer, SdfGrid, SdfOutput};

use crate::grid::ChunkGrid;
use crate::mesh::{ChunkMesh, MeshOutput};

/// Offset used by [`ChunkStore::sample_gradient`] along each axis.
pub const GRADIENT_DELTA: f32 = 0.05;

/// One streamed region.
///
/// Created as an empty placeholder when first built, filled in as each build
/// half lands, and dropped (releasing its device buffer) on eviction.
#[derive(Debug, Default)]
pub struct Chunk {
    pub mesh: Option<ChunkMesh>,
    pub sdf: Option<SdfGrid>,
    /// Device memory backing `sdf`.
    pub sdf_buffer: Option<DeviceBuffer>,
    /// Edits applied to this region, in application order.
    pub edits: Vec<TerraformEdit>,
    pub biome_mask: BiomeMask,
    pub spawn_candidates: Vec<Vec3>,
}

impl Chunk {
    pub fn has_sdf(&self) -> bool {
        self.sdf.is_some()
    }
}

/// Owns every chunk, keyed by coordinate, plus the journal of all edits ever
/// applied so a region that is evicted and streamed back keeps its edits.
///
/// Single-threaded: only the control thread touches it.
#[derive(Debug)]
pub struct ChunkStore {
    grid: ChunkGrid,
    chunks: HashMap<ChunkCoord, Chunk>,
    journal: Vec<TerraformEdit>,
    /// The journal indexed by every chunk each edit touches.
    edits_by_chunk: HashMap<ChunkCoord, Vec<TerraformEdit>>,
}

impl ChunkStore {
    pub fn new(grid: ChunkGrid) -> Self {
        Self {
            grid,
            chunks: HashMap::new(),
            journal: Vec::new(),
            edits_by_chunk: HashMap::new(),
        }
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    pub fn get(&self, coord: ChunkCoord) -> Option<&Chunk> {
        self.chunks.get(&coord)
    }

    pub fn get_mut(&mut self, coord: ChunkCoord) -> Option<&mut Chunk> {
        self.chunks.get_mut(&coord)
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.chunks.contains_key(&coord)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn coords(&self) -> impl Iterator<Item = ChunkCoord> + '_ {
        self.chunks.keys().copied()
    }

    /// Upsert. A replaced chunk is dropped, releasing its buffer.
    pub fn set(&mut self, coord: ChunkCoord, chunk: Chunk) {
        if self.chunks.insert(coord, chunk).is_some() {
            tracing::trace!(%coord, "chunk replaced");
        }
    }

    /// The chunk at `coord`, creating an empty placeholder seeded with every
    /// journaled edit that touches the region if none exists.
    pub fn ensure_placeholder(&mut self, coord: ChunkCoord) -> &mut Chunk {
        let journaled = &self.edits_by_chunk;
        self.chunks.entry(coord).or_insert_with(|| Chunk {
            edits: journaled.get(&coord).cloned().unwrap_or_default(),
            ..Chunk::default()
        })
    }

    /// Journaled edits touching `coord`, in application order.
    pub fn journaled_edits(&self, coord: ChunkCoord) -> &[TerraformEdit] {
        self.edits_by_chunk.get(&coord).map_or(&[], Vec::as_slice)
    }

    /// Write the mesh half of a build. Returns `false` if the chunk is gone.
    pub fn commit_mesh(&mut self, coord: ChunkCoord, output: MeshOutput) -> bool {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return false;
        };
        chunk.mesh = Some(output.mesh);
        chunk.biome_mask = output.biome_mask;
        chunk.spawn_candidates = output.spawn_candidates;
        true
    }

    /// Write the SDF half of a build, taking ownership of its device buffer.
    /// The previous buffer, if any, is released. Returns `false` (and releases
    /// the output) if the chunk is gone.
    pub fn commit_sdf(&mut self, coord: ChunkCoord, output: SdfOutput) -> bool {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return false;
        };
        chunk.sdf = Some(output.field);
        chunk.sdf_buffer = Some(output.buffer);
        true
    }

    /// Release the chunk's mesh and device buffer and forget it. No-op if absent.
    pub fn destroy(&mut self, coord: ChunkCoord) -> bool {
        match self.chunks.remove(&coord) {
            Some(chunk) => {
                if let Some(buffer) = chunk.sdf_buffer {
                    buffer.release();
                }
                true
            }
            None => false,
        }
    }

    /// Destroy every chunk. The edit journal survives.
    pub fn clear(&mut self) {
        let count = self.chunks.len();
        self.chunks.clear();
        tracing::debug!(count, "chunk store cleared");
    }

    /// Every edit ever applied, in order.
    pub fn journal(&self) -> &[TerraformEdit] {
        &self.journal
    }

    /// Trilinear signed distance at `pos`.
    ///
    /// Corners that fall across a chunk seam are read from the neighbour,
    /// clamped into its extent; a neighbour without SDF data contributes 0.
    /// Returns `None` only when the chunk owning `pos` has no SDF yet.
    pub fn sample_sdf(&self, pos: Vec3) -> Option<f32> {
        let owner = self.grid.world_to_chunk(pos);
        let field = self.chunks.get(&owner)?.sdf.as_ref()?;
        let dims = field.dims();
        let (sx, sy, sz) = (dims.x as i32, dims.y as i32, dims.z as i32);

        let local = self.grid.local_voxel(owner, pos);
        let base = local.floor();
        let t = local - base;
        let (bx, by, bz) = (base.x as i32, base.y as i32, base.z as i32);

        let corner = |dx: i32, dy: i32, dz: i32| -> f32 {
            let (x, ox) = wrap(bx + dx, sx);
            let (y, oy) = wrap(by + dy, sy);
            let (z, oz) = wrap(bz + dz, sz);
            if (ox, oy, oz) == (0, 0, 0) {
                return field.get_clamped(x, y, z);
            }
            self.chunks
                .get(&owner.offset(ox, oy, oz))
                .and_then(|c| c.sdf.as_ref())
                .map_or(0.0, |n| n.get_clamped(x, y, z))
        };

        let c00 = lerp(corner(0, 0, 0), corner(1, 0, 0), t.x);
        let c10 = lerp(corner(0, 1, 0), corner(1, 1, 0), t.x);
        let c01 = lerp(corner(0, 0, 1), corner(1, 0, 1), t.x);
        let c11 = lerp(corner(0, 1, 1), corner(1, 1, 1), t.x);
        let c0 = lerp(c00, c10, t.y);
        let c1 = lerp(c01, c11, t.y);
        Some(lerp(c0, c1, t.z))
    }

    /// Central-difference gradient of the signed distance at `pos`.
    pub fn sample_gradient(&self, pos: Vec3) -> Option<Vec3> {
        let d = GRADIENT_DELTA;
        let axis = |offset: Vec3| -> Option<f32> {
            Some((self.sample_sdf(pos + offset)? - self.sample_sdf(pos - offset)?) / (2.0 * d))
        };
        Some(Vec3::new(
            axis(Vec3::X * d)?,
            axis(Vec3::Y * d)?,
            axis(Vec3::Z * d)?,
        ))
    }

    /// Record `edit` and append it to every resident chunk whose bounds the
    /// sphere of influence touches. Returns all touched coordinates, resident
    /// or not.
    pub fn apply_terraform_edit(&mut self, edit: TerraformEdit) -> HashSet<ChunkCoord> {
        let reach = Vec3::splat(edit.radius);
        let affected: HashSet<ChunkCoord> = self
            .grid
            .chunks_overlapping(edit.position - reach, edit.position + reach)
            .into_iter()
            .filter(|&c| {
                let (min, max) = self.grid.chunk_bounds(c);
                edit.intersects_box(min, max)
            })
            .collect();

        for coord in &affected {
            if let Some(chunk) = self.chunks.get_mut(coord) {
                chunk.edits.push(edit);
            }
            self.edits_by_chunk.entry(*coord).or_default().push(edit);
        }
        self.journal.push(edit);
        tracing::debug!(
            position = ?edit.position,
            radius = edit.radius,
            affected = affected.len(),
            "terraform edit recorded"
        );
        affected
    }
}

/// Index `i` folded into `[0, size)` with the chunk step it took: -1, 0 or +1.
fn wrap(i: i32, size: i32) -> (i32, i32) {
    if i < 0 {
        (i + size, -1)
    } else if i >= size {
        (i - size, 1)
    } else {
        (i, 0)
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}
