use glam::{UVec3, Vec3};
use voxstream_common::{ChunkCoord, StreamSettings};

/// Fixed-size 3D chunk grid.
///
/// Converts world positions to chunk coordinates and back. Chunk `c` covers
/// `[c * chunk_size, (c + 1) * chunk_size)` on every axis. Pure math, no state
/// beyond the two sizes it was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkGrid {
    voxel_size: Vec3,
    chunk_dims: UVec3,
}

impl ChunkGrid {
    pub fn new(voxel_size: Vec3, chunk_dims: UVec3) -> Self {
        assert!(
            voxel_size.cmpgt(Vec3::ZERO).all(),
            "voxel_size must be positive"
        );
        assert!(chunk_dims.min_element() > 0, "chunk_dims must be non-zero");
        Self {
            voxel_size,
            chunk_dims,
        }
    }

    /// Grid of already-validated settings.
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self::new(settings.voxel_size, settings.chunk_dims)
    }

    pub fn voxel_size(&self) -> Vec3 {
        self.voxel_size
    }

    pub fn chunk_dims(&self) -> UVec3 {
        self.chunk_dims
    }

    /// World-space extent of one chunk.
    pub fn chunk_size(&self) -> Vec3 {
        self.voxel_size * self.chunk_dims.as_vec3()
    }

    /// Chunk containing `pos` (floor division per axis).
    pub fn world_to_chunk(&self, pos: Vec3) -> ChunkCoord {
        ChunkCoord::from((pos / self.chunk_size()).floor().as_ivec3())
    }

    pub fn chunk_center_world(&self, coord: ChunkCoord) -> Vec3 {
        (coord.as_ivec3().as_vec3() + Vec3::splat(0.5)) * self.chunk_size()
    }

    /// Minimum corner of the chunk.
    pub fn chunk_min(&self, coord: ChunkCoord) -> Vec3 {
        coord.as_ivec3().as_vec3() * self.chunk_size()
    }

    /// Axis-aligned bounds `(min, max)` of the chunk.
    pub fn chunk_bounds(&self, coord: ChunkCoord) -> (Vec3, Vec3) {
        let min = self.chunk_min(coord);
        (min, min + self.chunk_size())
    }

    /// Continuous voxel coordinate of `pos` inside `coord`, such that voxel
    /// centres land on integers (voxel `i` samples `chunk_min + (i + 0.5) * voxel`).
    pub fn local_voxel(&self, coord: ChunkCoord, pos: Vec3) -> Vec3 {
        (pos - self.chunk_min(coord)) / self.voxel_size - Vec3::splat(0.5)
    }

    /// Every chunk coordinate whose bounds overlap the box `[min, max]`.
    pub fn chunks_overlapping(&self, min: Vec3, max: Vec3) -> Vec<ChunkCoord> {
        let lo = self.world_to_chunk(min);
        let hi = self.world_to_chunk(max);
        let mut out = Vec::new();
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    out.push(ChunkCoord::new(x, y, z));
                }
            }
        }
        out
    }
}
