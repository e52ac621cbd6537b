use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

/// Integer coordinate of a streamed chunk. Key into the chunk map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn as_ivec3(self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    /// Coordinate shifted by a chunk offset.
    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

impl From<IVec3> for ChunkCoord {
    fn from(v: IVec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A localized, persistent modification of the density function.
///
/// Edits are immutable values. They are appended to every chunk whose region
/// intersects the sphere of influence and replayed whenever that chunk rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerraformEdit {
    pub position: Vec3,
    /// Signed: negative carves material away, positive adds it.
    pub strength: f32,
    pub radius: f32,
}

impl TerraformEdit {
    pub fn new(position: Vec3, strength: f32, radius: f32) -> Self {
        Self {
            position,
            strength,
            radius,
        }
    }

    /// Density offset contributed at `p`: `strength * (1 - (d/r)^2)^2` inside
    /// the radius, zero outside.
    pub fn influence(&self, p: Vec3) -> f32 {
        if self.radius <= 0.0 {
            return 0.0;
        }
        let d2 = p.distance_squared(self.position);
        let r2 = self.radius * self.radius;
        if d2 >= r2 {
            return 0.0;
        }
        let t = 1.0 - d2 / r2;
        self.strength * t * t
    }

    /// Whether the sphere of influence touches the axis-aligned box `[min, max]`.
    pub fn intersects_box(&self, min: Vec3, max: Vec3) -> bool {
        let closest = self.position.clamp(min, max);
        closest.distance_squared(self.position) <= self.radius * self.radius
    }
}

/// Bitmask of biomes contributing to a chunk's surface. Bit `i` = biome `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BiomeMask(pub u32);

impl BiomeMask {
    pub const EMPTY: Self = Self(0);

    pub fn insert(&mut self, biome: u32) {
        if biome < 32 {
            self.0 |= 1 << biome;
        }
    }

    pub fn contains(self, biome: u32) -> bool {
        biome < 32 && self.0 & (1 << biome) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}
