use glam::Vec3;
use noise::{NoiseFn, Perlin};
use voxstream_sdf::DensitySource;

/// Rolling fractal terrain: solid below a Perlin heightfield.
pub struct NoiseTerrain {
    noise: Perlin,
    base_frequency: f64,
    octaves: usize,
    persistence: f64,
    lacunarity: f64,
    height_range: f32,
    /// Heights separating biome 0 (seabed), 1 (lowland) and 2 (highland).
    biome_bands: [f32; 2],
}

impl NoiseTerrain {
    pub fn new(seed: u32) -> Self {
        Self {
            noise: Perlin::new(seed),
            base_frequency: 0.01,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            height_range: 24.0,
            biome_bands: [-4.0, 10.0],
        }
    }

    pub fn height(&self, x: f32, z: f32) -> f32 {
        let mut amplitude = 1.0;
        let mut frequency = self.base_frequency;
        let mut total = 0.0;
        let mut norm = 0.0;
        for _ in 0..self.octaves {
            total += self.noise.get([x as f64 * frequency, z as f64 * frequency]) * amplitude;
            norm += amplitude;
            amplitude *= self.persistence;
            frequency *= self.lacunarity;
        }
        ((total / norm) as f32).clamp(-1.0, 1.0) * self.height_range
    }
}

impl DensitySource for NoiseTerrain {
    fn density(&self, p: Vec3) -> f32 {
        self.height(p.x, p.z) - p.y
    }

    fn color(&self, p: Vec3) -> [f32; 4] {
        let biome = if p.y < self.biome_bands[0] {
            0.0
        } else if p.y < self.biome_bands[1] {
            1.0
        } else {
            2.0
        };
        [biome, 0.5, 0.5, 1.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_terrain() {
        let a = NoiseTerrain::new(3);
        let b = NoiseTerrain::new(3);
        for x in [0.0, 13.7, -40.2] {
            assert_eq!(a.height(x, x * 0.5), b.height(x, x * 0.5));
        }
    }

    #[test]
    fn height_stays_in_range() {
        let t = NoiseTerrain::new(11);
        for i in 0..200 {
            let h = t.height(i as f32 * 3.1, i as f32 * -1.7);
            assert!(h.abs() <= 24.0);
        }
    }

    #[test]
    fn solid_below_surface() {
        let t = NoiseTerrain::new(5);
        let h = t.height(8.0, 8.0);
        assert!(t.density(Vec3::new(8.0, h - 1.0, 8.0)) > 0.0);
        assert!(t.density(Vec3::new(8.0, h + 1.0, 8.0)) < 0.0);
    }

    #[test]
    fn biome_channel_follows_altitude() {
        let t = NoiseTerrain::new(0);
        assert_eq!(t.color(Vec3::new(0.0, -20.0, 0.0))[0], 0.0);
        assert_eq!(t.color(Vec3::new(0.0, 0.0, 0.0))[0], 1.0);
        assert_eq!(t.color(Vec3::new(0.0, 30.0, 0.0))[0], 2.0);
    }
}
