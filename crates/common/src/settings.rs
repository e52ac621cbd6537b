use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Radius of the trilinear sampling kernel, in voxels.
pub const SAMPLE_KERNEL_VOXELS: f32 = 1.0;

/// Errors detected while loading or validating settings. Not recoverable at runtime.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("voxel size must be positive on every axis, got {0:?}")]
    NonPositiveVoxelSize(Vec3),
    #[error("chunk dimensions must be non-zero on every axis, got {0:?}")]
    ZeroChunkDims(UVec3),
    #[error("halo of {halo} voxels is narrower than max edit radius {max_edit_radius} plus the sampling kernel")]
    HaloTooSmall { halo: u32, max_edit_radius: f32 },
    #[error("{name} must be non-negative, got {value}")]
    Negative { name: &'static str, value: f32 },
    #[error("vertical_weight must be at least 1, got {0}")]
    VerticalWeightBelowOne(f32),
    #[error("deep level {deep_level} must lie below water level {water_level}")]
    InvertedLevels { water_level: f32, deep_level: f32 },
    #[error("max_builds_per_tick must be at least 1")]
    ZeroBuildBudget,
    #[error("worker_threads must be at least 1")]
    ZeroWorkers,
}

/// Everything the streaming core reads from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Voxels per chunk along each axis (core, without halo).
    pub chunk_dims: UVec3,
    /// World size of one voxel along each axis.
    pub voxel_size: Vec3,
    /// Density above this value is solid.
    pub iso_level: f32,
    /// Extra voxels computed around each chunk before the SDF is trimmed.
    pub halo: u32,
    /// Largest accepted terraform radius; larger edits are clamped.
    pub max_edit_radius: f32,
    /// Load radius while the observer is at or above `water_level`.
    pub surface_radius: f32,
    /// Load radius while the observer is at or below `deep_level`.
    pub deep_radius: f32,
    pub water_level: f32,
    pub deep_level: f32,
    /// Hysteresis margin added to the radius before a chunk is evicted.
    pub unload_buffer: f32,
    /// Factor applied to the vertical delta of the distance metric.
    pub vertical_weight: f32,
    pub max_builds_per_tick: usize,
    /// Threads of the offload pool running SDF and mesh jobs.
    pub worker_threads: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            chunk_dims: UVec3::splat(32),
            voxel_size: Vec3::ONE,
            iso_level: 0.0,
            halo: 4,
            max_edit_radius: 2.0,
            surface_radius: 50.0,
            deep_radius: 20.0,
            water_level: 20.0,
            deep_level: -10.0,
            unload_buffer: 10.0,
            vertical_weight: 1.5,
            max_builds_per_tick: 4,
            worker_threads: 2,
        }
    }
}

impl StreamSettings {
    /// Parse settings from YAML. Missing keys take their defaults. The result is validated.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate a YAML settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// World-space extent of one chunk.
    pub fn chunk_size(&self) -> Vec3 {
        self.voxel_size * self.chunk_dims.as_vec3()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.voxel_size.cmpgt(Vec3::ZERO).all()) {
            return Err(ConfigError::NonPositiveVoxelSize(self.voxel_size));
        }
        if self.chunk_dims.min_element() == 0 {
            return Err(ConfigError::ZeroChunkDims(self.chunk_dims));
        }
        for (name, value) in [
            ("max_edit_radius", self.max_edit_radius),
            ("surface_radius", self.surface_radius),
            ("deep_radius", self.deep_radius),
            ("unload_buffer", self.unload_buffer),
        ] {
            if value < 0.0 || value.is_nan() {
                return Err(ConfigError::Negative { name, value });
            }
        }
        // The need scan sizes its vertical reach from the unweighted radius.
        if self.vertical_weight.is_nan() || self.vertical_weight < 1.0 {
            return Err(ConfigError::VerticalWeightBelowOne(self.vertical_weight));
        }
        if self.deep_level >= self.water_level {
            return Err(ConfigError::InvertedLevels {
                water_level: self.water_level,
                deep_level: self.deep_level,
            });
        }
        let halo_world = self.halo as f32 * self.voxel_size.min_element();
        let needed = self.max_edit_radius + SAMPLE_KERNEL_VOXELS * self.voxel_size.max_element();
        if halo_world < needed {
            return Err(ConfigError::HaloTooSmall {
                halo: self.halo,
                max_edit_radius: self.max_edit_radius,
            });
        }
        if self.max_builds_per_tick == 0 {
            return Err(ConfigError::ZeroBuildBudget);
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }
}
