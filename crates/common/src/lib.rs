//! Shared types for the voxstream workspace: chunk coordinates, terraform
//! edits, biome masks and the streaming settings every crate reads.
//!
//! # Invariants
//! - `ChunkCoord` is compared by equality/hash only; no ordering is implied.
//! - `TerraformEdit` values are immutable once created.
//! - Settings that fail `validate()` never reach the streaming core.

mod settings;
mod types;

pub use settings::{ConfigError, SAMPLE_KERNEL_VOXELS, StreamSettings};
pub use types::{BiomeMask, ChunkCoord, TerraformEdit};
