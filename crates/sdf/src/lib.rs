//! Signed distance fields for streamed chunks.
//!
//! Turns a padded density field into an exact signed distance field with a
//! two-pass Euclidean distance transform, trimmed back to the chunk core.
//!
//! # Invariants
//! - Dense fields use `i = z + y * sz + x * sz * sy` (see [`Dims`]).
//! - Negative inside solid, positive outside, world units.
//! - The engine keeps no per-chunk state; every device buffer is owned by
//!   exactly one holder and released on every exit path.

mod density;
mod device;
mod edt;
mod engine;
mod grid;

pub use density::{DensitySource, EditGpu, EditedDensity, PlaneDensity, SphereDensity};
pub use device::{Device, DeviceBuffer, DeviceError, DeviceMemory, panic_message};
pub use edt::{EnvelopeScratch, seed_from_mask, seed_into, squared_edt_1d, squared_edt_3d};
pub use engine::{MAX_DISTANCE, SdfEngine, SdfOutput, SdfParams, SdfRequest};
pub use grid::{Dims, SdfGrid};
