//! Chunk streaming around a moving observer.
//!
//! Each tick the [`StreamCoordinator`] works out which chunks the observer
//! needs, evicts the ones that drifted too far, and launches a bounded number
//! of builds. A build has two halves, a mesh and an SDF, that run on the
//! device pool and are joined exactly once on the control thread.
//!
//! # Invariants
//! - At most one live build per coordinate; superseded results are dropped.
//! - A coordinate leaves the pending set only when both halves of its current
//!   build are done, unless it is evicted.
//! - An edit landing mid-build triggers exactly one rebuild after the join.
//! - Device buffers carried by dropped results are released.

mod build;
mod coordinator;
mod grid;
mod mesh;
mod stats;
mod store;

pub use build::{BuildHalf, BuildState, BuildTable, BuildToken, Completion, Join};
pub use coordinator::{SHUTDOWN_GRACE, StreamCoordinator, StreamError};
pub use grid::ChunkGrid;
pub use mesh::{ChunkMesh, CrossingExtractor, ExtractError, MeshExtractor, MeshOutput, MeshRequest};
pub use stats::{StreamStats, TickTimer};
pub use store::{Chunk, ChunkStore, GRADIENT_DELTA};
