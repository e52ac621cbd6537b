//! Per-coordinate build tracking and the join of its two halves.
//!
//! Every launched build gets a fresh [`BuildToken`]. Workers echo the token
//! back with their result; a result whose token no longer matches the one
//! tracked for its coordinate is stale and must be dropped.

use std::collections::HashMap;
use voxstream_common::ChunkCoord;
use voxstream_sdf::{DeviceError, SdfOutput};

use crate::mesh::{ExtractError, MeshOutput};

/// Identity of one launched build. Never reused within a [`BuildTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildToken(u64);

impl BuildToken {
    pub fn generation(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildHalf {
    Mesh,
    Sdf,
}

/// Completion flags of the build currently tracked for a coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildState {
    pub token: BuildToken,
    pub mesh_done: bool,
    pub sdf_done: bool,
}

impl BuildState {
    fn new(token: BuildToken) -> Self {
        Self {
            token,
            mesh_done: false,
            sdf_done: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.mesh_done && self.sdf_done
    }
}

/// Result of a [`BuildTable::join`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// The build is current but a half is still outstanding.
    Waiting,
    /// Both halves are done; the build was removed from the table.
    Finalized,
    /// The token is not (or no longer) the tracked one. Nothing changed.
    Stale,
}

/// At most one live [`BuildState`] per coordinate.
#[derive(Debug, Default)]
pub struct BuildTable {
    builds: HashMap<ChunkCoord, BuildState>,
    next_generation: u64,
}

impl BuildTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new build for `coord`, superseding any previous one.
    pub fn start(&mut self, coord: ChunkCoord) -> BuildToken {
        self.next_generation += 1;
        let token = BuildToken(self.next_generation);
        if let Some(old) = self.builds.insert(coord, BuildState::new(token)) {
            tracing::debug!(%coord, old = old.token.0, new = token.0, "build superseded");
        }
        token
    }

    pub fn get(&self, coord: ChunkCoord) -> Option<&BuildState> {
        self.builds.get(&coord)
    }

    pub fn is_current(&self, coord: ChunkCoord, token: BuildToken) -> bool {
        self.builds.get(&coord).is_some_and(|s| s.token == token)
    }

    /// Set one done flag on the current build. Returns `false` if `token` is stale.
    pub fn mark(&mut self, coord: ChunkCoord, token: BuildToken, half: BuildHalf) -> bool {
        match self.builds.get_mut(&coord) {
            Some(state) if state.token == token => {
                match half {
                    BuildHalf::Mesh => state.mesh_done = true,
                    BuildHalf::Sdf => state.sdf_done = true,
                }
                true
            }
            _ => false,
        }
    }

    /// Finalize the build if both halves are done. Calling it again for a
    /// build that was already finalized reports [`Join::Stale`] and does nothing.
    pub fn join(&mut self, coord: ChunkCoord, token: BuildToken) -> Join {
        match self.builds.get(&coord) {
            Some(state) if state.token == token => {
                if state.is_complete() {
                    self.builds.remove(&coord);
                    Join::Finalized
                } else {
                    Join::Waiting
                }
            }
            _ => Join::Stale,
        }
    }

    /// Forget the build for `coord`; its outstanding results become stale.
    pub fn cancel(&mut self, coord: ChunkCoord) -> bool {
        self.builds.remove(&coord).is_some()
    }

    pub fn clear(&mut self) {
        self.builds.clear();
    }

    pub fn len(&self) -> usize {
        self.builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.builds.contains_key(&coord)
    }
}

/// A finished half, sent from a worker back to the control thread.
#[derive(Debug)]
pub enum Completion {
    Mesh {
        coord: ChunkCoord,
        token: BuildToken,
        result: Result<MeshOutput, ExtractError>,
    },
    Sdf {
        coord: ChunkCoord,
        token: BuildToken,
        result: Result<SdfOutput, DeviceError>,
    },
}

impl Completion {
    pub fn coord(&self) -> ChunkCoord {
        match self {
            Self::Mesh { coord, .. } | Self::Sdf { coord, .. } => *coord,
        }
    }

    pub fn token(&self) -> BuildToken {
        match self {
            Self::Mesh { token, .. } | Self::Sdf { token, .. } => *token,
        }
    }

    pub fn half(&self) -> BuildHalf {
        match self {
            Self::Mesh { .. } => BuildHalf::Mesh,
            Self::Sdf { .. } => BuildHalf::Sdf,
        }
    }
}
