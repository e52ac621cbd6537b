//! The streaming loop.
//!
//! Everything here runs on the control thread. Workers never touch the
//! coordinator; they send a [`Completion`] over a channel, and completions are
//! applied at the start of the next tick (or collected by
//! [`StreamCoordinator::wait_for_completion`] and applied then).

use crossbeam_channel::{Receiver, Sender};
use glam::Vec3;
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use voxstream_common::{ChunkCoord, ConfigError, StreamSettings, TerraformEdit};
use voxstream_sdf::{
    DensitySource, Device, DeviceError, Dims, SdfEngine, SdfParams, SdfRequest, panic_message,
};

use crate::build::{BuildHalf, BuildTable, BuildToken, Completion, Join};
use crate::grid::ChunkGrid;
use crate::mesh::{CrossingExtractor, ExtractError, MeshExtractor, MeshRequest};
use crate::stats::StreamStats;
use crate::store::ChunkStore;

/// How long [`StreamCoordinator::shutdown`] waits for in-flight jobs.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors raised while constructing a coordinator. Nothing fails at tick time.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid settings: {0}")]
    Config(#[from] ConfigError),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// Decides which chunks to build and evict around an observer and joins the
/// two asynchronous halves (mesh, SDF) of every build.
///
/// Bookkeeping per coordinate:
/// - `pending` holds every coordinate that is queued or building, and nothing else;
/// - `queue` and `builds` are disjoint and together equal `pending`;
/// - `dirty` is a subset of `builds` (edited while building, rebuild on join).
pub struct StreamCoordinator {
    settings: StreamSettings,
    grid: ChunkGrid,
    store: ChunkStore,
    engine: SdfEngine,
    extractor: Arc<dyn MeshExtractor>,
    queue: VecDeque<ChunkCoord>,
    pending: HashSet<ChunkCoord>,
    dirty: HashSet<ChunkCoord>,
    builds: BuildTable,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    /// Received but not yet applied.
    inbox: Vec<Completion>,
    in_flight: usize,
    stats: StreamStats,
}

impl StreamCoordinator {
    pub fn new(
        settings: StreamSettings,
        density: Arc<dyn DensitySource>,
        extractor: Arc<dyn MeshExtractor>,
    ) -> Result<Self, StreamError> {
        settings.validate()?;
        let device = Device::new(settings.worker_threads)?;
        let grid = ChunkGrid::from_settings(&settings);
        let engine = SdfEngine::new(device, density, SdfParams::from_settings(&settings));
        let (tx, rx) = crossbeam_channel::unbounded();
        tracing::info!(
            chunk_dims = ?settings.chunk_dims,
            voxel_size = ?settings.voxel_size,
            workers = settings.worker_threads,
            "stream coordinator ready"
        );
        Ok(Self {
            settings,
            grid,
            store: ChunkStore::new(grid),
            engine,
            extractor,
            queue: VecDeque::new(),
            pending: HashSet::new(),
            dirty: HashSet::new(),
            builds: BuildTable::new(),
            tx,
            rx,
            inbox: Vec::new(),
            in_flight: 0,
            stats: StreamStats::default(),
        })
    }

    /// Coordinator meshing with [`CrossingExtractor`] over the same density.
    pub fn with_density(
        settings: StreamSettings,
        density: Arc<dyn DensitySource>,
    ) -> Result<Self, StreamError> {
        let extractor = Arc::new(CrossingExtractor::new(Arc::clone(&density)));
        Self::new(settings, density, extractor)
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn device(&self) -> &Device {
        self.engine.device()
    }

    /// Counters as of the last tick.
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn is_pending(&self, coord: ChunkCoord) -> bool {
        self.pending.contains(&coord)
    }

    pub fn is_building(&self, coord: ChunkCoord) -> bool {
        self.builds.contains(coord)
    }

    pub fn is_dirty(&self, coord: ChunkCoord) -> bool {
        self.dirty.contains(&coord)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued, building, in flight or waiting to be applied.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.builds.is_empty() && self.in_flight == 0 && self.inbox.is_empty()
    }

    /// Whether `pending` is exactly the disjoint union of the queue and the
    /// tracked builds, with no coordinate queued twice.
    pub fn bookkeeping_consistent(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.queue.len());
        for coord in &self.queue {
            if !seen.insert(*coord) || self.builds.contains(*coord) {
                return false;
            }
        }
        let union = seen.len() + self.builds.len();
        union == self.pending.len()
            && seen.iter().all(|c| self.pending.contains(c))
            && self.pending.iter().all(|c| seen.contains(c) || self.builds.contains(*c))
            && self.dirty.iter().all(|c| self.builds.contains(*c))
    }

    /// Load radius for an observer at `height`: `surface_radius` at or above
    /// the water level, `deep_radius` at or below the deep level, linear between.
    pub fn dynamic_radius(&self, height: f32) -> f32 {
        let s = &self.settings;
        if height >= s.water_level {
            return s.surface_radius;
        }
        if height <= s.deep_level {
            return s.deep_radius;
        }
        let t = (s.water_level - height) / (s.water_level - s.deep_level);
        s.surface_radius + (s.deep_radius - s.surface_radius) * t
    }

    /// Distance from the observer to a chunk centre with the vertical delta
    /// scaled by `vertical_weight`.
    pub fn weighted_distance(&self, coord: ChunkCoord, observer: Vec3) -> f32 {
        let d = self.grid.chunk_center_world(coord) - observer;
        Vec3::new(d.x, d.y * self.settings.vertical_weight, d.z).length()
    }

    /// One step of the stream: apply finished halves, enqueue what is needed,
    /// evict what is far, launch up to `max_builds_per_tick` builds.
    pub fn tick(&mut self, observer: Vec3) -> &StreamStats {
        let _span = tracing::info_span!("stream_tick", tick = self.stats.tick + 1).entered();
        let start = Instant::now();

        self.process_completions();
        let radius = self.dynamic_radius(observer.y);
        let enqueued = self.enqueue_needed(observer, radius);
        let evicted = self.unload_far(observer, radius);
        let started = self.build_queued(observer, radius);

        let stats = &mut self.stats;
        stats.tick += 1;
        stats.radius = radius;
        stats.resident = self.store.len();
        stats.queued = self.queue.len();
        stats.pending = self.pending.len();
        stats.building = self.builds.len();
        stats.dirty = self.dirty.len();
        stats.enqueued_this_tick = enqueued;
        stats.started_this_tick = started;
        stats.evicted_this_tick = evicted;
        stats.tick_time = start.elapsed();

        tracing::trace!(
            enqueued,
            evicted,
            started,
            resident = stats.resident,
            pending = stats.pending,
            "stream tick complete"
        );
        &self.stats
    }

    /// Record an edit and schedule rebuilds of the resident chunks it touches.
    ///
    /// A chunk mid-build is marked dirty and rebuilt once, after its current
    /// build joins. A queued chunk needs nothing: its build reads the edit
    /// list at launch. An idle resident chunk is enqueued. Chunks not yet
    /// streamed in pick the edit up from the journal when they are.
    pub fn apply_terraform_edit(&mut self, edit: TerraformEdit) -> HashSet<ChunkCoord> {
        let mut edit = edit;
        let max = self.settings.max_edit_radius;
        if edit.radius > max {
            tracing::warn!(requested = edit.radius, max, "terraform radius clamped");
            edit.radius = max;
        }

        let affected = self.store.apply_terraform_edit(edit);
        for &coord in &affected {
            if self.builds.contains(coord) {
                if self.dirty.insert(coord) {
                    tracing::debug!(%coord, "chunk marked dirty mid-build");
                }
            } else if self.pending.contains(&coord) {
                continue;
            } else if self.store.contains(coord) && self.enqueue(coord) {
                tracing::debug!(%coord, "chunk queued for rebuild");
            }
        }
        affected
    }

    /// Block until every launched half has reported back or `timeout` elapses.
    /// Results are held and applied by the next tick. Returns `true` if nothing
    /// is left in flight.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(completion) => self.receive(completion),
                Err(_) => return false,
            }
        }
        true
    }

    /// Destroy every chunk and forget all queued and in-flight work. The edit
    /// journal is kept, so edits come back as the world streams in again.
    pub fn reload_all(&mut self) {
        let resident = self.store.len();
        self.store.clear();
        self.queue.clear();
        self.pending.clear();
        self.dirty.clear();
        self.builds.clear();
        tracing::info!(resident, "reloading all chunks");
    }

    /// Release every chunk, drain outstanding jobs (dropping their results)
    /// and tear down the shared placeholder buffer. Returns `false` if some
    /// job did not report back within [`SHUTDOWN_GRACE`].
    pub fn shutdown(&mut self) -> bool {
        self.reload_all();
        let drained = self.wait_for_completion(SHUTDOWN_GRACE);
        if !drained {
            tracing::warn!(in_flight = self.in_flight, "shutdown with jobs still in flight");
        }
        self.process_completions();
        self.engine.device().teardown();
        tracing::info!(
            live_buffers = self.engine.device().memory().live_buffers(),
            "stream coordinator shut down"
        );
        drained
    }

    fn receive(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.inbox.push(completion);
    }

    fn process_completions(&mut self) {
        while let Ok(completion) = self.rx.try_recv() {
            self.receive(completion);
        }
        for completion in std::mem::take(&mut self.inbox) {
            self.apply_completion(completion);
        }
    }

    fn apply_completion(&mut self, completion: Completion) {
        let coord = completion.coord();
        let token = completion.token();
        let half = completion.half();
        if !self.builds.is_current(coord, token) {
            self.stats.stale_total += 1;
            tracing::trace!(%coord, ?half, token = token.generation(), "stale completion dropped");
            return;
        }

        let committed = match completion {
            Completion::Mesh {
                result: Ok(output), ..
            } => self.store.commit_mesh(coord, output),
            Completion::Sdf {
                result: Ok(output), ..
            } => self.store.commit_sdf(coord, output),
            Completion::Mesh { result: Err(e), .. } => {
                self.stats.failed_total += 1;
                tracing::warn!(%coord, error = %e, "mesh half failed; chunk stays unbuilt");
                return;
            }
            Completion::Sdf { result: Err(e), .. } => {
                self.stats.failed_total += 1;
                tracing::warn!(%coord, error = %e, "sdf half failed; chunk stays unbuilt");
                return;
            }
        };
        if !committed {
            self.stats.stale_total += 1;
            return;
        }

        self.builds.mark(coord, token, half);
        self.join_check(coord, token);
    }

    fn join_check(&mut self, coord: ChunkCoord, token: BuildToken) {
        if self.builds.join(coord, token) != Join::Finalized {
            return;
        }
        self.stats.completed_total += 1;
        if self.dirty.remove(&coord) {
            // Stays pending: the queue takes over from the finished build.
            self.queue.push_back(coord);
            tracing::debug!(%coord, "dirty chunk requeued");
        } else {
            self.pending.remove(&coord);
            tracing::debug!(%coord, "chunk built");
        }
    }

    fn enqueue(&mut self, coord: ChunkCoord) -> bool {
        if !self.pending.insert(coord) {
            return false;
        }
        self.queue.push_back(coord);
        true
    }

    fn enqueue_needed(&mut self, observer: Vec3, radius: f32) -> usize {
        let center = self.grid.world_to_chunk(observer);
        let reach = ((radius + self.settings.unload_buffer) / self.grid.chunk_size())
            .ceil()
            .as_ivec3();
        let mut enqueued = 0;
        for dx in -reach.x..=reach.x {
            for dy in -reach.y..=reach.y {
                for dz in -reach.z..=reach.z {
                    let coord = center.offset(dx, dy, dz);
                    if self.weighted_distance(coord, observer) > radius
                        || self.store.contains(coord)
                    {
                        continue;
                    }
                    if self.enqueue(coord) {
                        enqueued += 1;
                    }
                }
            }
        }
        enqueued
    }

    fn unload_far(&mut self, observer: Vec3, radius: f32) -> usize {
        let limit = radius + self.settings.unload_buffer;
        let far: HashSet<ChunkCoord> = self
            .store
            .coords()
            .filter(|&c| self.weighted_distance(c, observer) > limit)
            .collect();
        if far.is_empty() {
            return 0;
        }
        for &coord in &far {
            self.store.destroy(coord);
            self.pending.remove(&coord);
            self.dirty.remove(&coord);
            if self.builds.cancel(coord) {
                tracing::debug!(%coord, "in-flight build abandoned");
            }
            tracing::debug!(%coord, "chunk evicted");
        }
        self.queue.retain(|c| !far.contains(c));
        far.len()
    }

    fn build_queued(&mut self, observer: Vec3, radius: f32) -> usize {
        let mut started = 0;
        while started < self.settings.max_builds_per_tick {
            let Some(coord) = self.queue.pop_front() else {
                break;
            };
            // A resident chunk queued for a rebuild is kept until eviction,
            // so it is held to the eviction limit rather than the load radius.
            let limit = if self.store.contains(coord) {
                radius + self.settings.unload_buffer
            } else {
                radius
            };
            if self.weighted_distance(coord, observer) > limit {
                self.pending.remove(&coord);
                tracing::trace!(%coord, "queued chunk left the radius");
                continue;
            }
            self.launch(coord);
            started += 1;
        }
        started
    }

    fn launch(&mut self, coord: ChunkCoord) {
        let origin = self.grid.chunk_min(coord);
        let edits: Arc<[TerraformEdit]> =
            Arc::from(self.store.ensure_placeholder(coord).edits.as_slice());
        let token = self.builds.start(coord);

        // Nothing is rendered above the water line, but distance queries still
        // need the field there.
        let skip_mesh = origin.y > self.settings.water_level;
        if skip_mesh {
            self.builds.mark(coord, token, BuildHalf::Mesh);
        } else {
            let request = MeshRequest {
                coord,
                origin,
                dims: Dims::from(self.settings.chunk_dims),
                voxel_size: self.settings.voxel_size,
                iso_level: self.settings.iso_level,
                edits: Arc::clone(&edits),
            };
            let extractor = Arc::clone(&self.extractor);
            let tx = self.tx.clone();
            self.in_flight += 1;
            self.engine.device().spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(&request)))
                    .unwrap_or_else(|payload| {
                        Err(ExtractError::Failed {
                            coord,
                            reason: format!("extractor panicked: {}", panic_message(&*payload)),
                        })
                    });
                let _ = tx.send(Completion::Mesh {
                    coord,
                    token,
                    result,
                });
            });
        }

        let tx = self.tx.clone();
        self.in_flight += 1;
        let edit_count = edits.len();
        self.engine.build_async(
            SdfRequest {
                coord,
                origin,
                edits,
            },
            move |coord, result| {
                let _ = tx.send(Completion::Sdf {
                    coord,
                    token,
                    result,
                });
            },
        );

        self.stats.launched_total += 1;
        tracing::debug!(
            %coord,
            token = token.generation(),
            skip_mesh,
            edits = edit_count,
            "build launched"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use voxstream_sdf::PlaneDensity;

    fn coordinator(settings: StreamSettings) -> StreamCoordinator {
        StreamCoordinator::with_density(settings, Arc::new(PlaneDensity { height: 0.0 })).unwrap()
    }

    #[test]
    fn invalid_settings_fail_fast() {
        let settings = StreamSettings {
            voxel_size: Vec3::ZERO,
            ..Default::default()
        };
        let err = StreamCoordinator::with_density(settings, Arc::new(PlaneDensity { height: 0.0 }));
        assert!(matches!(err, Err(StreamError::Config(_))));
    }

    #[test]
    fn sub_unit_vertical_weight_is_rejected() {
        let settings = StreamSettings {
            vertical_weight: 0.25,
            ..Default::default()
        };
        let err = StreamCoordinator::with_density(settings, Arc::new(PlaneDensity { height: 0.0 }));
        assert!(matches!(
            err,
            Err(StreamError::Config(ConfigError::VerticalWeightBelowOne(_)))
        ));
    }

    #[test]
    fn radius_interpolates_between_levels() {
        let c = coordinator(StreamSettings {
            surface_radius: 60.0,
            deep_radius: 20.0,
            water_level: 10.0,
            deep_level: -30.0,
            ..Default::default()
        });
        assert_eq!(c.dynamic_radius(50.0), 60.0);
        assert_eq!(c.dynamic_radius(10.0), 60.0);
        assert_eq!(c.dynamic_radius(-30.0), 20.0);
        assert_eq!(c.dynamic_radius(-100.0), 20.0);
        assert_relative_eq!(c.dynamic_radius(-10.0), 40.0);
    }

    #[test]
    fn vertical_delta_counts_more() {
        let c = coordinator(StreamSettings {
            chunk_dims: glam::UVec3::splat(8),
            vertical_weight: 2.0,
            ..Default::default()
        });
        let observer = Vec3::splat(4.0);
        assert_relative_eq!(c.weighted_distance(ChunkCoord::new(1, 0, 0), observer), 8.0);
        assert_relative_eq!(c.weighted_distance(ChunkCoord::new(0, -1, 0), observer), 16.0);
    }

    #[test]
    fn first_tick_queues_and_respects_budget() {
        let mut c = coordinator(StreamSettings {
            chunk_dims: glam::UVec3::splat(8),
            surface_radius: 12.0,
            water_level: 0.0,
            max_builds_per_tick: 2,
            ..Default::default()
        });
        let stats = c.tick(Vec3::splat(4.0)).clone();
        assert!(stats.enqueued_this_tick > 2);
        assert_eq!(stats.started_this_tick, 2);
        assert_eq!(stats.building, 2);
        assert_eq!(stats.pending, stats.queued + stats.building);
        assert!(c.bookkeeping_consistent());
        assert!(c.wait_for_completion(Duration::from_secs(30)));
        c.shutdown();
    }

    #[test]
    fn edit_on_untracked_region_only_journals() {
        let mut c = coordinator(StreamSettings::default());
        let affected = c.apply_terraform_edit(TerraformEdit::new(Vec3::splat(500.0), -1.0, 1.0));
        assert_eq!(affected.len(), 1);
        assert_eq!(c.queued(), 0);
        assert_eq!(c.store().journal().len(), 1);
    }

    #[test]
    fn oversized_edits_are_clamped() {
        let mut c = coordinator(StreamSettings::default());
        c.apply_terraform_edit(TerraformEdit::new(Vec3::splat(16.0), -1.0, 100.0));
        assert_eq!(c.store().journal()[0].radius, c.settings().max_edit_radius);
    }
}
