//! Per-section mesh rebuild pipeline.
//!
//! The world thread schedules rebuilds; each one snapshots the section and
//! its neighbours and runs on a worker pool. Finished meshes are handed to
//! the render thread through [`ChunkMeshRebuilder::drain_finished`], which
//! disposes of the section's old mesh before installing the new one.
//!
//! A section has at most one live task. Scheduling again cancels the
//! previous task; its result, if it still arrives, is discarded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use strata_voxel::{ChunkPos, SectionKey, WorldChunkHandler, WorldListener};
use tracing::{debug, error, info, trace, warn};

use crate::chunk_mesh::ChunkMesh;
use crate::error::MeshError;
use crate::meshing::build_section_mesh;
use crate::render::MeshableRegistry;
use crate::snapshot::SectionSnapshot;

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

/// Lifecycle of one rebuild task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MeshTaskState {
    Scheduled = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl MeshTaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Scheduled,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Scheduled or running.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

struct TaskControl {
    state: AtomicU8,
    cancel: AtomicBool,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(MeshTaskState::Scheduled as u8),
            cancel: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MeshTaskState {
        MeshTaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: MeshTaskState, to: MeshTaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` if the task was still live.
    fn cancel(&self) -> bool {
        self.cancel.store(true, Ordering::Release);
        self.transition(MeshTaskState::Scheduled, MeshTaskState::Cancelled)
            || self.transition(MeshTaskState::Running, MeshTaskState::Cancelled)
    }
}

/// Handle to a scheduled rebuild.
#[derive(Clone)]
pub struct MeshTask {
    key: SectionKey,
    generation: u64,
    control: Arc<TaskControl>,
}

impl MeshTask {
    pub fn key(&self) -> SectionKey {
        self.key
    }

    /// Increases with every task the rebuilder creates.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> MeshTaskState {
        self.control.state()
    }

    pub fn is_done(&self) -> bool {
        !self.state().is_live()
    }

    /// Best-effort interrupt. A running build stops at its next check.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }
}

impl std::fmt::Debug for MeshTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshTask")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Output of a task that ran to the end.
#[derive(Debug)]
pub struct FinishedMesh {
    pub key: SectionKey,
    pub generation: u64,
    /// `Ok(None)`: nothing visible, the section needs no mesh.
    pub result: Result<Option<ChunkMesh>, MeshError>,
}

/// Owner of the graphics resources for section meshes. Called only from
/// the thread that calls [`ChunkMeshRebuilder::drain_finished`].
pub trait MeshInstaller {
    /// Frees the section's current mesh, if it has one.
    fn dispose(&mut self, key: SectionKey);

    fn install(&mut self, key: SectionKey, mesh: ChunkMesh);
}

/// Running totals since the rebuilder started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub scheduled: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub snapshots_released: usize,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    failed: AtomicUsize,
    released: AtomicUsize,
}

impl Counters {
    fn release(&self, snapshot: &mut SectionSnapshot) {
        snapshot.release();
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

struct MeshJob {
    key: SectionKey,
    generation: u64,
    snapshot: SectionSnapshot,
    control: Arc<TaskControl>,
}

/// Releases the snapshot however the job ends.
struct SnapshotGuard<'a> {
    snapshot: SectionSnapshot,
    counters: &'a Counters,
}

impl std::ops::Deref for SnapshotGuard<'_> {
    type Target = SectionSnapshot;

    fn deref(&self) -> &SectionSnapshot {
        &self.snapshot
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.counters.release(&mut self.snapshot);
    }
}

// ---------------------------------------------------------------------------
// Rebuilder
// ---------------------------------------------------------------------------

/// Schedules section mesh builds on a worker pool.
pub struct ChunkMeshRebuilder {
    tasks: DashMap<SectionKey, MeshTask>,
    next_generation: AtomicU64,
    job_sender: Option<Sender<MeshJob>>,
    result_receiver: Receiver<FinishedMesh>,
    /// Sections of unloaded chunks whose installed meshes must be freed.
    disposals: (Sender<SectionKey>, Receiver<SectionKey>),
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl ChunkMeshRebuilder {
    /// Spawns `worker_threads` workers named `mesh-worker-N`; zero means one
    /// per available CPU.
    pub fn new(registry: Arc<dyn MeshableRegistry>, worker_threads: usize) -> std::io::Result<Self> {
        let count = if worker_threads == 0 {
            num_cpus::get()
        } else {
            worker_threads
        }
        .max(1);

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<MeshJob>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let registry = Arc::clone(&registry);
            let counters = Arc::clone(&counters);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("mesh-worker-{i}"))
                    .spawn(move || run_worker(&jobs, &results, registry.as_ref(), &counters))?,
            );
        }
        info!(workers = count, "Mesh rebuilder started");

        Ok(Self {
            tasks: DashMap::new(),
            next_generation: AtomicU64::new(1),
            job_sender: Some(job_tx),
            result_receiver: result_rx,
            disposals: crossbeam_channel::unbounded(),
            workers,
            counters,
        })
    }

    /// Cancels any task for `key`, snapshots the section and its neighbours
    /// from `handler`, and submits a new task.
    pub fn schedule_section_mesh_rebuild(
        &self,
        handler: &WorldChunkHandler,
        key: SectionKey,
    ) -> Result<MeshTask, MeshError> {
        self.cancel(key);
        let snapshot = SectionSnapshot::capture(handler, key)?;
        self.submit(snapshot)
    }

    /// Submits a build of an existing snapshot.
    ///
    /// Fails with [`MeshError::AlreadyInFlight`] while another task for the
    /// same section is live. The snapshot is released on every error path.
    pub fn submit(&self, mut snapshot: SectionSnapshot) -> Result<MeshTask, MeshError> {
        let key = snapshot.key();
        let Some(sender) = &self.job_sender else {
            self.counters.release(&mut snapshot);
            return Err(MeshError::ShutDown);
        };

        let task = MeshTask {
            key,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            control: Arc::new(TaskControl::new()),
        };
        match self.tasks.entry(key) {
            Entry::Occupied(entry) if entry.get().state().is_live() => {
                drop(entry);
                self.counters.release(&mut snapshot);
                return Err(MeshError::AlreadyInFlight(key));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(task.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(task.clone());
            }
        }

        let job = MeshJob {
            key,
            generation: task.generation,
            snapshot,
            control: Arc::clone(&task.control),
        };
        if let Err(crossbeam_channel::SendError(mut job)) = sender.send(job) {
            self.tasks.remove_if(&key, |_, t| t.generation == task.generation);
            self.counters.release(&mut job.snapshot);
            return Err(MeshError::ShutDown);
        }
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        trace!(?key, generation = task.generation, "Mesh rebuild scheduled");
        Ok(task)
    }

    /// Cancels the task for `key`. Returns `false` if none was live.
    pub fn cancel(&self, key: SectionKey) -> bool {
        match self.tasks.remove(&key) {
            Some((_, task)) => task.cancel(),
            None => false,
        }
    }

    /// Cancels every task belonging to `chunk`. Returns how many were live.
    pub fn cancel_chunk(&self, chunk: ChunkPos) -> usize {
        let keys: Vec<SectionKey> = self
            .tasks
            .iter()
            .filter(|entry| entry.key().chunk == chunk)
            .map(|entry| *entry.key())
            .collect();
        keys.into_iter().filter(|&key| self.cancel(key)).count()
    }

    /// Cancels the chunk's tasks and queues disposal of the meshes of its
    /// first `sections` sections for the next [`drain_finished`](Self::drain_finished).
    /// Returns how many tasks were live.
    pub fn dispose_chunk(&self, chunk: ChunkPos, sections: usize) -> usize {
        let cancelled = self.cancel_chunk(chunk);
        for section in 0..sections {
            // The receiver lives in `self`, so this cannot fail.
            let _ = self.disposals.0.send(SectionKey::new(chunk, section));
        }
        trace!(?chunk, sections, cancelled, "Chunk meshes queued for disposal");
        cancelled
    }

    /// Frees meshes of unloaded chunks, then installs every finished mesh
    /// whose task is still current.
    ///
    /// Must run on the thread that owns graphics resources. Disposals go
    /// first so a chunk that was reloaded keeps its fresh meshes. Results
    /// from superseded tasks are dropped. Build failures are logged and
    /// returned.
    pub fn drain_finished<I: MeshInstaller + ?Sized>(
        &self,
        installer: &mut I,
    ) -> Vec<(SectionKey, MeshError)> {
        for key in self.disposals.1.try_iter() {
            installer.dispose(key);
        }
        let mut failures = Vec::new();
        for finished in self.result_receiver.try_iter() {
            let key = finished.key;
            let current = self
                .tasks
                .remove_if(&key, |_, task| task.generation == finished.generation)
                .is_some();
            if !current {
                trace!(?key, generation = finished.generation, "Dropping superseded mesh");
                continue;
            }
            match finished.result {
                Ok(Some(mesh)) => {
                    installer.dispose(key);
                    installer.install(key, mesh);
                }
                Ok(None) => installer.dispose(key),
                Err(e) => {
                    error!(?key, "Section mesh build failed: {e}");
                    failures.push((key, e));
                }
            }
        }
        failures
    }

    pub fn task_state(&self, key: SectionKey) -> Option<MeshTaskState> {
        self.tasks.get(&key).map(|task| task.state())
    }

    /// Tasks scheduled or running.
    pub fn in_flight_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.state().is_live())
            .count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> RebuildStats {
        let c = &self.counters;
        RebuildStats {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            snapshots_released: c.released.load(Ordering::Relaxed),
        }
    }

    /// Cancels all tasks and joins the workers.
    pub fn shutdown(&mut self) {
        if self.job_sender.take().is_none() {
            return;
        }
        for task in self.tasks.iter() {
            task.cancel();
        }
        self.tasks.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Mesh rebuilder stopped");
    }
}

impl Drop for ChunkMeshRebuilder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ChunkMeshRebuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkMeshRebuilder")
            .field("workers", &self.workers.len())
            .field("tasks", &self.tasks.len())
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_worker(
    jobs: &Receiver<MeshJob>,
    results: &Sender<FinishedMesh>,
    registry: &dyn MeshableRegistry,
    counters: &Counters,
) {
    while let Ok(job) = jobs.recv() {
        let MeshJob {
            key,
            generation,
            snapshot,
            control,
        } = job;
        let guard = SnapshotGuard { snapshot, counters };

        if !control.transition(MeshTaskState::Scheduled, MeshTaskState::Running) {
            trace!(?key, generation, "Mesh task cancelled before start");
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            build_section_mesh(&guard, registry, &control.cancel)
        }))
        .unwrap_or_else(|payload| Err(MeshError::Panicked(panic_message(payload.as_ref()))));
        drop(guard);

        if matches!(outcome, Err(MeshError::Cancelled)) {
            trace!(?key, generation, "Mesh task cancelled");
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let final_state = if outcome.is_ok() {
            MeshTaskState::Completed
        } else {
            MeshTaskState::Failed
        };
        if !control.transition(MeshTaskState::Running, final_state) {
            trace!(?key, generation, "Mesh task cancelled after build");
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let counter = if outcome.is_ok() {
            &counters.completed
        } else {
            &counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let finished = FinishedMesh {
            key,
            generation,
            result: outcome,
        };
        if results.send(finished).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// World hook
// ---------------------------------------------------------------------------

/// Feeds world events into a [`ChunkMeshRebuilder`].
#[derive(Clone, Debug)]
pub struct MeshRebuildListener {
    rebuilder: Arc<ChunkMeshRebuilder>,
}

impl MeshRebuildListener {
    pub fn new(rebuilder: Arc<ChunkMeshRebuilder>) -> Self {
        Self { rebuilder }
    }

    fn schedule(&self, handler: &WorldChunkHandler, key: SectionKey) {
        if let Err(e) = self.rebuilder.schedule_section_mesh_rebuild(handler, key) {
            warn!(?key, "Could not schedule mesh rebuild: {e}");
        }
    }
}

impl WorldListener for MeshRebuildListener {
    fn chunk_loaded(&self, handler: &WorldChunkHandler, pos: ChunkPos) {
        let Some(chunk) = handler.get(pos) else {
            return;
        };
        for section in chunk.sections().filter(|s| !s.is_empty()) {
            self.schedule(handler, section.key());
        }
    }

    fn chunk_unloaded(&self, handler: &WorldChunkHandler, pos: ChunkPos) {
        let sections = handler.get(pos).map_or(0, |chunk| chunk.section_count());
        self.rebuilder.dispose_chunk(pos, sections);
    }

    fn section_needs_rebuild(&self, handler: &WorldChunkHandler, key: SectionKey) {
        self.schedule(handler, key);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
