//! The world: chunks, their loader and creator, the block changer and the
//! thread that ticks them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::block::BlockState;
use crate::changer::{BlockChangeSender, WorldBlockChanger};
use crate::chunk::{ChunkError, ChunkPos, validate_height};
use crate::chunk_loading::{ChunkLoadConfig, ChunkLoader};
use crate::creator::{ChunkCreationListener, ChunkCreator, ChunkSource};
use crate::events::{WorldListener, WorldListeners};
use crate::handler::{EntityTickReport, WorldChunkHandler};

#[derive(Debug, Error)]
pub enum WorldError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Construction parameters for a [`World`].
#[derive(Clone, Debug)]
pub struct WorldSettings {
    /// Height in blocks, a positive multiple of 16.
    pub height: i32,
    pub loading: ChunkLoadConfig,
    pub creator_threads: usize,
    /// Creation requests that may wait for a worker at once.
    pub creator_queue: usize,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            height: 256,
            loading: ChunkLoadConfig::default(),
            creator_threads: 2,
            creator_queue: 256,
        }
    }
}

/// Summary of one [`World::tick`].
#[derive(Debug, Default)]
pub struct TickReport {
    pub world_time: u64,
    pub created: Vec<ChunkPos>,
    pub requested: usize,
    pub loaded: Vec<ChunkPos>,
    pub unloaded: Vec<ChunkPos>,
    pub block_changes: usize,
    pub rebuilds: usize,
    pub entities: EntityTickReport,
}

pub struct World {
    world_time: u64,
    handler: WorldChunkHandler,
    loader: ChunkLoader,
    creator: ChunkCreator,
    changer: WorldBlockChanger,
    listeners: WorldListeners,
}

impl World {
    pub fn new(settings: WorldSettings, source: Arc<dyn ChunkSource>) -> Result<Self, WorldError> {
        validate_height(settings.height)?;
        let creator = ChunkCreator::new(
            source,
            settings.height,
            settings.creator_threads,
            settings.creator_queue,
        )?;
        Ok(Self {
            world_time: 0,
            handler: WorldChunkHandler::new(settings.height)?,
            loader: ChunkLoader::new(settings.loading),
            creator,
            changer: WorldBlockChanger::new(),
            listeners: WorldListeners::new(),
        })
    }

    pub fn height(&self) -> i32 {
        self.handler.height()
    }

    /// Ticks since creation.
    pub fn world_time(&self) -> u64 {
        self.world_time
    }

    pub fn handler(&self) -> &WorldChunkHandler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut WorldChunkHandler {
        &mut self.handler
    }

    pub fn loader(&self) -> &ChunkLoader {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut ChunkLoader {
        &mut self.loader
    }

    pub fn creator(&self) -> &ChunkCreator {
        &self.creator
    }

    /// Handle for queueing block edits from any thread.
    pub fn block_changes(&self) -> BlockChangeSender {
        self.changer.sender()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn WorldListener>) {
        self.listeners.add(listener);
    }

    pub fn add_creation_listener(&mut self, listener: Arc<dyn ChunkCreationListener>) {
        self.creator.add_listener(listener);
    }

    /// State at world `(x, y, z)`; air where no chunk exists.
    pub fn get_block_state(&self, x: i32, y: i32, z: i32) -> Option<BlockState> {
        self.handler.block_state(x, y, z)
    }

    /// Queues an edit. Applied at the next tick if the chunk is loaded by then.
    pub fn set_block(&self, x: i32, y: i32, z: i32, state: Option<BlockState>) -> Result<(), ChunkError> {
        let pos = ChunkPos::containing(x, z);
        self.handler
            .get(pos)
            .ok_or(ChunkError::UnknownChunk(pos))?
            .set_block(x, y, z, state)
    }

    /// Advances the world by one tick.
    ///
    /// Order: register created chunks, load and unload around viewers, apply
    /// queued block edits, tick entities.
    pub fn tick(&mut self) -> TickReport {
        self.world_time += 1;
        let mut report = TickReport {
            world_time: self.world_time,
            ..Default::default()
        };

        report.created = self
            .creator
            .finish_ready(&mut self.handler, &self.changer.sender());
        for &pos in &report.created {
            self.listeners.chunk_created(&self.handler, pos);
        }

        let loading = self.loader.tick(&mut self.handler, &self.creator);
        for &pos in &loading.loaded {
            self.listeners.chunk_loaded(&self.handler, pos);
        }
        for &pos in &loading.unloaded {
            self.listeners.chunk_unloaded(&self.handler, pos);
        }
        report.requested = loading.requested.len();
        report.loaded = loading.loaded;
        report.unloaded = loading.unloaded;

        let applied = self.changer.apply_pending(&mut self.handler);
        for change in &applied.changes {
            self.listeners.block_changed(&self.handler, change);
        }
        for &key in &applied.rebuilds {
            self.listeners.section_needs_rebuild(&self.handler, key);
        }
        report.block_changes = applied.changes.len();
        report.rebuilds = applied.rebuilds.len();

        report.entities = self.handler.tick_entities(self.world_time);
        report
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("world_time", &self.world_time)
            .field("chunks", &self.handler.len())
            .field("loaded", &self.handler.loaded_count())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// World thread
// ---------------------------------------------------------------------------

struct TickControl {
    running: AtomicBool,
    pause_requested: AtomicBool,
    paused: AtomicBool,
}

/// Acknowledgement that the world thread has parked.
pub struct PauseTicket {
    ack: Receiver<()>,
}

impl PauseTicket {
    /// Blocks until the thread parks. Returns `false` if it stopped instead.
    pub fn wait(&self) -> bool {
        self.ack.recv().is_ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.ack.recv_timeout(timeout).is_ok()
    }
}

/// Ticks a shared [`World`] at a fixed rate on a thread named `world`.
///
/// Other threads reach the world through [`WorldThread::world`]. To make a
/// batch of changes with no tick in between, call
/// [`request_pause`](WorldThread::request_pause), wait on the ticket, then
/// [`resume`](WorldThread::resume).
pub struct WorldThread {
    world: Arc<Mutex<World>>,
    control: Arc<TickControl>,
    pause_requests: Sender<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl WorldThread {
    pub fn spawn(world: World, tick_interval: Duration) -> std::io::Result<Self> {
        let world = Arc::new(Mutex::new(world));
        let control = Arc::new(TickControl {
            running: AtomicBool::new(true),
            pause_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        });
        let (pause_requests, pause_rx) = unbounded::<Sender<()>>();

        let handle = {
            let world = Arc::clone(&world);
            let control = Arc::clone(&control);
            std::thread::Builder::new()
                .name("world".into())
                .spawn(move || run_world_loop(&world, &control, &pause_rx, tick_interval))?
        };
        info!(interval_ms = tick_interval.as_millis() as u64, "World thread started");

        Ok(Self {
            world,
            control,
            pause_requests,
            handle: Some(handle),
        })
    }

    pub fn world(&self) -> &Arc<Mutex<World>> {
        &self.world
    }

    /// Asks the thread to park after its current tick.
    pub fn request_pause(&self) -> PauseTicket {
        let (ack_tx, ack) = bounded(1);
        self.control.pause_requested.store(true, Ordering::Release);
        let _ = self.pause_requests.send(ack_tx);
        PauseTicket { ack }
    }

    pub fn resume(&self) {
        self.control.pause_requested.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops ticking and joins the thread.
    pub fn shutdown(&mut self) {
        self.control.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!("World thread stopped");
        }
    }
}

impl Drop for WorldThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_world_loop(
    world: &Mutex<World>,
    control: &TickControl,
    pause_requests: &Receiver<Sender<()>>,
    interval: Duration,
) {
    while control.running.load(Ordering::Acquire) {
        if control.pause_requested.load(Ordering::Acquire) {
            if !control.paused.swap(true, Ordering::AcqRel) {
                debug!("World thread paused");
            }
            for ack in pause_requests.try_iter() {
                let _ = ack.send(());
            }
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        if control.paused.swap(false, Ordering::AcqRel) {
            debug!("World thread resumed");
        }

        let start = Instant::now();
        let report = match world.lock() {
            Ok(mut world) => world.tick(),
            Err(_) => {
                error!("World state poisoned by a panic; stopping world thread");
                break;
            }
        };
        trace!(
            world_time = report.world_time,
            created = report.created.len(),
            loaded = report.loaded.len(),
            unloaded = report.unloaded.len(),
            changes = report.block_changes,
            elapsed_us = start.elapsed().as_micros() as u64,
            "World tick"
        );
        std::thread::sleep(interval.saturating_sub(start.elapsed()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::block::BlockId;
    use crate::chunk::SectionKey;
    use crate::chunk_loading::ViewerId;
    use crate::creator::FlatGenerator;

    fn stone() -> BlockState {
        BlockState::of(BlockId(0))
    }

    fn settings() -> WorldSettings {
        WorldSettings {
            height: 32,
            loading: ChunkLoadConfig {
                chunk_loading_distance: 1,
                max_chunk_loading_distance: 4,
                unload_hysteresis: 0,
                creates_per_tick: 16,
            },
            creator_threads: 1,
            creator_queue: 64,
        }
    }

    fn world() -> World {
        World::new(settings(), Arc::new(FlatGenerator::new(vec![(2, stone())]))).unwrap()
    }

    /// Ticks until `done` or 5 s pass.
    fn tick_until(world: &mut World, mut done: impl FnMut(&World) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(world) && Instant::now() < deadline {
            world.tick();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[derive(Default)]
    struct Recorder {
        created: StdMutex<Vec<ChunkPos>>,
        loaded: StdMutex<Vec<ChunkPos>>,
        rebuilds: StdMutex<Vec<SectionKey>>,
    }

    impl WorldListener for Recorder {
        fn chunk_created(&self, _handler: &WorldChunkHandler, pos: ChunkPos) {
            self.created.lock().unwrap().push(pos);
        }

        fn chunk_loaded(&self, _handler: &WorldChunkHandler, pos: ChunkPos) {
            self.loaded.lock().unwrap().push(pos);
        }

        fn section_needs_rebuild(&self, _handler: &WorldChunkHandler, key: SectionKey) {
            self.rebuilds.lock().unwrap().push(key);
        }
    }

    #[test]
    fn test_invalid_height() {
        let mut s = settings();
        s.height = 20;
        let result = World::new(s, Arc::new(FlatGenerator::new(vec![])));
        assert!(matches!(result, Err(WorldError::Chunk(ChunkError::InvalidHeight(20)))));
    }

    #[test]
    fn test_viewer_drives_creation_and_loading() {
        let mut world = world();
        let recorder = Arc::new(Recorder::default());
        world.add_listener(recorder.clone());
        world.loader_mut().set_viewer(ViewerId(1), 0.0, 0.0);

        tick_until(&mut world, |w| w.handler().loaded_count() == 5);
        assert_eq!(world.handler().loaded_count(), 5);
        assert_eq!(recorder.loaded.lock().unwrap().len(), 5);
        assert_eq!(recorder.created.lock().unwrap().len(), 5);
        assert_eq!(world.get_block_state(0, 1, 0), Some(stone()));
        assert_eq!(world.get_block_state(0, 2, 0), None);
        assert!(world.world_time() > 0);
    }

    #[test]
    fn test_block_edit_applied_next_tick() {
        let mut world = world();
        let recorder = Arc::new(Recorder::default());
        world.add_listener(recorder.clone());
        world.loader_mut().set_viewer(ViewerId(1), 0.0, 0.0);
        tick_until(&mut world, |w| w.handler().loaded_count() == 5);

        world.set_block(5, 10, 5, Some(stone())).unwrap();
        world.set_block(6, 10, 5, Some(stone())).unwrap();
        assert_eq!(world.get_block_state(5, 10, 5), None);

        let report = world.tick();
        assert_eq!(report.block_changes, 2);
        assert_eq!(report.rebuilds, 1);
        assert_eq!(world.get_block_state(5, 10, 5), Some(stone()));
        assert_eq!(
            *recorder.rebuilds.lock().unwrap(),
            vec![SectionKey::new(ChunkPos::from_chunk_coords(0, 0), 0)]
        );
    }

    #[test]
    fn test_far_viewer_does_not_break_tick() {
        let mut world = world();
        world.loader_mut().set_viewer(ViewerId(1), 3.0e9, 0.0);
        world.loader_mut().set_viewer(ViewerId(2), f64::NAN, f64::NAN);
        let report = world.tick();
        assert_eq!(world.loader().viewer_count(), 1);
        assert!(report.requested > 0);
    }

    #[test]
    fn test_set_block_in_missing_chunk() {
        let world = world();
        assert!(matches!(
            world.set_block(1000, 1, 1000, Some(stone())),
            Err(ChunkError::UnknownChunk(_))
        ));
    }

    #[test]
    fn test_world_thread_ticks_and_pauses() {
        let mut thread = WorldThread::spawn(world(), Duration::from_millis(1)).unwrap();
        let start_time = thread.world().lock().unwrap().world_time();
        std::thread::sleep(Duration::from_millis(30));
        assert!(thread.world().lock().unwrap().world_time() > start_time);

        let ticket = thread.request_pause();
        assert!(ticket.wait_timeout(Duration::from_secs(5)));
        assert!(thread.is_paused());
        let paused_at = thread.world().lock().unwrap().world_time();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(thread.world().lock().unwrap().world_time(), paused_at);

        thread.resume();
        std::thread::sleep(Duration::from_millis(30));
        assert!(thread.world().lock().unwrap().world_time() > paused_at);

        thread.shutdown();
        assert!(!thread.is_running());
    }

    #[test]
    fn test_pause_ticket_after_shutdown() {
        let mut thread = WorldThread::spawn(world(), Duration::from_millis(1)).unwrap();
        thread.shutdown();
        let ticket = thread.request_pause();
        assert!(!ticket.wait_timeout(Duration::from_millis(50)));
    }
}
