//! Asynchronous chunk creation on a worker pool.
//!
//! Requests are produced by a [`ChunkSource`] on background threads. Finished
//! cells wait in a channel until the world thread calls
//! [`ChunkCreator::finish_ready`], which turns them into chunks, registers
//! them and fires creation listeners. Chunk data received from elsewhere
//! (e.g. a server) enters the same channel through
//! [`ChunkCreator::offer`].
//!
//! A failed source call is reported to the creation listeners on the next
//! `finish_ready`, so whoever waits for that chunk gets an answer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::block::BlockState;
use crate::changer::BlockChangeSender;
use crate::chunk::{Chunk, ChunkBlocks, ChunkError, ChunkPos};
use crate::handler::WorldChunkHandler;

#[derive(Debug, Error)]
pub enum ChunkSourceError {
    #[error("chunk source failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// Produces the initial cells of a chunk. Called from worker threads.
pub trait ChunkSource: Send + Sync {
    fn produce(&self, origin: ChunkPos, height: i32) -> Result<ChunkBlocks, ChunkSourceError>;
}

/// Notified on the world thread once per created chunk, before it loads.
pub trait ChunkCreationListener: Send + Sync {
    fn chunk_created(&self, chunk: &Chunk);

    /// The source failed for `origin`. The chunk is not pending anymore.
    fn creation_failed(&self, _origin: ChunkPos) {}
}

/// Stacks horizontal layers from y = 0 upward; air above.
#[derive(Clone, Debug)]
pub struct FlatGenerator {
    /// `(thickness, state)` pairs, bottom first.
    layers: Vec<(i32, BlockState)>,
}

impl FlatGenerator {
    pub fn new(layers: Vec<(i32, BlockState)>) -> Self {
        Self { layers }
    }

    /// First y above the top layer.
    pub fn surface_height(&self) -> i32 {
        self.layers.iter().map(|(thickness, _)| thickness).sum()
    }
}

impl ChunkSource for FlatGenerator {
    fn produce(&self, origin: ChunkPos, height: i32) -> Result<ChunkBlocks, ChunkSourceError> {
        let mut blocks = ChunkBlocks::new(origin, height)?;
        let mut y = 0;
        for &(thickness, state) in &self.layers {
            for _ in 0..thickness {
                if y >= height {
                    return Ok(blocks);
                }
                blocks.fill_layer(y, Some(state));
                y += 1;
            }
        }
        Ok(blocks)
    }
}

struct CreationTask {
    origin: ChunkPos,
    cancelled: Arc<AtomicBool>,
}

/// Runs chunk sources on a pool of named worker threads.
pub struct ChunkCreator {
    height: i32,
    task_sender: Option<Sender<CreationTask>>,
    result_sender: Sender<ChunkBlocks>,
    result_receiver: Receiver<ChunkBlocks>,
    failure_receiver: Receiver<ChunkPos>,
    /// Cancellation flag per requested chunk.
    pending: Arc<DashMap<ChunkPos, Arc<AtomicBool>>>,
    /// Demanded chunks the full queue refused; retried every `finish_ready`.
    deferred: DashSet<ChunkPos>,
    listeners: Vec<Arc<dyn ChunkCreationListener>>,
    workers: Vec<JoinHandle<()>>,
}

impl ChunkCreator {
    /// Spawns `threads` workers (at least one). At most `queue_capacity`
    /// requests wait for a worker at a time.
    pub fn new(
        source: Arc<dyn ChunkSource>,
        height: i32,
        threads: usize,
        queue_capacity: usize,
    ) -> std::io::Result<Self> {
        let (task_sender, task_receiver) = bounded::<CreationTask>(queue_capacity.max(1));
        let (result_sender, result_receiver) = unbounded::<ChunkBlocks>();
        let (failure_sender, failure_receiver) = unbounded::<ChunkPos>();
        let pending: Arc<DashMap<ChunkPos, Arc<AtomicBool>>> = Arc::new(DashMap::new());

        let mut workers = Vec::new();
        for i in 0..threads.max(1) {
            let receiver = task_receiver.clone();
            let sender = result_sender.clone();
            let failures = failure_sender.clone();
            let source = Arc::clone(&source);
            let pending = Arc::clone(&pending);

            let handle = std::thread::Builder::new()
                .name(format!("chunk-creator-{i}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        if task.cancelled.load(Ordering::Relaxed) {
                            continue;
                        }
                        match source.produce(task.origin, height) {
                            Ok(blocks) => {
                                if !task.cancelled.load(Ordering::Relaxed) {
                                    let _ = sender.send(blocks);
                                }
                            }
                            Err(e) => {
                                warn!(origin = ?task.origin, "Chunk creation failed: {e}");
                                let removed = pending.remove_if(&task.origin, |_, flag| {
                                    Arc::ptr_eq(flag, &task.cancelled)
                                });
                                if removed.is_some() {
                                    let _ = failures.send(task.origin);
                                }
                            }
                        }
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            height,
            task_sender: Some(task_sender),
            result_sender,
            result_receiver,
            failure_receiver,
            pending,
            deferred: DashSet::new(),
            listeners: Vec::new(),
            workers,
        })
    }

    /// Registers a listener. Listeners fire in registration order.
    pub fn add_listener(&mut self, listener: Arc<dyn ChunkCreationListener>) {
        self.listeners.push(listener);
    }

    /// Queues creation of `origin`. Returns `false` if it is already pending
    /// or the request queue is full.
    pub fn request(&self, origin: ChunkPos) -> bool {
        let Some(task_sender) = &self.task_sender else {
            return false;
        };
        if self.pending.contains_key(&origin) {
            return false;
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        self.pending.insert(origin, Arc::clone(&cancelled));
        if task_sender.try_send(CreationTask { origin, cancelled }).is_err() {
            self.pending.remove(&origin);
            return false;
        }
        true
    }

    /// Like [`request`](Self::request), but a request the full queue refuses
    /// is kept and retried on every [`finish_ready`](Self::finish_ready)
    /// until it is accepted. Returns `true` if it was queued right away.
    pub fn demand(&self, origin: ChunkPos) -> bool {
        if self.request(origin) {
            return true;
        }
        if !self.is_pending(origin) && self.deferred.insert(origin) {
            debug!(?origin, "Creator queue full, deferring request");
        }
        false
    }

    pub fn is_deferred(&self, origin: ChunkPos) -> bool {
        self.deferred.contains(&origin)
    }

    fn retry_deferred(&self, handler: &WorldChunkHandler) {
        if self.deferred.is_empty() {
            return;
        }
        let origins: Vec<ChunkPos> = self.deferred.iter().map(|o| *o).collect();
        for origin in origins {
            if handler.contains(origin) || self.is_pending(origin) || self.request(origin) {
                self.deferred.remove(&origin);
            } else {
                break;
            }
        }
    }

    /// Cancels a pending or deferred request. No-op if none exists.
    pub fn cancel(&self, origin: ChunkPos) {
        self.deferred.remove(&origin);
        if let Some((_, cancelled)) = self.pending.remove(&origin) {
            cancelled.store(true, Ordering::Relaxed);
        }
    }

    /// Hands over externally produced cells. Any pending generation of the
    /// same chunk is cancelled.
    pub fn offer(&self, blocks: ChunkBlocks) -> Result<(), ChunkError> {
        if blocks.height() != self.height {
            return Err(ChunkError::InvalidHeight(blocks.height()));
        }
        self.cancel(blocks.origin());
        self.result_sender
            .send(blocks)
            .map_err(|_| ChunkError::ChangerClosed)
    }

    pub fn is_pending(&self, origin: ChunkPos) -> bool {
        self.pending.contains_key(&origin)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Registers every finished chunk with `handler` and notifies listeners
    /// of created and failed chunks. Deferred requests are retried first.
    ///
    /// Returns the origins of the chunks created. Results for chunks that
    /// already exist are discarded.
    pub fn finish_ready(
        &self,
        handler: &mut WorldChunkHandler,
        changer: &BlockChangeSender,
    ) -> Vec<ChunkPos> {
        self.retry_deferred(handler);
        for origin in self.failure_receiver.try_iter() {
            for listener in &self.listeners {
                listener.creation_failed(origin);
            }
        }

        let mut created = Vec::new();
        for blocks in self.result_receiver.try_iter() {
            let origin = blocks.origin();
            self.pending.remove(&origin);
            if handler.contains(origin) {
                debug!(?origin, "Discarding duplicate chunk");
                continue;
            }
            let inserted =
                Chunk::from_blocks(blocks, changer.clone()).and_then(|c| handler.insert(c));
            if let Err(e) = inserted {
                warn!(?origin, "Could not register created chunk: {e}");
                continue;
            }
            if let Some(chunk) = handler.get(origin) {
                for listener in &self.listeners {
                    listener.chunk_created(chunk);
                }
            }
            created.push(origin);
        }
        created
    }

    /// Stops accepting requests and joins the workers.
    pub fn shutdown(&mut self) {
        self.task_sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ChunkCreator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::{Duration, Instant};

    use super::*;

    /// Calls `finish_ready` until `count` chunks were created or 5 s pass.
    pub fn finish_n(
        creator: &ChunkCreator,
        handler: &mut WorldChunkHandler,
        changer: &BlockChangeSender,
        count: usize,
    ) -> Vec<ChunkPos> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut created = Vec::new();
        while created.len() < count && Instant::now() < deadline {
            created.extend(creator.finish_ready(handler, changer));
            std::thread::sleep(Duration::from_millis(2));
        }
        created
    }
}
