//! Decode pool actor
//!
//! The pool owns the queue, the generation counter and the set of active
//! workers. Everything reaches it as a message: commands from the protocol client
//! and the orchestrator, results from workers. Workers never touch pool state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::queue::{DecodeQueue, ReconcileOutcome};
use super::worker::{self, WorkerJob};
use super::{DecodePoolConfig, SegmentDecoder, SegmentTask};
use crate::cache::FrameStore;
use crate::resource::AssetCache;
use crate::session::PlaybackTracker;
use crate::types::{FrameRecord, VisualFrame};

/// Message from a worker to the pool.
#[derive(Debug)]
pub struct WorkerMessage {
    /// Generation the worker was spawned in
    pub generation: u64,
    pub task_id: u64,
    pub kind: WorkerMessageKind,
}

#[derive(Debug)]
pub enum WorkerMessageKind {
    /// One decoded frame, in increasing `global_index` order per task
    Frame { global_index: u32, frame: VisualFrame },
    /// All frames delivered
    Finished { frames: u32 },
    /// Fetch failed or timed out
    Skipped { reason: String },
    /// Decoder rejected the segment
    Failed { reason: String },
}

/// Observable pool state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub generation: u64,
    pub queued: usize,
    pub active: usize,
    pub last_decoded: Option<u32>,
    pub abort_after_frame: Option<u32>,
}

/// Collaborators shared with the rest of the session.
#[derive(Clone)]
pub struct PoolContext {
    pub assets: Arc<AssetCache>,
    pub decoder: Arc<dyn SegmentDecoder>,
    pub store: Arc<FrameStore>,
    pub tracker: Arc<PlaybackTracker>,
}

#[derive(Debug)]
enum PoolCommand {
    Enqueue(Vec<SegmentTask>),
    Reset,
    Shutdown,
}

/// Handle to a running decode pool.
#[derive(Debug, Clone)]
pub struct DecodePool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    snapshots: watch::Receiver<PoolSnapshot>,
    cancel: CancellationToken,
}

impl DecodePool {
    /// Spawn the pool actor.
    ///
    /// `clip_ceiling` bounds active workers plus clips with undisplayed frames.
    pub fn spawn(
        config: DecodePoolConfig,
        clip_ceiling: usize,
        context: PoolContext,
        cancel: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PoolSnapshot::default());

        let actor =
            PoolActor::new(config, clip_ceiling, context, cancel.clone(), worker_tx, snapshot_tx);
        tokio::spawn(actor.run(command_rx, worker_rx));

        Self { commands: command_tx, snapshots: snapshot_rx, cancel }
    }

    /// Queue decode work. The first batch after spawn or reset starts a new
    /// generation; later batches are reconciled against the queue.
    pub fn enqueue(&self, tasks: Vec<SegmentTask>) {
        if tasks.is_empty() {
            return;
        }
        if self.commands.send(PoolCommand::Enqueue(tasks)).is_err() {
            debug!("Decode pool stopped, dropping tasks");
        }
    }

    /// Abort all work and forget the queue.
    pub fn reset(&self) {
        let _ = self.commands.send(PoolCommand::Reset);
    }

    /// Stop the actor and every worker. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.commands.send(PoolCommand::Shutdown);
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Watch pool state changes.
    pub fn snapshots(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[derive(Debug)]
struct ActiveTask {
    body_id: u32,
    global_start: u32,
    global_end: u32,
    /// Last global frame this task may still deliver
    limit: Option<u32>,
    token: CancellationToken,
}

struct PoolActor {
    config: DecodePoolConfig,
    clip_ceiling: usize,
    context: PoolContext,
    cancel: CancellationToken,
    queue: DecodeQueue,
    generation: u64,
    generation_token: CancellationToken,
    started: bool,
    active: HashMap<u64, ActiveTask>,
    next_task_id: u64,
    last_decoded: Option<u32>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
}

impl PoolActor {
    fn new(
        config: DecodePoolConfig,
        clip_ceiling: usize,
        context: PoolContext,
        cancel: CancellationToken,
        worker_tx: mpsc::UnboundedSender<WorkerMessage>,
        snapshot_tx: watch::Sender<PoolSnapshot>,
    ) -> Self {
        let generation_token = cancel.child_token();
        Self {
            config,
            clip_ceiling: clip_ceiling.max(1),
            context,
            cancel,
            queue: DecodeQueue::new(),
            generation: 0,
            generation_token,
            started: false,
            active: HashMap::new(),
            next_task_id: 0,
            last_decoded: None,
            worker_tx,
            snapshot_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ) {
        info!(
            max_parallel = self.config.max_parallel,
            clip_ceiling = self.clip_ceiling,
            "Decode pool started"
        );
        let mut pump = tokio::time::interval(self.config.pump_interval());
        pump.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Decode pool cancelled");
                    break;
                }
                command = commands.recv() => match command {
                    Some(PoolCommand::Enqueue(tasks)) => self.enqueue(tasks),
                    Some(PoolCommand::Reset) => self.reset(),
                    Some(PoolCommand::Shutdown) | None => break,
                },
                Some(message) = worker_rx.recv() => self.on_worker_message(message),
                _ = pump.tick() => {}
            }

            self.dispatch();
            self.publish();
        }

        self.generation_token.cancel();
        self.active.clear();
        self.queue.clear();
        self.publish();
        info!(generation = self.generation, "Decode pool stopped");
    }

    fn enqueue(&mut self, tasks: Vec<SegmentTask>) {
        if !self.started {
            self.new_generation();
            self.queue.replace(tasks);
            self.started = true;
            return;
        }

        match self.queue.reconcile(tasks, self.last_decoded) {
            ReconcileOutcome::Appended => {}
            ReconcileOutcome::Truncated { dropped } => {
                debug!(dropped, "Queue truncated at overlap");
            }
            ReconcileOutcome::Replaced { new_start } => {
                self.new_generation();
                let removed = self.context.store.truncate_visual_from(new_start);
                debug!(new_start, removed, "Seek replaced the queue");
            }
            ReconcileOutcome::Deferred { abort_after_frame } => {
                self.bound_active(abort_after_frame);
                self.settle_if_drained();
                let removed =
                    self.context.store.truncate_visual_from(abort_after_frame.saturating_add(1));
                debug!(abort_after_frame, removed, "Seek deferred until in-flight work drains");
            }
        }
    }

    fn reset(&mut self) {
        self.new_generation();
        self.queue.clear();
        self.started = false;
        self.context.store.visual().clear_all();
        debug!(generation = self.generation, "Decode pool reset");
    }

    fn new_generation(&mut self) {
        self.generation += 1;
        self.generation_token.cancel();
        self.generation_token = self.cancel.child_token();
        self.active.clear();
        self.last_decoded = None;
        self.context.tracker.reset_decoded();
        debug!(generation = self.generation, "New decode generation");
    }

    /// Stop in-flight work from producing anything after `last`.
    fn bound_active(&mut self, last: u32) {
        self.active.retain(|task_id, task| {
            if task.global_start > last {
                task.token.cancel();
                debug!(task = task_id, "Cancelled task past the seek point");
                return false;
            }
            if task.global_end > last.saturating_add(1) {
                task.limit = Some(task.limit.map_or(last, |limit| limit.min(last)));
            }
            true
        });
    }

    /// Cancel active work belonging to an older animation unit.
    fn supersede(&mut self, incoming: &SegmentTask) {
        self.active.retain(|task_id, task| {
            if task.body_id >= incoming.body_id {
                return true;
            }
            task.token.cancel();
            debug!(
                task = task_id,
                body_id = task.body_id,
                newer = incoming.body_id,
                "Cancelled superseded task"
            );
            false
        });
        self.settle_if_drained();
    }

    fn in_flight_clips(&self) -> usize {
        self.active.len() + self.context.store.buffered_clips()
    }

    fn dispatch(&mut self) {
        while self.active.len() < self.config.max_parallel.max(1) {
            if self.queue.is_empty() {
                break;
            }
            let in_flight = self.in_flight_clips();
            if in_flight >= self.clip_ceiling {
                trace!(in_flight, ceiling = self.clip_ceiling, "Clip ceiling reached");
                break;
            }
            let Some(task) = self.queue.pop_next() else { break };

            self.supersede(&task);

            let task_id = self.next_task_id;
            self.next_task_id += 1;
            let token = self.generation_token.child_token();
            self.active.insert(
                task_id,
                ActiveTask {
                    body_id: task.body_id,
                    global_start: task.global_start,
                    global_end: task.global_end,
                    limit: None,
                    token: token.clone(),
                },
            );

            let depth = self.context.assets.prefetch_depth(self.config.prefetch_ahead);
            for upcoming in self.queue.peek_ahead(depth) {
                self.context.assets.prefetch(&upcoming.name);
            }

            debug!(
                generation = self.generation,
                task = task_id,
                body_id = task.body_id,
                clip = %task.name,
                start = task.global_start,
                end = task.global_end,
                "Dispatching segment"
            );

            tokio::spawn(worker::run(WorkerJob {
                generation: self.generation,
                task_id,
                task,
                assets: Arc::clone(&self.context.assets),
                decoder: Arc::clone(&self.context.decoder),
                fetch_timeout: self.config.fetch_timeout(),
                token,
                tx: self.worker_tx.clone(),
            }));
        }
    }

    fn on_worker_message(&mut self, message: WorkerMessage) {
        if message.generation != self.generation {
            trace!(
                stale = message.generation,
                current = self.generation,
                "Discarding stale worker message"
            );
            return;
        }
        let task_id = message.task_id;

        match message.kind {
            WorkerMessageKind::Frame { global_index, frame } => {
                let Some(task) = self.active.get(&task_id) else {
                    trace!(task = task_id, "Discarding frame from cancelled task");
                    return;
                };
                let limit = task.limit;
                if limit.is_some_and(|limit| global_index > limit) {
                    self.finish_early(task_id);
                    return;
                }

                let outcome =
                    self.context.store.insert_visual(FrameRecord::single(global_index, frame));
                if outcome.rejected > 0 {
                    trace!(task = task_id, global_index, "Frame superseded by a newer unit");
                    return;
                }

                self.last_decoded =
                    Some(self.last_decoded.map_or(global_index, |last| last.max(global_index)));
                self.context.tracker.record_decoded(global_index);
                trace!(task = task_id, global_index, "Frame decoded");

                if limit == Some(global_index) {
                    self.finish_early(task_id);
                }
                if let Some(last) = self.last_decoded {
                    self.queue.settle_abort(last);
                }
            }
            WorkerMessageKind::Finished { frames } => {
                if self.active.remove(&task_id).is_some() {
                    debug!(task = task_id, frames, "Segment decoded");
                }
                self.settle_if_drained();
            }
            WorkerMessageKind::Skipped { reason } => {
                if self.active.remove(&task_id).is_some() {
                    warn!(task = task_id, %reason, "Segment skipped");
                }
                self.settle_if_drained();
            }
            WorkerMessageKind::Failed { reason } => {
                if self.active.remove(&task_id).is_some() {
                    warn!(task = task_id, %reason, "Segment failed");
                }
                self.settle_if_drained();
            }
        }
    }

    fn finish_early(&mut self, task_id: u64) {
        if let Some(task) = self.active.remove(&task_id) {
            task.token.cancel();
            debug!(task = task_id, limit = ?task.limit, "Task reached its cut");
        }
        self.settle_if_drained();
    }

    fn settle_if_drained(&mut self) {
        if self.active.values().all(|task| task.limit.is_none()) {
            self.queue.clear_abort();
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            generation: self.generation,
            queued: self.queue.len(),
            active: self.active.len(),
            last_decoded: self.last_decoded,
            abort_after_frame: self.queue.abort_after_frame(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}
