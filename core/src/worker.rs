//! Threaded runtime around a [`FilterEngine`].
//!
//! Frames and control inputs arrive on other threads (acquisition, stage driver). They are decoupled
//! from the filter by:
//!
//! - [`FrameQueue`]: bounded; when full the oldest undelivered frame is dropped and reported.
//! - [`ControlLedger`]: controls accumulate until the worker drains everything up to the frame it is
//!   about to process, so the displacement of dropped frames is not lost.
//! - [`EstimatePublisher`]: the latest estimate behind an `Arc`, so readers never see a partial update.
//!
//! A single [`EngineWorker`] thread owns the engine and runs one cycle per dequeued frame. Commands and
//! the stop flag are observed between cycles only.
use crate::engine::{CycleReport, FilterEngine};
use crate::features::Frame;
use crate::{ControlInput, Diagnostic, LocalizationError, PriorRegion, Result, StateEstimate, TrackingState};

use crossbeam_channel::{Receiver, Sender, TrySendError, select};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the worker waits for a frame before re-checking commands and the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bounded frame queue with a drop-oldest policy.
#[derive(Clone)]
pub struct FrameQueue {
    sender: Sender<Frame>,
    /// Producer-side handle used to evict the oldest frame.
    evict: Receiver<Frame>,
    dropped: Arc<AtomicU64>,
}

impl FrameQueue {
    /// Queue of `capacity` frames plus the consumer end.
    pub fn bounded(capacity: usize) -> (FrameQueue, Receiver<Frame>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let queue = FrameQueue {
            sender,
            evict: receiver.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, receiver)
    }

    /// Enqueue `frame`, evicting the oldest frame if the queue is full.
    ///
    /// A full queue is retried once before anything is evicted, since the consumer may free a slot in
    /// between. Returns a [`Diagnostic::FrameDropped`] when a frame was evicted.
    pub fn push(&self, frame: Frame) -> Option<Diagnostic> {
        let mut frame = frame;
        let mut dropped = None;
        let mut retried = false;
        loop {
            match self.sender.try_send(frame) {
                Ok(()) => return dropped,
                Err(TrySendError::Full(rejected)) => {
                    frame = rejected;
                    if !retried {
                        retried = true;
                        continue;
                    }
                    retried = false;
                    if let Ok(oldest) = self.evict.try_recv() {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        let diagnostic = Diagnostic::FrameDropped {
                            timestamp: oldest.timestamp,
                            dropped_total: total,
                        };
                        diagnostic.log();
                        dropped = Some(diagnostic);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::warn!("frame queue closed, frame discarded");
                    return dropped;
                }
            }
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Control inputs waiting to be applied.
#[derive(Clone, Default)]
pub struct ControlLedger {
    pending: Arc<Mutex<Vec<ControlInput>>>,
}

impl ControlLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, control: ControlInput) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(control);
    }

    /// Remove every control stamped at or before `timestamp` and return their sum, stamped `timestamp`.
    pub fn drain_until(&self, timestamp: f64) -> ControlInput {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut total = ControlInput::zero(timestamp);
        pending.retain(|control| {
            if control.timestamp <= timestamp {
                total.displacement += control.displacement;
                false
            } else {
                true
            }
        });
        total
    }

    pub fn clear(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-writer, many-reader holder of the latest estimate.
#[derive(Clone, Default)]
pub struct EstimatePublisher {
    latest: Arc<RwLock<Option<Arc<StateEstimate>>>>,
}

impl EstimatePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, estimate: StateEstimate) {
        let estimate = Arc::new(estimate);
        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        *latest = Some(estimate);
    }

    pub fn latest(&self) -> Option<Arc<StateEstimate>> {
        self.latest.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Requests handled by the worker between cycles.
#[derive(Clone, Debug)]
pub enum WorkerCommand {
    /// Reinitialize the engine (the way out of `Lost`).
    Reset {
        prior: PriorRegion,
        particle_count: usize,
    },
    /// Finish the current cycle and exit.
    Stop,
}

/// Handle to the engine thread.
pub struct EngineWorker {
    handle: Option<JoinHandle<FilterEngine>>,
    queue: FrameQueue,
    ledger: ControlLedger,
    publisher: EstimatePublisher,
    commands: Sender<WorkerCommand>,
    diagnostic_tx: Sender<Diagnostic>,
    diagnostics: Receiver<Diagnostic>,
    reports: Receiver<CycleReport>,
    running: Arc<AtomicBool>,
}

impl EngineWorker {
    /// Move `engine` onto a dedicated thread.
    ///
    /// The engine should already be initialized; an uninitialized or lost engine leaves frames in the
    /// queue until a [`WorkerCommand::Reset`] arrives.
    pub fn spawn(engine: FilterEngine) -> Result<Self> {
        let (queue, frames) = FrameQueue::bounded(engine.config().frame_queue_capacity);
        let ledger = ControlLedger::new();
        let publisher = EstimatePublisher::new();
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (diagnostic_tx, diagnostic_rx) = crossbeam_channel::unbounded();
        let (report_tx, report_rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let worker_loop = WorkerLoop {
            engine,
            frames,
            commands: command_rx,
            ledger: ledger.clone(),
            publisher: publisher.clone(),
            diagnostics: diagnostic_tx.clone(),
            reports: report_tx,
            running: running.clone(),
        };
        let handle = thread::Builder::new()
            .name("probe-locator-engine".into())
            .spawn(move || worker_loop.run())?;

        Ok(EngineWorker {
            handle: Some(handle),
            queue,
            ledger,
            publisher,
            commands: command_tx,
            diagnostic_tx,
            diagnostics: diagnostic_rx,
            reports: report_rx,
            running,
        })
    }

    /// Hand a frame to the engine. Returns the drop diagnostic when the queue was full.
    pub fn submit_frame(&self, frame: Frame) -> Option<Diagnostic> {
        let dropped = self.queue.push(frame);
        if let Some(diagnostic) = &dropped {
            self.diagnostic_tx.send(diagnostic.clone()).ok();
        }
        dropped
    }

    /// Record a stage displacement. It is applied with the first frame stamped at or after it.
    pub fn submit_control(&self, control: ControlInput) {
        self.ledger.push(control);
    }

    /// Ask the worker to reinitialize the engine.
    ///
    /// Controls submitted before the reset are discarded and the published estimate is cleared until
    /// the next cycle completes.
    pub fn reset(&self, prior: PriorRegion, particle_count: usize) -> Result<()> {
        self.commands
            .send(WorkerCommand::Reset {
                prior,
                particle_count,
            })
            .map_err(|_| LocalizationError::WorkerStopped)
    }

    /// Latest published estimate.
    pub fn latest(&self) -> Option<Arc<StateEstimate>> {
        self.publisher.latest()
    }

    pub fn publisher(&self) -> EstimatePublisher {
        self.publisher.clone()
    }

    /// Diagnostics from every cycle plus frame drops, in the order they occurred.
    pub fn diagnostics(&self) -> &Receiver<Diagnostic> {
        &self.diagnostics
    }

    /// One report per completed cycle. Unbounded; callers that do not need reports can ignore it.
    pub fn reports(&self) -> &Receiver<CycleReport> {
        &self.reports
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop after the current cycle, join the thread and return the engine (now `Uninitialized`).
    pub fn stop(mut self) -> Result<FilterEngine> {
        self.shutdown().ok_or(LocalizationError::WorkerStopped)
    }

    fn shutdown(&mut self) -> Option<FilterEngine> {
        self.running.store(false, Ordering::Release);
        self.commands.send(WorkerCommand::Stop).ok();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                log::error!("engine worker thread panicked");
                None
            }
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

struct WorkerLoop {
    engine: FilterEngine,
    frames: Receiver<Frame>,
    commands: Receiver<WorkerCommand>,
    ledger: ControlLedger,
    publisher: EstimatePublisher,
    diagnostics: Sender<Diagnostic>,
    reports: Sender<CycleReport>,
    running: Arc<AtomicBool>,
}

impl WorkerLoop {
    fn run(mut self) -> FilterEngine {
        log::info!("engine worker started in state {}", self.engine.state());
        let commands = self.commands.clone();
        let frames = self.frames.clone();
        while self.running.load(Ordering::Acquire) {
            let consuming = matches!(
                self.engine.state(),
                TrackingState::Tracking | TrackingState::Degenerate
            );
            let keep_going = if consuming {
                select! {
                    recv(commands) -> command => match command {
                        Ok(command) => self.apply(command),
                        Err(_) => false,
                    },
                    recv(frames) -> frame => match frame {
                        Ok(frame) => {
                            self.process(frame);
                            true
                        }
                        Err(_) => false,
                    },
                    default(POLL_INTERVAL) => true,
                }
            } else {
                // Frames stay queued (and age out) until a reset.
                select! {
                    recv(commands) -> command => match command {
                        Ok(command) => self.apply(command),
                        Err(_) => false,
                    },
                    default(POLL_INTERVAL) => true,
                }
            };
            if !keep_going {
                break;
            }
        }
        self.engine.stop();
        log::info!("engine worker stopped");
        self.engine
    }

    /// Returns false when the loop should exit.
    fn apply(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Reset {
                prior,
                particle_count,
            } => {
                match self.engine.reset(prior, particle_count) {
                    Ok(()) => {
                        // Displacements before the reset are relative to a pose that no longer exists.
                        self.ledger.clear();
                        self.publisher.clear();
                    }
                    Err(e) => log::error!("reset rejected: {e}"),
                }
                true
            }
            WorkerCommand::Stop => false,
        }
    }

    fn process(&mut self, frame: Frame) {
        let control = self.ledger.drain_until(frame.timestamp);
        match self.engine.step(&frame, control) {
            Ok(report) => {
                for diagnostic in &report.diagnostics {
                    self.diagnostics.send(diagnostic.clone()).ok();
                }
                self.publisher.publish(report.estimate.clone());
                self.reports.send(report).ok();
            }
            Err(e) => match Diagnostic::from_error(&e, frame.timestamp) {
                Some(diagnostic) => {
                    self.diagnostics.send(diagnostic).ok();
                }
                None => log::warn!("frame at t={:.3} not processed: {e}", frame.timestamp),
            },
        }
    }
}
