//! Per-task tracking of cells that still differ from the target image.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::board::{Board, BoardEvent, Canvas};
use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::image::TargetImage;
use crate::model::{Color, PaintboardUpdate, Pos, TaskRecord, TRANSPARENT};
use crate::pending_set::RandomizedPendingSet;

struct TrackerState {
    pending: RandomizedPendingSet<u32>,
    /// Canvas generation `pending` was computed against.
    canvas: Option<Arc<Canvas>>,
}

/// Tracks one task's unresolved cells against the live board.
///
/// The pending set is advisory: entries are re-checked against the canvas
/// when popped, and live updates inside the placement re-add cells that
/// another painter has disturbed.
pub struct TaskTracker {
    record: TaskRecord,
    image: TargetImage,
    state: Mutex<TrackerState>,
    working: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("id", &self.record.id)
            .field("owner", &self.record.owner)
            .field("working", &self.is_working())
            .finish_non_exhaustive()
    }
}

impl TaskTracker {
    /// Validates and decodes a task. Tracking starts with [`Self::spawn`].
    pub fn new(record: TaskRecord, config: &EngineConfig) -> Result<Arc<Self>, TaskError> {
        let image = TargetImage::decode(&record.image, config.palette_size)?;
        let Pos { x: left, y: top } = record.options.left_top;
        if left as usize + image.width as usize > config.width
            || top as usize + image.height as usize > config.height
        {
            return Err(TaskError::OutOfBounds {
                left: left as u32,
                top: top as u32,
                width: image.width,
                height: image.height,
                canvas_width: config.width,
                canvas_height: config.height,
            });
        }
        let weight = record.options.weight;
        if !weight.is_finite() || weight < 0.0 {
            return Err(TaskError::InvalidWeight(weight));
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            record,
            image,
            state: Mutex::new(TrackerState {
                pending: RandomizedPendingSet::new(),
                canvas: None,
            }),
            working: AtomicBool::new(false),
            shutdown,
        }))
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Task id.
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Owning account.
    pub fn owner(&self) -> &str {
        &self.record.owner
    }

    /// Whether other owners' credentials may paint it.
    pub fn trusted(&self) -> bool {
        self.record.trusted
    }

    /// Record the tracker was built from.
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    /// Configured weight while anything is pending, else 0.
    pub fn weight(&self) -> f64 {
        if self.pending_len() == 0 {
            0.0
        } else {
            self.record.options.weight
        }
    }

    /// Cells known to differ from the target.
    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    /// True while attached to an open board generation.
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Whether `pos` lies inside the placed image.
    pub fn contains(&self, pos: Pos) -> bool {
        self.local(pos).is_some()
    }

    fn local(&self, pos: Pos) -> Option<(u32, u32)> {
        let Pos { x: left, y: top } = self.record.options.left_top;
        let dx = (pos.x as u32).checked_sub(left as u32)?;
        let dy = (pos.y as u32).checked_sub(top as u32)?;
        (dx < self.image.width && dy < self.image.height).then_some((dx, dy))
    }

    /// Wanted color at `pos`; `None` outside the placement or where transparent.
    pub fn target(&self, pos: Pos) -> Option<Color> {
        let (dx, dy) = self.local(pos)?;
        self.image.get(dx, dy).filter(|&c| c != TRANSPARENT)
    }

    fn is_done(&self, canvas: &Canvas, pos: Pos) -> bool {
        match self.target(pos) {
            None => true,
            Some(target) => canvas.get(pos) == Some(target),
        }
    }

    /// Pops random pending cells until one is still unresolved and accepted
    /// by `accept`. Unresolved cells (including the returned one) stay pending;
    /// resolved ones are dropped.
    pub fn find(&self, mut accept: impl FnMut(Pos) -> bool) -> Option<Pos> {
        let mut state = self.state();
        let canvas = state.canvas.clone().filter(|c| c.is_open())?;
        let mut kept = Vec::new();
        let mut found = None;
        while let Ok(packed) = state.pending.pop_random() {
            let pos = Pos::unpack(packed);
            if self.is_done(&canvas, pos) {
                continue;
            }
            kept.push(packed);
            if accept(pos) {
                found = Some(pos);
                break;
            }
        }
        for packed in kept {
            state.pending.insert(packed);
        }
        found
    }

    /// Recomputes the pending set from scratch against `canvas`.
    pub fn attach(&self, canvas: &Arc<Canvas>) {
        let Pos { x: left, y: top } = self.record.options.left_top;
        let mut state = self.state();
        state.pending.clear();
        for dx in 0..self.image.width {
            for dy in 0..self.image.height {
                let Some(target) = self.image.get(dx, dy).filter(|&c| c != TRANSPARENT) else {
                    continue;
                };
                let pos = Pos::new(left + dx as u16, top + dy as u16);
                if canvas.get(pos) != Some(target) {
                    state.pending.insert(pos.pack());
                }
            }
        }
        state.canvas = Some(Arc::clone(canvas));
        self.working.store(true, Ordering::Release);
    }

    /// Re-adds a cell touched by a live update if it is now unresolved.
    pub fn observe(&self, generation: u64, update: &PaintboardUpdate) {
        let (Ok(x), Ok(y)) = (u16::try_from(update.x), u16::try_from(update.y)) else {
            return;
        };
        let pos = Pos::new(x, y);
        if !self.contains(pos) {
            return;
        }
        let mut state = self.state();
        let Some(canvas) = state.canvas.clone() else {
            return;
        };
        if canvas.generation() != generation {
            return;
        }
        if !self.is_done(&canvas, pos) {
            state.pending.insert(pos.pack());
        }
    }

    /// Drops the pending set; it is recomputed on the next attach.
    pub fn detach(&self) {
        self.working.store(false, Ordering::Release);
        let mut state = self.state();
        state.pending.clear();
        state.canvas = None;
    }

    /// Stops the tracking loop.
    pub fn destroy(&self) {
        self.shutdown.send_replace(true);
    }

    /// Starts following `board`: attach on every (re)connect, observe live
    /// updates while open, pause while closed.
    pub fn spawn(self: &Arc<Self>, board: Arc<Board>, retry: Duration) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(board, retry))
    }

    async fn run(self: Arc<Self>, board: Arc<Board>, retry: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut events = board.subscribe();
        while !*shutdown.borrow() {
            let canvas = tokio::select! {
                _ = shutdown.changed() => break,
                res = board.initialize() => match res {
                    Ok(canvas) => canvas,
                    Err(err) => {
                        debug!(task = %self.id(), error = %err, "board unavailable");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(retry) => continue,
                        }
                    }
                },
            };

            self.attach(&canvas);
            info!(task = %self.id(), pending = self.pending_len(), generation = canvas.generation(), "task initialized");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(BoardEvent::Paint { generation, update }) => self.observe(generation, &update),
                        Ok(BoardEvent::Closed { generation }) if generation == canvas.generation() => break,
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            if !canvas.is_open() {
                                break;
                            }
                            warn!(task = %self.id(), missed, "lagged behind board updates; rescanning");
                            self.attach(&canvas);
                        }
                        Err(RecvError::Closed) => {
                            self.detach();
                            return;
                        }
                    },
                }
            }
            self.detach();
        }
        self.detach();
        debug!(task = %self.id(), "task tracker stopped");
    }
}
