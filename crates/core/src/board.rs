//! Live mirror of the remote canvas.
//!
//! A connection is built by opening the update feed first, buffering every
//! update while the full snapshot is fetched, then replaying the buffer on top
//! of the snapshot. After that each update is validated and applied as it
//! arrives. Any close or validation failure tears the mirror down; holders of
//! a [`Canvas`] must notice [`Canvas::is_open`] going false and re-initialize.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::BoardError;
use crate::model::{BoardState, Color, PaintboardUpdate, Pos};
use crate::ports::{CanvasSource, UpdateFeed};

const EVENT_CAPACITY: usize = 4096;

/// Connection phase of the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    /// No canvas; `initialize` will connect.
    Closed,
    /// A connect attempt is in flight.
    Connecting,
    /// The canvas is live.
    Open,
}

impl ReadyState {
    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
        }
    }
}

/// Notifications fanned out to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    /// A new generation is live.
    Open {
        /// Generation that opened.
        generation: u64,
    },
    /// An update that passed validation and has already been applied.
    Paint {
        /// Generation the update was applied to.
        generation: u64,
        /// The applied update.
        update: PaintboardUpdate,
    },
    /// A validation failure; the generation is closing.
    Error {
        /// Generation that is closing.
        generation: u64,
        /// Why the update was rejected.
        message: String,
    },
    /// The generation was torn down.
    Closed {
        /// Generation that closed.
        generation: u64,
    },
}

/// Grid of one connection generation. Cells are read and written
/// independently; there is no cross-cell consistency.
pub struct Canvas {
    generation: u64,
    width: usize,
    height: usize,
    cells: Box<[AtomicU8]>,
    open: AtomicBool,
}

impl Canvas {
    fn from_snapshot(state: BoardState, generation: u64) -> Self {
        Self {
            generation,
            width: state.width,
            height: state.height,
            cells: state.data.into_iter().map(AtomicU8::new).collect(),
            open: AtomicBool::new(true),
        }
    }

    /// Connection generation this grid belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Current color of a cell, `None` outside the grid.
    pub fn get(&self, pos: Pos) -> Option<Color> {
        if pos.x as usize >= self.width || pos.y as usize >= self.height {
            return None;
        }
        Some(self.cells[pos.index(self.height)].load(Ordering::Relaxed))
    }

    /// False once this generation has been torn down.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Copy of the column-major grid.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.cells.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    fn set(&self, pos: Pos, color: Color) {
        self.cells[pos.index(self.height)].store(color, Ordering::Relaxed);
    }
}

impl fmt::Debug for Canvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canvas")
            .field("generation", &self.generation)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

struct Inner {
    state: ReadyState,
    canvas: Option<Arc<Canvas>>,
    consumer: Option<JoinHandle<()>>,
    generation: u64,
    /// Finished connect attempts; lets queued callers share an outcome.
    attempts: u64,
    last_error: Option<BoardError>,
}

/// The canvas mirror.
pub struct Board {
    source: Arc<dyn CanvasSource>,
    width: usize,
    height: usize,
    palette_size: u8,
    open_timeout: Duration,
    inner: Mutex<Inner>,
    connect_lock: Arc<tokio::sync::Mutex<()>>,
    events: broadcast::Sender<BoardEvent>,
}

impl Board {
    /// Closed mirror of `source` sized by `config`.
    pub fn new(source: Arc<dyn CanvasSource>, config: &EngineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            source,
            width: config.width,
            height: config.height,
            palette_size: config.palette_size,
            open_timeout: config.board_open_timeout(),
            inner: Mutex::new(Inner {
                state: ReadyState::Closed,
                canvas: None,
                consumer: None,
                generation: 0,
                attempts: 0,
                last_error: None,
            }),
            connect_lock: Arc::new(tokio::sync::Mutex::new(())),
            events,
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current connection phase.
    pub fn ready_state(&self) -> ReadyState {
        self.inner().state
    }

    /// Configured dimensions, known before the first connect.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// The open canvas, or [`BoardError::NotOpen`].
    pub fn view(&self) -> Result<Arc<Canvas>, BoardError> {
        let inner = self.inner();
        inner
            .canvas
            .clone()
            .ok_or(BoardError::NotOpen(inner.state.as_str()))
    }

    /// Events of every later generation.
    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    /// Opens the mirror if needed. Callers arriving during a connect attempt
    /// share its outcome; once open this returns immediately.
    ///
    /// The attempt runs on its own task holding the connect lock; dropping the
    /// caller that started it does not cancel it.
    pub async fn initialize(self: &Arc<Self>) -> Result<Arc<Canvas>, BoardError> {
        let seen = {
            let inner = self.inner();
            if let Some(canvas) = &inner.canvas {
                return Ok(Arc::clone(canvas));
            }
            inner.attempts
        };

        let guard = Arc::clone(&self.connect_lock).lock_owned().await;
        {
            let inner = self.inner();
            if let Some(canvas) = &inner.canvas {
                return Ok(Arc::clone(canvas));
            }
            if inner.attempts != seen {
                if let Some(err) = &inner.last_error {
                    return Err(err.clone());
                }
            }
        }

        let board = Arc::clone(self);
        let attempt = tokio::spawn(async move {
            let _guard = guard;
            board.connect().await
        });
        match attempt.await {
            Ok(result) => result,
            Err(err) => {
                let err = BoardError::ConnectFailed(format!("connect task failed: {err}"));
                let mut inner = self.inner();
                if inner.canvas.is_none() {
                    inner.state = ReadyState::Closed;
                    inner.attempts += 1;
                    inner.last_error = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Tears down the current generation, if any.
    pub fn close(&self) {
        let generation = {
            let inner = self.inner();
            match &inner.canvas {
                Some(canvas) => canvas.generation(),
                None => return,
            }
        };
        self.teardown(generation, true);
    }

    async fn connect(self: &Arc<Self>) -> Result<Arc<Canvas>, BoardError> {
        let generation = {
            let mut inner = self.inner();
            inner.state = ReadyState::Connecting;
            inner.generation += 1;
            inner.generation
        };
        info!(generation, "board connecting");

        let built = match tokio::time::timeout(self.open_timeout, self.build()).await {
            Ok(built) => built,
            Err(_) => Err(BoardError::ConnectFailed(format!(
                "not open within {:?}",
                self.open_timeout
            ))),
        };

        let (feed, state) = match built {
            Ok(built) => built,
            Err(err) => {
                warn!(generation, error = %err, "board connect failed");
                let mut inner = self.inner();
                inner.state = ReadyState::Closed;
                inner.attempts += 1;
                inner.last_error = Some(err.clone());
                return Err(err);
            }
        };

        let canvas = Arc::new(Canvas::from_snapshot(state, generation));
        {
            let mut inner = self.inner();
            inner.state = ReadyState::Open;
            inner.canvas = Some(Arc::clone(&canvas));
            inner.attempts += 1;
            inner.last_error = None;
        }
        info!(generation, width = self.width, height = self.height, "board open");
        let _ = self.events.send(BoardEvent::Open { generation });

        let consumer = tokio::spawn(Arc::clone(self).consume(feed, Arc::clone(&canvas)));
        {
            let mut inner = self.inner();
            if inner.canvas.as_ref().map(|c| c.generation()) == Some(generation) {
                inner.consumer = Some(consumer);
            }
        }
        Ok(canvas)
    }

    async fn build(&self) -> Result<(UpdateFeed, BoardState), BoardError> {
        let mut feed = self
            .source
            .open_feed()
            .await
            .map_err(|e| BoardError::ConnectFailed(format!("{e:#}")))?;

        let mut buffered = Vec::new();
        let snapshot = self.source.fetch_snapshot();
        tokio::pin!(snapshot);
        let mut state = loop {
            tokio::select! {
                res = &mut snapshot => {
                    break res.map_err(|e| BoardError::ConnectFailed(format!("{e:#}")))?;
                }
                update = feed.recv() => match update {
                    Some(update) => buffered.push(update),
                    None => {
                        return Err(BoardError::ConnectFailed(
                            "update feed closed before the snapshot arrived".into(),
                        ))
                    }
                },
            }
        };
        while let Ok(update) = feed.try_recv() {
            buffered.push(update);
        }

        self.check_snapshot(&state)?;
        debug!(buffered = buffered.len(), "replaying buffered updates");
        for update in &buffered {
            let (pos, color) = self.validate(update)?;
            state.data[pos.index(state.height)] = color;
            trace!(pos = %pos, color, "pre");
        }
        Ok((feed, state))
    }

    fn check_snapshot(&self, state: &BoardState) -> Result<(), BoardError> {
        if state.width != self.width || state.height != self.height {
            return Err(BoardError::DimensionMismatch {
                width: self.width,
                height: self.height,
                got_width: state.width,
                got_height: state.height,
            });
        }
        if state.data.len() != state.width * state.height {
            return Err(BoardError::MalformedSnapshot(format!(
                "{} cells for a {}x{} grid",
                state.data.len(),
                state.width,
                state.height
            )));
        }
        if let Some(index) = state.data.iter().position(|&c| c >= self.palette_size) {
            return Err(BoardError::MalformedSnapshot(format!(
                "color {} at cell {index} is outside the palette",
                state.data[index]
            )));
        }
        Ok(())
    }

    fn validate(&self, update: &PaintboardUpdate) -> Result<(Pos, Color), BoardError> {
        let PaintboardUpdate { x, y, color, time } = *update;
        if !(0..self.width as i64).contains(&x) || !(0..self.height as i64).contains(&y) {
            return Err(BoardError::InvalidUpdate(format!("position ({x},{y}) outside the canvas")));
        }
        if !(0..self.palette_size as i64).contains(&color) {
            return Err(BoardError::InvalidUpdate(format!("color {color} outside the palette")));
        }
        if time < 0 {
            return Err(BoardError::InvalidUpdate(format!("negative time {time}")));
        }
        Ok((Pos::new(x as u16, y as u16), color as Color))
    }

    async fn consume(self: Arc<Self>, mut feed: UpdateFeed, canvas: Arc<Canvas>) {
        let generation = canvas.generation();
        while let Some(update) = feed.recv().await {
            if !canvas.is_open() {
                break;
            }
            match self.validate(&update) {
                Ok((pos, color)) => {
                    canvas.set(pos, color);
                    trace!(generation, pos = %pos, color, time = update.time, "update");
                    let _ = self.events.send(BoardEvent::Paint { generation, update });
                }
                Err(err) => {
                    warn!(generation, error = %err, "rejecting update feed");
                    let _ = self.events.send(BoardEvent::Error {
                        generation,
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }
        self.teardown(generation, false);
    }

    fn teardown(&self, generation: u64, abort_consumer: bool) {
        let consumer = {
            let mut inner = self.inner();
            match &inner.canvas {
                Some(canvas) if canvas.generation() == generation => {}
                _ => return,
            }
            if let Some(canvas) = inner.canvas.take() {
                canvas.open.store(false, Ordering::Release);
            }
            inner.state = ReadyState::Closed;
            inner.consumer.take()
        };
        if abort_consumer {
            if let Some(consumer) = consumer {
                consumer.abort();
            }
        }
        info!(generation, "board closed");
        let _ = self.events.send(BoardEvent::Closed { generation });
    }
}
