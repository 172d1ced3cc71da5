//! In-memory stand-ins for the remote canvas, paint endpoint and directories.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use paintboard_core::config::{EngineConfig, ThrottleConfig};
use paintboard_core::model::{
    BoardState, Color, CredentialRecord, CredentialStatus, EncodedImage, PaintOutcome,
    PaintTarget, PaintboardUpdate, Pos, TaskOptions, TaskRecord, Validation,
};
use paintboard_core::ports::{
    CanvasSource, CredentialDirectory, PaintApi, TaskChange, TaskDirectory, UpdateFeed,
};
use tokio::sync::{broadcast, mpsc, oneshot};

pub fn config(width: usize, height: usize) -> EngineConfig {
    EngineConfig {
        width,
        height,
        board_open_timeout_ms: 1_000,
        board_retry_ms: 20,
        throttle: ThrottleConfig {
            requests_per_second: 1_000.0,
            burst: 100,
            routes: 1,
        },
        ..EngineConfig::default()
    }
}

pub fn task_record(id: &str, owner: &str, left_top: (u16, u16), width: u32, data: &str) -> TaskRecord {
    TaskRecord {
        id: id.to_string(),
        owner: owner.to_string(),
        image: EncodedImage {
            width,
            height: data.len() as u32 / width,
            data: data.to_string(),
        },
        options: TaskOptions {
            left_top: Pos::new(left_top.0, left_top.1),
            weight: 1.0,
        },
        trusted: false,
    }
}

pub fn credential(token: &str, receiver: &str) -> CredentialRecord {
    CredentialRecord {
        token: token.to_string(),
        owner: None,
        receiver: receiver.to_string(),
        status: CredentialStatus::Waiting,
    }
}

pub fn update(x: i64, y: i64, color: i64) -> PaintboardUpdate {
    PaintboardUpdate {
        x,
        y,
        color,
        time: paintboard_core::now_ms(),
    }
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Remote canvas held in memory.
///
/// Feeds opened without a prepared receiver become the "live" feed that
/// [`FakeCanvas::paint`] publishes to.
pub struct FakeCanvas {
    state: Mutex<BoardState>,
    prepared: Mutex<VecDeque<UpdateFeed>>,
    live: Mutex<Option<mpsc::Sender<PaintboardUpdate>>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    snapshot_calls: AtomicUsize,
}

impl FakeCanvas {
    pub fn new(width: usize, height: usize, fill: Color) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BoardState {
                width,
                height,
                data: vec![fill; width * height],
            }),
            prepared: Mutex::new(VecDeque::new()),
            live: Mutex::new(None),
            gate: Mutex::new(None),
            snapshot_calls: AtomicUsize::new(0),
        })
    }

    /// The next `open_feed` returns a receiver driven by the returned sender.
    pub fn prepare_feed(&self) -> mpsc::Sender<PaintboardUpdate> {
        let (tx, rx) = mpsc::channel(1024);
        self.prepared.lock().unwrap().push_back(rx);
        tx
    }

    /// The next snapshot fetch waits until the returned sender fires or drops.
    pub fn gate_snapshot(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn cell(&self, x: usize, y: usize) -> Color {
        let state = self.state.lock().unwrap();
        state.data[x * state.height + y]
    }

    /// Changes the stored grid without telling any feed.
    pub fn set_cell(&self, x: usize, y: usize, color: Color) {
        let mut state = self.state.lock().unwrap();
        let height = state.height;
        state.data[x * height + y] = color;
    }

    /// An accepted write: the grid changes and the live feed reports it.
    pub async fn paint(&self, x: usize, y: usize, color: Color) {
        self.set_cell(x, y, color);
        let live = self.live.lock().unwrap().clone();
        if let Some(live) = live {
            let _ = live.send(update(x as i64, y as i64, color as i64)).await;
        }
    }

    /// Ends the live feed, as a dropped connection would.
    pub fn drop_live_feed(&self) {
        self.live.lock().unwrap().take();
    }
}

#[async_trait]
impl CanvasSource for FakeCanvas {
    async fn fetch_snapshot(&self) -> anyhow::Result<BoardState> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self.state.lock().unwrap().clone())
    }

    async fn open_feed(&self) -> anyhow::Result<UpdateFeed> {
        if let Some(rx) = self.prepared.lock().unwrap().pop_front() {
            return Ok(rx);
        }
        let (tx, rx) = mpsc::channel(1024);
        *self.live.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

/// Paint endpoint that records calls. Scripted outcomes are used first;
/// afterwards every paint succeeds and is applied to the bound canvas.
pub struct FakeApi {
    canvas: Arc<FakeCanvas>,
    scripted: Mutex<VecDeque<PaintOutcome>>,
    paints: Mutex<Vec<(String, PaintTarget)>>,
    validations: AtomicUsize,
}

impl FakeApi {
    pub fn new(canvas: Arc<FakeCanvas>) -> Arc<Self> {
        Arc::new(Self {
            canvas,
            scripted: Mutex::new(VecDeque::new()),
            paints: Mutex::new(Vec::new()),
            validations: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = PaintOutcome>) {
        self.scripted.lock().unwrap().extend(outcomes);
    }

    pub fn paints(&self) -> Vec<(String, PaintTarget)> {
        self.paints.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaintApi for FakeApi {
    async fn paint(&self, token: &str, target: PaintTarget, _route: usize) -> PaintOutcome {
        self.paints.lock().unwrap().push((token.to_string(), target));
        let scripted = self.scripted.lock().unwrap().pop_front();
        if let Some(outcome) = scripted {
            return outcome;
        }
        self.canvas
            .paint(target.pos.x as usize, target.pos.y as usize, target.color)
            .await;
        PaintOutcome::Success
    }

    async fn validate(&self, _token: &str, _route: usize) -> anyhow::Result<Validation> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(Validation::Valid)
    }
}

pub struct MemoryTasks {
    records: Mutex<BTreeMap<String, TaskRecord>>,
    changes: broadcast::Sender<TaskChange>,
}

impl MemoryTasks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(BTreeMap::new()),
            changes: broadcast::channel(64).0,
        })
    }

    pub fn insert(&self, record: TaskRecord) {
        let id = record.id.clone();
        let previous = self.records.lock().unwrap().insert(id.clone(), record);
        let change = match previous {
            Some(_) => TaskChange::Updated(id),
            None => TaskChange::Added(id),
        };
        let _ = self.changes.send(change);
    }

    pub fn remove(&self, id: &str) {
        self.records.lock().unwrap().remove(id);
        let _ = self.changes.send(TaskChange::Deleted(id.to_string()));
    }
}

#[async_trait]
impl TaskDirectory for MemoryTasks {
    async fn list(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<TaskRecord>> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskChange> {
        self.changes.subscribe()
    }
}

pub struct MemoryCredentials {
    records: Mutex<HashMap<String, CredentialRecord>>,
    added: broadcast::Sender<CredentialRecord>,
}

impl MemoryCredentials {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            added: broadcast::channel(64).0,
        })
    }

    pub fn add(&self, record: CredentialRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.token.clone(), record.clone());
        let _ = self.added.send(record);
    }

    pub fn status(&self, token: &str) -> Option<CredentialStatus> {
        self.records.lock().unwrap().get(token).map(|r| r.status)
    }
}

#[async_trait]
impl CredentialDirectory for MemoryCredentials {
    async fn list_usable(&self) -> anyhow::Result<Vec<CredentialRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status.is_usable())
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<CredentialRecord> {
        self.added.subscribe()
    }

    async fn set_status(&self, token: &str, status: CredentialStatus) -> anyhow::Result<()> {
        match self.records.lock().unwrap().get_mut(token) {
            Some(record) => {
                record.status = status;
                Ok(())
            }
            None => anyhow::bail!("unknown credential"),
        }
    }
}
