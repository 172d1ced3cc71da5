//! Weighted, fair assignment of pending cells to write credentials.
//!
//! Each task's pull is its weight scaled by how many live credentials its
//! owner contributes, normalized across the owner's own tasks so that adding
//! tasks does not buy an owner a larger share. Cells handed out are reserved
//! until shortly after the paint completes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::board::{Board, ReadyState};
use crate::config::EngineConfig;
use crate::credential::{CredentialLoop, LoopHandle};
use crate::model::{token_tail, CredentialRecord, CredentialStatus, PaintTarget, Pos, TaskRecord};
use crate::ports::{CredentialDirectory, PaintApi, TaskChange, TaskDirectory};
use crate::task::TaskTracker;
use crate::throttle::RequestThrottle;

/// One bit per canvas cell marking an in-flight write.
pub struct ReservationTable {
    bits: Box<[AtomicU64]>,
    width: usize,
    height: usize,
}

impl ReservationTable {
    /// Table with every cell of a `width` x `height` canvas free.
    pub fn new(width: usize, height: usize) -> Arc<Self> {
        let words = (width * height).div_ceil(64);
        Arc::new(Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            width,
            height,
        })
    }

    fn slot(&self, pos: Pos) -> Option<(usize, u64)> {
        if pos.x as usize >= self.width || pos.y as usize >= self.height {
            return None;
        }
        let index = pos.index(self.height);
        Some((index / 64, 1 << (index % 64)))
    }

    /// Cells outside the canvas read as reserved.
    pub fn is_reserved(&self, pos: Pos) -> bool {
        match self.slot(pos) {
            Some((word, mask)) => self.bits[word].load(Ordering::Acquire) & mask != 0,
            None => true,
        }
    }

    /// Claims `pos` unless someone already holds it.
    pub fn try_reserve(self: &Arc<Self>, pos: Pos) -> Option<Reservation> {
        let (word, mask) = self.slot(pos)?;
        let previous = self.bits[word].fetch_or(mask, Ordering::AcqRel);
        (previous & mask == 0).then(|| Reservation {
            table: Arc::clone(self),
            pos,
            word,
            mask,
        })
    }
}

/// Held claim on a cell. Dropping it clears the bit.
#[must_use = "dropping a reservation releases the cell immediately"]
pub struct Reservation {
    table: Arc<ReservationTable>,
    pos: Pos,
    word: usize,
    mask: u64,
}

impl Reservation {
    /// Reserved cell.
    pub fn pos(&self) -> Pos {
        self.pos
    }

    /// Keeps the cell reserved for `delay` more, so the live feed can catch
    /// up with the write before anyone else picks the cell.
    pub fn release_after(self, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            drop(self);
        });
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.table.bits[self.word].fetch_and(!self.mask, Ordering::AcqRel);
    }
}

/// A cell handed to one credential.
pub struct Assignment {
    /// Cell and color to paint.
    pub target: PaintTarget,
    /// Task the cell was taken from.
    pub task_id: String,
    /// Claim on the cell; release it once the paint is done.
    pub reservation: Reservation,
}

/// Picks an index with probability proportional to its weight, given a
/// uniform `draw` in `[0, 1)`. `None` when the total weight is zero.
pub fn pick_weighted(weights: &[f64], draw: f64) -> Option<usize> {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= 0.0 {
        return None;
    }
    let mut remaining = draw * total;
    for (index, &weight) in weights.iter().enumerate() {
        if weight <= 0.0 {
            continue;
        }
        remaining -= weight;
        if remaining < 0.0 {
            return Some(index);
        }
    }
    weights.iter().rposition(|w| *w > 0.0)
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Arc<TaskTracker>>,
    by_owner: HashMap<String, HashMap<String, Arc<TaskTracker>>>,
    /// Live credential loops per receiver.
    credits: HashMap<String, usize>,
    loops: HashMap<String, Arc<LoopHandle>>,
    /// Tokens whose loop ended as invalid; listings do not restart them.
    retired: HashSet<String>,
}

/// Monitor view of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    /// Task id.
    pub id: String,
    /// Owning account.
    pub owner: String,
    /// Whether other owners' credentials may paint it.
    pub trusted: bool,
    /// Configured weight.
    pub weight: f64,
    /// Cells still differing from the target.
    pub pending: usize,
    /// Whether the tracker is attached to an open board.
    pub working: bool,
}

/// Monitor view of one credential loop.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    /// Last characters of the token.
    pub token: String,
    /// Account its paints are attributed to.
    pub receiver: String,
    /// Last published status.
    pub status: CredentialStatus,
}

/// Snapshot served by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Board connection phase.
    pub board: ReadyState,
    /// Open generation, if any.
    pub generation: Option<u64>,
    /// Tracked tasks.
    pub tasks: Vec<TaskSummary>,
    /// Running loops.
    pub credentials: Vec<CredentialSummary>,
    /// Live loops per receiver.
    pub credits: BTreeMap<String, usize>,
    /// Request slots free right now.
    pub throttle_available: usize,
}

/// Owns the active task trackers and credential loops.
pub struct Scheduler {
    config: EngineConfig,
    board: Arc<Board>,
    throttle: Arc<RequestThrottle>,
    api: Arc<dyn PaintApi>,
    tasks_dir: Arc<dyn TaskDirectory>,
    credentials_dir: Arc<dyn CredentialDirectory>,
    registry: RwLock<Registry>,
    reservations: Arc<ReservationTable>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    /// Wires the scheduler. Nothing runs until [`Scheduler::run`].
    pub fn new(
        config: EngineConfig,
        board: Arc<Board>,
        throttle: Arc<RequestThrottle>,
        api: Arc<dyn PaintApi>,
        tasks_dir: Arc<dyn TaskDirectory>,
        credentials_dir: Arc<dyn CredentialDirectory>,
    ) -> Arc<Self> {
        let (width, height) = board.dimensions();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            board,
            throttle,
            api,
            tasks_dir,
            credentials_dir,
            registry: RwLock::new(Registry::default()),
            reservations: ReservationTable::new(width, height),
            shutdown,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared canvas mirror.
    pub fn board(&self) -> &Arc<Board> {
        &self.board
    }

    /// Shared request throttle.
    pub fn throttle(&self) -> &Arc<RequestThrottle> {
        &self.throttle
    }

    /// Paint endpoint used by the loops.
    pub fn api(&self) -> &Arc<dyn PaintApi> {
        &self.api
    }

    /// Directory receiving status write-backs.
    pub fn credentials_dir(&self) -> &Arc<dyn CredentialDirectory> {
        &self.credentials_dir
    }

    /// Next cell for a credential attributed to `receiver`, already reserved.
    ///
    /// The receiver's own tasks are tried first; otherwise any task that is
    /// trusted (or owned by the receiver) is eligible.
    pub fn select_target(&self, receiver: &str) -> Option<Assignment> {
        let registry = self.read();
        if let Some(own) = registry.by_owner.get(receiver) {
            if let Some(found) = self.pick(own.values(), receiver, &registry.credits) {
                return Some(found);
            }
        }
        self.pick(registry.tasks.values(), receiver, &registry.credits)
    }

    fn pick<'a>(
        &self,
        tasks: impl Iterator<Item = &'a Arc<TaskTracker>>,
        receiver: &str,
        credits: &HashMap<String, usize>,
    ) -> Option<Assignment> {
        let free = |pos: Pos| !self.reservations.is_reserved(pos);

        let mut candidates: Vec<(&Arc<TaskTracker>, f64)> = Vec::new();
        let mut owner_weights: HashMap<&str, f64> = HashMap::new();
        for task in tasks {
            if !(task.trusted() || task.owner() == receiver) || !task.is_working() {
                continue;
            }
            let weight = task.weight();
            if weight <= 0.0 || task.find(free).is_none() {
                continue;
            }
            let credit = credits.get(task.owner()).copied().unwrap_or(0) as f64;
            let raw = weight * credit;
            if raw <= 0.0 {
                continue;
            }
            *owner_weights.entry(task.owner()).or_default() += weight;
            candidates.push((task, raw));
        }

        let weights: Vec<f64> = candidates
            .iter()
            .map(|(task, raw)| raw / owner_weights[task.owner()])
            .collect();
        let index = pick_weighted(&weights, rand::rng().random::<f64>())?;
        let task = candidates[index].0;

        let mut reservation = None;
        let pos = task.find(|pos| match self.reservations.try_reserve(pos) {
            Some(claim) => {
                reservation = Some(claim);
                true
            }
            None => false,
        });
        let (Some(pos), Some(reservation)) = (pos, reservation) else {
            debug!(task = %task.id(), "picked task has no free cell left");
            return None;
        };
        let Some(color) = task.target(pos) else {
            warn!(task = %task.id(), pos = %pos, "picked cell has no target color");
            return None;
        };
        Some(Assignment {
            target: PaintTarget { pos, color },
            task_id: task.id().to_string(),
            reservation,
        })
    }

    /// Claims a cell directly, outside of selection.
    pub fn reserve(&self, pos: Pos) -> Option<Reservation> {
        self.reservations.try_reserve(pos)
    }

    /// Whether `pos` is currently claimed.
    pub fn is_reserved(&self, pos: Pos) -> bool {
        self.reservations.is_reserved(pos)
    }

    /// Number of live credential loops attributed to `owner`.
    pub fn credit_weight(&self, owner: &str) -> usize {
        self.read().credits.get(owner).copied().unwrap_or(0)
    }

    /// Tracker of a task, if tracked.
    pub fn task(&self, id: &str) -> Option<Arc<TaskTracker>> {
        self.read().tasks.get(id).cloned()
    }

    /// Adds a task, or replaces it if its record changed.
    pub fn upsert_task(&self, record: TaskRecord) {
        if let Some(existing) = self.task(&record.id) {
            if existing.record() == &record {
                return;
            }
            self.delete_task(&record.id);
        }
        let id = record.id.clone();
        let tracker = match TaskTracker::new(record, &self.config) {
            Ok(tracker) => tracker,
            Err(err) => {
                warn!(task = %id, error = %err, "rejecting task");
                return;
            }
        };
        tracker.spawn(Arc::clone(&self.board), self.config.board_retry());
        info!(task = %id, owner = %tracker.owner(), weight = tracker.record().options.weight, "task added");

        let mut registry = self.write();
        registry
            .by_owner
            .entry(tracker.owner().to_string())
            .or_default()
            .insert(id.clone(), Arc::clone(&tracker));
        if let Some(replaced) = registry.tasks.insert(id, tracker) {
            replaced.destroy();
        }
    }

    /// Stops tracking a task. Unknown ids are ignored.
    pub fn delete_task(&self, id: &str) {
        let mut registry = self.write();
        let Some(task) = registry.tasks.remove(id) else {
            return;
        };
        if let Some(owned) = registry.by_owner.get_mut(task.owner()) {
            owned.remove(id);
            if owned.is_empty() {
                registry.by_owner.remove(task.owner());
            }
        }
        drop(registry);
        task.destroy();
        info!(task = %id, "task deleted");
    }

    /// Starts a loop for `record` unless one is running or it is unusable.
    pub fn start_credential(self: &Arc<Self>, record: CredentialRecord) -> bool {
        if !record.status.is_usable() {
            return false;
        }
        let handle = {
            let mut registry = self.write();
            if registry.loops.contains_key(&record.token) {
                return false;
            }
            let handle = Arc::new(LoopHandle::new(
                record.token.clone(),
                record.receiver.clone(),
                record.status,
            ));
            *registry.credits.entry(record.receiver.clone()).or_default() += 1;
            registry.loops.insert(record.token.clone(), Arc::clone(&handle));
            handle
        };
        info!(token = token_tail(&record.token), receiver = %record.receiver, "credential loop started");
        CredentialLoop::new(Arc::clone(self), handle).spawn();
        true
    }

    /// Called once when a credential loop exits.
    pub(crate) fn credential_destroyed(&self, token: &str, status: CredentialStatus) {
        let mut registry = self.write();
        let Some(handle) = registry.loops.remove(token) else {
            return;
        };
        if let Some(credit) = registry.credits.get_mut(handle.receiver()) {
            *credit = credit.saturating_sub(1);
            if *credit == 0 {
                registry.credits.remove(handle.receiver());
            }
        }
        if status == CredentialStatus::Invalid {
            registry.retired.insert(token.to_string());
        }
        drop(registry);
        info!(token = token_tail(token), status = status.as_str(), "credential loop exited");
    }

    /// Full listing of tasks and credentials; adds, replaces and removes to match.
    pub async fn reconcile(self: &Arc<Self>) -> anyhow::Result<()> {
        let records = self.tasks_dir.list().await?;
        let listed: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        for record in records {
            self.upsert_task(record);
        }
        let stale: Vec<String> = self
            .read()
            .tasks
            .keys()
            .filter(|id| !listed.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            self.delete_task(&id);
        }

        let credentials = self.credentials_dir.list_usable().await?;
        let mut started = 0;
        for record in credentials {
            if self.read().retired.contains(&record.token) {
                continue;
            }
            if self.start_credential(record) {
                started += 1;
            }
        }
        debug!(tasks = listed.len(), started, "reconciled");
        Ok(())
    }

    async fn apply_task_change(&self, change: TaskChange) {
        match self.tasks_dir.get(change.id()).await {
            Ok(Some(record)) => self.upsert_task(record),
            Ok(None) => self.delete_task(change.id()),
            Err(err) => {
                warn!(task = %change.id(), error = %err, "task lookup failed; waiting for reconcile")
            }
        }
    }

    /// Keeps membership current until [`Self::shutdown`]: an initial full
    /// listing, change notifications, and periodic reconciliation.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut task_changes = Some(self.tasks_dir.subscribe());
        let mut credential_adds = Some(self.credentials_dir.subscribe());
        let mut tick = interval(self.config.reconcile_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "reconcile failed");
                    }
                }
                change = recv_or_pending(&mut task_changes) => match change {
                    Ok(change) => self.apply_task_change(change).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "task notifications lagged; reconciling");
                        tick.reset_immediately();
                    }
                    Err(RecvError::Closed) => task_changes = None,
                },
                record = recv_or_pending(&mut credential_adds) => match record {
                    Ok(record) => {
                        self.write().retired.remove(&record.token);
                        self.start_credential(record);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "credential notifications lagged; reconciling");
                        tick.reset_immediately();
                    }
                    Err(RecvError::Closed) => credential_adds = None,
                },
            }
        }
        debug!("scheduler stopped");
    }

    /// Stops the membership loop, kills every credential loop and stops
    /// every task tracker.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let registry = self.read();
        for handle in registry.loops.values() {
            handle.kill();
        }
        for task in registry.tasks.values() {
            task.destroy();
        }
        info!(loops = registry.loops.len(), tasks = registry.tasks.len(), "scheduler shutting down");
    }

    /// Current state for the monitor.
    pub fn status(&self) -> SchedulerStatus {
        let registry = self.read();
        let mut tasks: Vec<TaskSummary> = registry
            .tasks
            .values()
            .map(|task| TaskSummary {
                id: task.id().to_string(),
                owner: task.owner().to_string(),
                trusted: task.trusted(),
                weight: task.weight(),
                pending: task.pending_len(),
                working: task.is_working(),
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        let mut credentials: Vec<CredentialSummary> = registry
            .loops
            .values()
            .map(|handle| CredentialSummary {
                token: token_tail(handle.token()).to_string(),
                receiver: handle.receiver().to_string(),
                status: handle.status(),
            })
            .collect();
        credentials.sort_by(|a, b| (&a.receiver, &a.token).cmp(&(&b.receiver, &b.token)));
        SchedulerStatus {
            board: self.board.ready_state(),
            generation: self.board.view().ok().map(|c| c.generation()),
            tasks,
            credentials,
            credits: registry.credits.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            throttle_available: self.throttle.available(),
        }
    }
}

async fn recv_or_pending<T: Clone>(
    rx: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
