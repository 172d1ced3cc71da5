//! Boundaries the core consumes. Adapters live outside this crate.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::model::{
    BoardState, CredentialRecord, CredentialStatus, PaintOutcome, PaintTarget, PaintboardUpdate,
    TaskRecord, Validation,
};

/// Live update feed. The sender side dropping is the terminal close signal.
pub type UpdateFeed = mpsc::Receiver<PaintboardUpdate>;

/// Remote canvas: full snapshots plus an ordered stream of updates.
#[async_trait]
pub trait CanvasSource: Send + Sync {
    /// Fetches dimensions and the full grid.
    async fn fetch_snapshot(&self) -> anyhow::Result<BoardState>;

    /// Opens (and joins) the live feed.
    async fn open_feed(&self) -> anyhow::Result<UpdateFeed>;
}

/// Rate-limited per-credential write endpoint.
#[async_trait]
pub trait PaintApi: Send + Sync {
    /// Issues one paint. Never fails: transport problems classify as
    /// [`PaintOutcome::NetworkError`].
    async fn paint(&self, token: &str, target: PaintTarget, route: usize) -> PaintOutcome;

    /// Checks a credential. `Err` means the check itself could not be made.
    async fn validate(&self, token: &str, route: usize) -> anyhow::Result<Validation>;
}

/// Change notification from the task directory. Carries only the id; the
/// record must be re-read since notifications may race the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskChange {
    /// A task was created.
    Added(String),
    /// A task's record changed.
    Updated(String),
    /// A task was removed.
    Deleted(String),
}

impl TaskChange {
    /// Id of the task concerned.
    pub fn id(&self) -> &str {
        match self {
            Self::Added(id) | Self::Updated(id) | Self::Deleted(id) => id,
        }
    }
}

/// Source of paint tasks.
#[async_trait]
pub trait TaskDirectory: Send + Sync {
    /// Every current task.
    async fn list(&self) -> anyhow::Result<Vec<TaskRecord>>;

    /// One task, `None` once deleted.
    async fn get(&self, id: &str) -> anyhow::Result<Option<TaskRecord>>;

    /// Add, update and delete notifications.
    fn subscribe(&self) -> broadcast::Receiver<TaskChange>;
}

/// Source of write credentials.
#[async_trait]
pub trait CredentialDirectory: Send + Sync {
    /// Credentials whose status is not `invalid`.
    async fn list_usable(&self) -> anyhow::Result<Vec<CredentialRecord>>;

    /// Newly added credentials.
    fn subscribe(&self) -> broadcast::Receiver<CredentialRecord>;

    /// Best-effort status write-back.
    async fn set_status(&self, token: &str, status: CredentialStatus) -> anyhow::Result<()>;
}
