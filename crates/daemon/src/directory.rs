//! Task and credential directory seeded from a JSON state file.
//!
//! The file is re-read periodically; differences against the in-memory copy
//! become change notifications. Credential status write-backs live in memory
//! only and survive re-reads unless the file changes that credential.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use paintboard_core::model::{token_tail, CredentialRecord, CredentialStatus, TaskRecord};
use paintboard_core::ports::{CredentialDirectory, TaskChange, TaskDirectory};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const NOTIFY_CAPACITY: usize = 256;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StateFile {
    pub tasks: Vec<TaskRecord>,
    pub credentials: Vec<CredentialRecord>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub credentials_added: usize,
}

#[derive(Default)]
struct Entries {
    tasks: BTreeMap<String, TaskRecord>,
    credentials: BTreeMap<String, CredentialRecord>,
    /// Credentials as last read from the file, before any write-back.
    seeded: BTreeMap<String, CredentialRecord>,
}

pub struct FileDirectory {
    path: PathBuf,
    entries: Mutex<Entries>,
    task_changes: broadcast::Sender<TaskChange>,
    credential_adds: broadcast::Sender<CredentialRecord>,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            entries: Mutex::new(Entries::default()),
            task_changes: broadcast::channel(NOTIFY_CAPACITY).0,
            credential_adds: broadcast::channel(NOTIFY_CAPACITY).0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-reads the state file. A missing file reads as empty.
    pub async fn reload(&self) -> anyhow::Result<ReloadSummary> {
        let state = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", self.path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        Ok(self.apply(state))
    }

    /// Replaces the contents with `state` and notifies about the differences.
    pub fn apply(&self, state: StateFile) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut changes = Vec::new();
        let mut adds = Vec::new();
        {
            let mut entries = self.entries();

            let mut next: BTreeMap<String, TaskRecord> = BTreeMap::new();
            for record in state.tasks {
                next.insert(record.id.clone(), record);
            }
            for id in entries.tasks.keys() {
                if !next.contains_key(id) {
                    summary.removed += 1;
                    changes.push(TaskChange::Deleted(id.clone()));
                }
            }
            for (id, record) in &next {
                match entries.tasks.get(id) {
                    None => {
                        summary.added += 1;
                        changes.push(TaskChange::Added(id.clone()));
                    }
                    Some(old) if old != record => {
                        summary.updated += 1;
                        changes.push(TaskChange::Updated(id.clone()));
                    }
                    Some(_) => {}
                }
            }
            entries.tasks = next;

            let mut seeded = BTreeMap::new();
            let mut credentials = BTreeMap::new();
            for record in state.credentials {
                let token = record.token.clone();
                let current = match (entries.seeded.get(&token), entries.credentials.get(&token)) {
                    (Some(before), Some(live)) if before == &record => live.clone(),
                    _ => {
                        if record.status.is_usable() {
                            summary.credentials_added += 1;
                            adds.push(record.clone());
                        }
                        record.clone()
                    }
                };
                seeded.insert(token.clone(), record);
                credentials.insert(token, current);
            }
            entries.seeded = seeded;
            entries.credentials = credentials;
        }

        for change in changes {
            let _ = self.task_changes.send(change);
        }
        for record in adds {
            let _ = self.credential_adds.send(record);
        }
        summary
    }

    /// Re-reads the file every `every` until aborted.
    pub fn spawn_reload(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                match directory.reload().await {
                    Ok(summary) if summary != ReloadSummary::default() => {
                        info!(?summary, "state file changed")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, path = %directory.path.display(), "state reload failed"),
                }
            }
        })
    }
}

#[async_trait]
impl TaskDirectory for FileDirectory {
    async fn list(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self.entries().tasks.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<TaskRecord>> {
        Ok(self.entries().tasks.get(id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskChange> {
        self.task_changes.subscribe()
    }
}

#[async_trait]
impl CredentialDirectory for FileDirectory {
    async fn list_usable(&self) -> anyhow::Result<Vec<CredentialRecord>> {
        Ok(self
            .entries()
            .credentials
            .values()
            .filter(|r| r.status.is_usable())
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<CredentialRecord> {
        self.credential_adds.subscribe()
    }

    async fn set_status(&self, token: &str, status: CredentialStatus) -> anyhow::Result<()> {
        let mut entries = self.entries();
        let record = entries
            .credentials
            .get_mut(token)
            .with_context(|| format!("unknown credential {}", token_tail(token)))?;
        record.status = status;
        info!(token = token_tail(token), status = status.as_str(), "credential status stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(json: &str) -> StateFile {
        serde_json::from_str(json).unwrap()
    }

    const SEED: &str = r#"{
        "tasks": [
            {"id": "a", "owner": "alice", "image": {"width": 1, "height": 1, "data": "3"},
             "options": {"left_top": {"x": 0, "y": 0}, "weight": 1.0}},
            {"id": "b", "owner": "bob", "image": {"width": 1, "height": 1, "data": "4"},
             "options": {"left_top": {"x": 1, "y": 0}, "weight": 1.0}, "verified": true}
        ],
        "credentials": [
            {"token": "token-0001", "receiver": "alice"},
            {"token": "token-0002", "receiver": "bob", "status": "invalid"}
        ]
    }"#;

    #[tokio::test]
    async fn first_apply_announces_everything_usable() {
        let dir = FileDirectory::new("unused.json");
        let mut tasks = TaskDirectory::subscribe(dir.as_ref());
        let mut credentials = CredentialDirectory::subscribe(dir.as_ref());

        let summary = dir.apply(state(SEED));
        assert_eq!(summary.added, 2);
        assert_eq!(summary.credentials_added, 1);
        assert_eq!(tasks.recv().await.unwrap(), TaskChange::Added("a".into()));
        assert_eq!(credentials.recv().await.unwrap().token, "token-0001");
        assert!(dir.get("b").await.unwrap().unwrap().trusted);
        assert_eq!(dir.list_usable().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reapply_diffs_tasks_and_keeps_written_status() {
        let dir = FileDirectory::new("unused.json");
        dir.apply(state(SEED));
        dir.set_status("token-0001", CredentialStatus::Busy).await.unwrap();
        let mut tasks = TaskDirectory::subscribe(dir.as_ref());

        let mut next = state(SEED);
        next.tasks.remove(1);
        next.tasks[0].options.weight = 3.0;
        let summary = dir.apply(next);
        assert_eq!(
            summary,
            ReloadSummary {
                added: 0,
                updated: 1,
                removed: 1,
                credentials_added: 0
            }
        );
        assert_eq!(tasks.recv().await.unwrap(), TaskChange::Deleted("b".into()));
        assert_eq!(tasks.recv().await.unwrap(), TaskChange::Updated("a".into()));
        let usable = dir.list_usable().await.unwrap();
        assert_eq!(usable[0].status, CredentialStatus::Busy);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = FileDirectory::new("/nonexistent/paintboard-state.json");
        assert_eq!(dir.reload().await.unwrap(), ReloadSummary::default());
        assert!(dir.list().await.unwrap().is_empty());
        assert!(dir.set_status("nope", CredentialStatus::Working).await.is_err());
    }
}
