//! In-memory bookkeeping for transfer tasks.
//!
//! A task lives in exactly one of two maps: `active` (queued or running)
//! or `completed` (finished in any final state). Both maps sit behind one
//! lock so every state change, including the migration between them, is a
//! single atomic step: no reader can ever observe a task in both maps or
//! in neither.

use std::{collections::HashMap, fmt, sync::Mutex};

use chrono::Local;
use ecmwf_api::RequestParams;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::TaskSummary;

/// Length of a task id.
pub const TASK_ID_LEN: usize = 32;

const TASK_ADDED_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Identifier assigned by the daemon to a submitted transfer: 32 random
/// lowercase ASCII letters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    fn generate<R: Rng>(rng: &mut R) -> Self {
        let id = (0..TASK_ID_LEN)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle states of a transfer task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task's record. Finished tasks keep their id, insertion timestamp
/// and final status, but drop the request parameters.
#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub task_added: String,
    pub task_status: TaskStatus,
    pub task_data: RequestParams,
}

/// Why a `cancel_transfer` was refused.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("Unknown task {0}")]
    UnknownTask(String),

    #[error(
        "Only queued transfers can be cancelled; task {task_id} is {status}"
    )]
    NotQueued {
        task_id: String,
        status: TaskStatus,
    },
}

/// The active and completed task maps, under one lock.
#[derive(Default)]
pub struct TaskStore {
    inner: Mutex<Stores>,
}

#[derive(Default)]
struct Stores {
    active: HashMap<TaskId, TaskRecord>,
    completed: HashMap<TaskId, TaskRecord>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new queued task and returns its id. Ids are regenerated
    /// on the (astronomically unlikely) collision with a live task.
    pub fn add(&self, task_data: RequestParams) -> TaskId {
        let mut inner = self.inner.lock().unwrap();
        let mut rng = rand::thread_rng();
        let id = loop {
            let id = TaskId::generate(&mut rng);
            if !inner.active.contains_key(&id)
                && !inner.completed.contains_key(&id)
            {
                break id;
            }
        };
        inner.active.insert(
            id.clone(),
            TaskRecord {
                task_added: Local::now().format(TASK_ADDED_FORMAT).to_string(),
                task_status: TaskStatus::Queued,
                task_data,
            },
        );
        id
    }

    pub fn list_active(&self) -> Vec<TaskSummary> {
        summaries(&self.inner.lock().unwrap().active)
    }

    pub fn list_completed(&self) -> Vec<TaskSummary> {
        summaries(&self.inner.lock().unwrap().completed)
    }

    /// Claims a queued task for a worker, marking it active and returning
    /// its parameters. Tasks in any other state are not claimable.
    pub fn claim(&self, id: &TaskId) -> Option<RequestParams> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.active.get_mut(id)?;
        if record.task_status != TaskStatus::Queued {
            return None;
        }
        record.task_status = TaskStatus::Active;
        Some(record.task_data.clone())
    }

    /// Migrates a task from the active to the completed map with the
    /// given final status, preserving its insertion timestamp.
    pub fn finish(&self, id: &TaskId, status: TaskStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.active.remove(id) {
            inner.completed.insert(
                id.clone(),
                TaskRecord {
                    task_added: record.task_added,
                    task_status: status,
                    task_data: RequestParams::new(),
                },
            );
        }
    }

    /// Cancels a queued task, recording it as cancelled. A task that
    /// already started (or finished) cannot be cancelled.
    pub fn cancel(&self, id: &TaskId) -> Result<(), CancelError> {
        let mut inner = self.inner.lock().unwrap();

        let queued = matches!(
            inner.active.get(id),
            Some(record) if record.task_status == TaskStatus::Queued
        );
        if queued {
            let record = inner
                .active
                .remove(id)
                .expect("Presence was checked under the same lock");
            inner.completed.insert(
                id.clone(),
                TaskRecord {
                    task_added: record.task_added,
                    task_status: TaskStatus::Cancelled,
                    task_data: RequestParams::new(),
                },
            );
            return Ok(());
        }

        if let Some(record) =
            inner.active.get(id).or_else(|| inner.completed.get(id))
        {
            return Err(CancelError::NotQueued {
                task_id: id.to_string(),
                status: record.task_status,
            });
        }
        Err(CancelError::UnknownTask(id.to_string()))
    }
}

fn summaries(map: &HashMap<TaskId, TaskRecord>) -> Vec<TaskSummary> {
    map.iter()
        .map(|(id, record)| TaskSummary {
            task_id: id.to_string(),
            task_added: record.task_added.clone(),
            task_status: record.task_status,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RequestParams {
        let mut params = RequestParams::new();
        params.insert("dataset".to_owned(), "s2s".to_owned());
        params
    }

    fn residency(store: &TaskStore, id: &TaskId) -> (bool, bool) {
        let in_active = store
            .list_active()
            .iter()
            .any(|summary| summary.task_id == id.as_str());
        let in_completed = store
            .list_completed()
            .iter()
            .any(|summary| summary.task_id == id.as_str());
        (in_active, in_completed)
    }

    #[test]
    fn task_ids_are_32_lowercase_letters() {
        let store = TaskStore::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = store.add(params());
            assert_eq!(id.as_str().len(), TASK_ID_LEN);
            assert!(id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_lowercase() && c.is_ascii_alphabetic()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn task_lives_in_exactly_one_store() {
        let store = TaskStore::new();
        let id = store.add(params());
        assert_eq!(residency(&store, &id), (true, false));

        let claimed = store.claim(&id).unwrap();
        assert_eq!(claimed, params());
        assert_eq!(residency(&store, &id), (true, false));

        store.finish(&id, TaskStatus::Completed);
        assert_eq!(residency(&store, &id), (false, true));

        let summary = store
            .list_completed()
            .into_iter()
            .find(|summary| summary.task_id == id.as_str())
            .unwrap();
        assert_eq!(summary.task_status, TaskStatus::Completed);
    }

    #[test]
    fn finish_preserves_the_insertion_timestamp() {
        let store = TaskStore::new();
        let id = store.add(params());
        let added = store.list_active()[0].task_added.clone();

        store.claim(&id).unwrap();
        store.finish(&id, TaskStatus::Failed);

        let summary = &store.list_completed()[0];
        assert_eq!(summary.task_added, added);
        assert_eq!(summary.task_status, TaskStatus::Failed);
    }

    #[test]
    fn claim_is_single_shot() {
        let store = TaskStore::new();
        let id = store.add(params());
        assert!(store.claim(&id).is_some());
        assert!(store.claim(&id).is_none());
        assert!(store.claim(&TaskId::from("missing".to_owned())).is_none());
    }

    #[test]
    fn only_queued_tasks_can_be_cancelled() {
        let store = TaskStore::new();

        let id = store.add(params());
        store.cancel(&id).unwrap();
        assert_eq!(residency(&store, &id), (false, true));
        assert_eq!(
            store.list_completed()[0].task_status,
            TaskStatus::Cancelled
        );
        // A cancelled task can no longer be claimed by a worker.
        assert!(store.claim(&id).is_none());

        // Cancelling again: the task is already in a final state.
        assert!(matches!(
            store.cancel(&id),
            Err(CancelError::NotQueued {
                status: TaskStatus::Cancelled,
                ..
            })
        ));

        let running = store.add(params());
        store.claim(&running).unwrap();
        assert!(matches!(
            store.cancel(&running),
            Err(CancelError::NotQueued {
                status: TaskStatus::Active,
                ..
            })
        ));

        assert!(matches!(
            store.cancel(&TaskId::from("missing".to_owned())),
            Err(CancelError::UnknownTask(_))
        ));
    }
}
