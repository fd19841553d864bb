use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::warn;

use shared::domain::{MessageId, MessageKind, UserId};

use crate::error::PipelineError;

/// What an external task id corresponds to once its webhook arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingTask {
    Translation {
        message_id: MessageId,
        language: String,
        kind: MessageKind,
    },
    Training {
        user_id: UserId,
        model_id: String,
    },
}

struct PendingEntry {
    task: PendingTask,
    created_at: Instant,
}

/// Expiring correlation map from external task ids to pending work.
///
/// Consumption is an atomic take-and-remove, so a duplicate webhook for an
/// already-consumed id resolves to nothing instead of double-applying.
/// Expired entries are reaped lazily and count as lookup misses.
pub struct PendingTasks {
    ttl: Duration,
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingTasks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert_translation(
        &self,
        task_id: &str,
        message_id: MessageId,
        language: &str,
        kind: MessageKind,
    ) {
        self.insert(
            task_id,
            PendingTask::Translation {
                message_id,
                language: language.to_string(),
                kind,
            },
        );
    }

    /// At most one outstanding training task per user.
    pub fn insert_training(
        &self,
        task_id: &str,
        user_id: UserId,
        model_id: &str,
    ) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().expect("pending task lock poisoned");
        Self::sweep(&mut inner, self.ttl);
        let already_pending = inner.values().any(|entry| {
            matches!(&entry.task, PendingTask::Training { user_id: pending, .. } if *pending == user_id)
        });
        if already_pending {
            return Err(PipelineError::TrainingAlreadyPending(user_id));
        }
        inner.insert(
            task_id.to_string(),
            PendingEntry {
                task: PendingTask::Training {
                    user_id,
                    model_id: model_id.to_string(),
                },
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn insert(&self, task_id: &str, task: PendingTask) {
        let mut inner = self.inner.lock().expect("pending task lock poisoned");
        Self::sweep(&mut inner, self.ttl);
        inner.insert(
            task_id.to_string(),
            PendingEntry {
                task,
                created_at: Instant::now(),
            },
        );
    }

    /// Consumes the task. Unknown, already-consumed and expired ids all
    /// resolve to `None`.
    pub fn take(&self, task_id: &str) -> Option<PendingTask> {
        let mut inner = self.inner.lock().expect("pending task lock poisoned");
        let entry = inner.remove(task_id)?;
        if entry.created_at.elapsed() > self.ttl {
            warn!(%task_id, "pending task expired before its webhook arrived");
            return None;
        }
        Some(entry.task)
    }

    pub fn has_pending_training(&self, user_id: UserId) -> bool {
        let mut inner = self.inner.lock().expect("pending task lock poisoned");
        Self::sweep(&mut inner, self.ttl);
        inner.values().any(|entry| {
            matches!(&entry.task, PendingTask::Training { user_id: pending, .. } if *pending == user_id)
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending task lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(inner: &mut HashMap<String, PendingEntry>, ttl: Duration) {
        inner.retain(|task_id, entry| {
            let live = entry.created_at.elapsed() <= ttl;
            if !live {
                warn!(%task_id, "reaping expired pending task");
            }
            live
        });
    }
}

impl Default for PendingTasks {
    fn default() -> Self {
        // Matches the external service's longest observed turnaround.
        Self::new(Duration::from_secs(30 * 60))
    }
}
