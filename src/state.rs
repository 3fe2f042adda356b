// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker State
//!
//! Bookkeeping owned by one worker: which tasks are reserved or running, how
//! many times each task name was accepted and which task ids were revoked.

use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};
use uuid::Uuid;

/// Maximum number of revoked ids remembered by a worker.
pub const REVOKES_MAX: usize = 10_000;
/// Revoked ids older than this are purged once the set is full.
pub const REVOKE_EXPIRES: Duration = Duration::from_secs(3600);

/// Identifier of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: &str) -> TaskId {
        TaskId(id.to_owned())
    }

    pub fn random() -> TaskId {
        TaskId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.0).ok()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        TaskId::new(id)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        TaskId(id.to_string())
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Submitted,
    Delivered,
    Executing,
    Completed,
    Failed,
    Revoked,
}

impl TaskState {
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Revoked
        )
    }
}

/// Set with a size bound whose entries expire.
///
/// Expired entries are only purged when the set grows past `maxlen`; if the
/// set is still too large afterwards the oldest entries are dropped.
#[derive(Debug, Clone)]
pub struct LimitedSet {
    maxlen: usize,
    expires: Duration,
    entries: HashMap<TaskId, Instant>,
}

impl LimitedSet {
    pub fn new(maxlen: usize, expires: Duration) -> LimitedSet {
        LimitedSet {
            maxlen,
            expires,
            entries: HashMap::new(),
        }
    }

    pub fn add(&mut self, id: TaskId) {
        self.add_at(id, Instant::now());
    }

    fn add_at(&mut self, id: TaskId, now: Instant) {
        self.entries.insert(id, now);
        if self.entries.len() > self.maxlen {
            self.purge(now);
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn discard(&mut self, id: &TaskId) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&mut self, now: Instant) {
        let expires = self.expires;
        self.entries
            .retain(|_, added| now.saturating_duration_since(*added) < expires);

        if self.entries.len() > self.maxlen {
            let mut by_age: Vec<(TaskId, Instant)> =
                self.entries.iter().map(|(id, at)| (id.clone(), *at)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = self.entries.len() - self.maxlen;
            for (id, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&id);
            }
        }
    }
}

#[derive(Debug)]
struct StateInner {
    reserved: HashSet<TaskId>,
    active: HashSet<TaskId>,
    total_count: HashMap<String, u64>,
    revoked: LimitedSet,
}

/// Tasks known to a worker.
#[derive(Debug)]
pub struct WorkerState {
    inner: Mutex<StateInner>,
}

impl Default for WorkerState {
    fn default() -> Self {
        WorkerState::new()
    }
}

impl WorkerState {
    pub fn new() -> WorkerState {
        WorkerState::with_revoked(LimitedSet::new(REVOKES_MAX, REVOKE_EXPIRES))
    }

    pub fn with_revoked(revoked: LimitedSet) -> WorkerState {
        WorkerState {
            inner: Mutex::new(StateInner {
                reserved: HashSet::new(),
                active: HashSet::new(),
                total_count: HashMap::new(),
                revoked,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A delivery was received and is waiting for a free slot.
    pub fn task_reserved(&self, id: &TaskId) {
        self.lock().reserved.insert(id.clone());
    }

    /// The task started executing.
    pub fn task_accepted(&self, id: &TaskId, name: &str) {
        let mut state = self.lock();
        state.active.insert(id.clone());
        *state.total_count.entry(name.to_owned()).or_default() += 1;
    }

    /// The task finished, whatever the outcome.
    pub fn task_ready(&self, id: &TaskId) {
        let mut state = self.lock();
        state.active.remove(id);
        state.reserved.remove(id);
    }

    pub fn revoke(&self, id: &TaskId) {
        self.lock().revoked.add(id.clone());
    }

    pub fn is_revoked(&self, id: &TaskId) -> bool {
        self.lock().revoked.contains(id)
    }

    pub fn is_active(&self, id: &TaskId) -> bool {
        self.lock().active.contains(id)
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().reserved.len()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Times a task name was accepted.
    pub fn total_count(&self, name: &str) -> u64 {
        self.lock().total_count.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_ids_between_sets() {
        let state = WorkerState::new();
        let id = TaskId::new("t-1");

        state.task_reserved(&id);
        state.task_accepted(&id, "process_torrent");
        assert!(state.is_active(&id));
        assert_eq!(state.reserved_count(), 1);

        state.task_ready(&id);
        assert_eq!(state.active_count(), 0);
        assert_eq!(state.reserved_count(), 0);
        assert_eq!(state.total_count("process_torrent"), 1);
    }

    #[test]
    fn limited_set_drops_expired_then_oldest() {
        let mut set = LimitedSet::new(2, Duration::from_secs(10));
        let start = Instant::now();

        set.add_at(TaskId::new("a"), start);
        set.add_at(TaskId::new("b"), start + Duration::from_secs(11));
        set.add_at(TaskId::new("c"), start + Duration::from_secs(12));
        assert!(!set.contains(&TaskId::new("a")));
        assert_eq!(set.len(), 2);

        set.add_at(TaskId::new("d"), start + Duration::from_secs(13));
        assert!(!set.contains(&TaskId::new("b")));
        assert!(set.contains(&TaskId::new("d")));
    }

    #[test]
    fn task_ids_parse_as_uuids() {
        let id = TaskId::from(Uuid::nil());
        assert_eq!(id.as_uuid(), Some(Uuid::nil()));
        assert_eq!(TaskId::new("not-a-uuid").as_uuid(), None);
    }

    #[test]
    fn task_states_serialize_in_upper_case() {
        assert_eq!(
            serde_json::to_string(&TaskState::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }
}
