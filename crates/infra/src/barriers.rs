//! Completion barriers for counter-based joins.
//!
//! A bundle registers the set of children it dispatched under its request id
//! before enqueuing them. Every dispatched child carries its own
//! [`ChildKey`] and removes it once it is settled; the call that empties the
//! set learns it released the barrier and wakes the bundle exactly once.
//! Removal is by key, so a child delivered twice cannot release the barrier
//! early, and two children for the same entity hold two slots.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use lcms_core::EntityId;
use serde::{Deserialize, Serialize};

pub use crate::jobs::ChildKey;
use crate::jobs::{JobId, JobKind, JobOptions, RequestId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BarrierError {
    #[error("barrier backend error: {0}")]
    Backend(String),
}

/// The job to enqueue when the barrier is released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierTarget {
    pub kind: JobKind,
    pub entity_id: EntityId,
    pub options: JobOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    /// Children outstanding.
    Pending,
    /// Every child settled; the bundle has been woken.
    Released,
    /// The bundle was assembled or failed; later wake-ups are no-ops.
    Finished,
}

/// What removing a child key did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// No barrier exists for the request (poll-mode request, or a standalone child).
    Untracked,
    /// Children still outstanding.
    Remaining(usize),
    /// This call emptied the barrier; the caller wakes the target.
    Released(BarrierTarget),
    /// The barrier had already been released.
    AlreadyReleased,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierSnapshot {
    pub state: BarrierState,
    pub remaining: usize,
    pub target: BarrierTarget,
    pub watchdog: Option<JobId>,
}

pub trait BarrierStore: Send + Sync {
    /// Register (or extend) the barrier for `request`. Returns how many
    /// children are outstanding; zero leaves the barrier released.
    fn register(&self, request: RequestId, target: BarrierTarget, children: Vec<ChildKey>) -> Result<usize, BarrierError>;

    /// Remove one child key.
    fn complete(&self, request: RequestId, child: ChildKey) -> Result<Completion, BarrierError>;

    fn snapshot(&self, request: RequestId) -> Result<Option<BarrierSnapshot>, BarrierError>;

    /// Remember the delayed deadline check scheduled for `request`.
    fn set_watchdog(&self, request: RequestId, job_id: JobId) -> Result<(), BarrierError>;

    /// Mark the barrier finished; returns the watchdog job to cancel, if any.
    fn finish(&self, request: RequestId) -> Result<Option<JobId>, BarrierError>;

    /// Requests with an unfinished barrier targeting `(kind, entity)`.
    fn active_requests(&self, kind: JobKind, entity_id: EntityId) -> Result<Vec<RequestId>, BarrierError>;

    /// Drop barriers finished before `before`. Returns how many were removed.
    fn prune(&self, before: DateTime<Utc>) -> Result<usize, BarrierError>;
}

impl<S> BarrierStore for Arc<S>
where
    S: BarrierStore + ?Sized,
{
    fn register(&self, request: RequestId, target: BarrierTarget, children: Vec<ChildKey>) -> Result<usize, BarrierError> {
        (**self).register(request, target, children)
    }

    fn complete(&self, request: RequestId, child: ChildKey) -> Result<Completion, BarrierError> {
        (**self).complete(request, child)
    }

    fn snapshot(&self, request: RequestId) -> Result<Option<BarrierSnapshot>, BarrierError> {
        (**self).snapshot(request)
    }

    fn set_watchdog(&self, request: RequestId, job_id: JobId) -> Result<(), BarrierError> {
        (**self).set_watchdog(request, job_id)
    }

    fn finish(&self, request: RequestId) -> Result<Option<JobId>, BarrierError> {
        (**self).finish(request)
    }

    fn active_requests(&self, kind: JobKind, entity_id: EntityId) -> Result<Vec<RequestId>, BarrierError> {
        (**self).active_requests(kind, entity_id)
    }

    fn prune(&self, before: DateTime<Utc>) -> Result<usize, BarrierError> {
        (**self).prune(before)
    }
}

#[derive(Debug)]
struct Barrier {
    state: BarrierState,
    pending: HashSet<ChildKey>,
    target: BarrierTarget,
    watchdog: Option<JobId>,
    finished_at: Option<DateTime<Utc>>,
}

/// In-memory barriers for tests/dev and single-process deployments.
///
/// Children settling in other processes cannot see this table; multi-worker
/// deployments use the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryBarriers {
    barriers: RwLock<HashMap<RequestId, Barrier>>,
}

impl InMemoryBarriers {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> BarrierError {
    BarrierError::Backend("lock poisoned".to_string())
}

impl BarrierStore for InMemoryBarriers {
    fn register(&self, request: RequestId, target: BarrierTarget, children: Vec<ChildKey>) -> Result<usize, BarrierError> {
        let mut barriers = self.barriers.write().map_err(poisoned)?;
        let barrier = barriers.entry(request).or_insert_with(|| Barrier {
            state: BarrierState::Pending,
            pending: HashSet::new(),
            target: target.clone(),
            watchdog: None,
            finished_at: None,
        });
        barrier.target = target;
        barrier.pending.extend(children);
        barrier.state = if barrier.pending.is_empty() {
            BarrierState::Released
        } else {
            BarrierState::Pending
        };
        Ok(barrier.pending.len())
    }

    fn complete(&self, request: RequestId, child: ChildKey) -> Result<Completion, BarrierError> {
        let mut barriers = self.barriers.write().map_err(poisoned)?;
        let Some(barrier) = barriers.get_mut(&request) else {
            return Ok(Completion::Untracked);
        };
        if barrier.state != BarrierState::Pending {
            return Ok(Completion::AlreadyReleased);
        }
        barrier.pending.remove(&child);
        if barrier.pending.is_empty() {
            barrier.state = BarrierState::Released;
            Ok(Completion::Released(barrier.target.clone()))
        } else {
            Ok(Completion::Remaining(barrier.pending.len()))
        }
    }

    fn snapshot(&self, request: RequestId) -> Result<Option<BarrierSnapshot>, BarrierError> {
        let barriers = self.barriers.read().map_err(poisoned)?;
        Ok(barriers.get(&request).map(|b| BarrierSnapshot {
            state: b.state,
            remaining: b.pending.len(),
            target: b.target.clone(),
            watchdog: b.watchdog,
        }))
    }

    fn set_watchdog(&self, request: RequestId, job_id: JobId) -> Result<(), BarrierError> {
        let mut barriers = self.barriers.write().map_err(poisoned)?;
        if let Some(barrier) = barriers.get_mut(&request) {
            barrier.watchdog = Some(job_id);
        }
        Ok(())
    }

    fn finish(&self, request: RequestId) -> Result<Option<JobId>, BarrierError> {
        let mut barriers = self.barriers.write().map_err(poisoned)?;
        Ok(barriers.get_mut(&request).and_then(|barrier| {
            barrier.state = BarrierState::Finished;
            barrier.pending.clear();
            barrier.finished_at.get_or_insert_with(Utc::now);
            barrier.watchdog.take()
        }))
    }

    fn active_requests(&self, kind: JobKind, entity_id: EntityId) -> Result<Vec<RequestId>, BarrierError> {
        let barriers = self.barriers.read().map_err(poisoned)?;
        let mut requests: Vec<RequestId> = barriers
            .iter()
            .filter(|(_, b)| {
                b.state != BarrierState::Finished && b.target.kind == kind && b.target.entity_id == entity_id
            })
            .map(|(request, _)| *request)
            .collect();
        requests.sort();
        Ok(requests)
    }

    fn prune(&self, before: DateTime<Utc>) -> Result<usize, BarrierError> {
        let mut barriers = self.barriers.write().map_err(poisoned)?;
        let len = barriers.len();
        barriers.retain(|_, b| !matches!(b.finished_at, Some(at) if at < before));
        Ok(len - barriers.len())
    }
}
