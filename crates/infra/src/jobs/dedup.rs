//! Queries over live queue contents.
//!
//! "Active" means queued (including delayed and retry-pending) or running.
//! Results are snapshots: another worker can change the queue right after a
//! query returns, so callers that act on them hold an advisory lock.

use lcms_core::EntityId;

use super::queue::{JobQueue, QueueError};
use super::types::{JobDescriptor, JobId, JobKind, RequestId};

/// Queued and running jobs of `kind`, read as one snapshot.
pub fn active_jobs<Q>(queue: &Q, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError>
where
    Q: JobQueue + ?Sized,
{
    queue.list_active(kind)
}

/// The request an active job for `(kind, entity)` belongs to, if there is one.
///
/// Used by triggers to reuse an in-flight generation instead of starting a
/// second one.
pub fn find_active_request<Q>(
    queue: &Q,
    kind: JobKind,
    entity_id: EntityId,
) -> Result<Option<RequestId>, QueueError>
where
    Q: JobQueue + ?Sized,
{
    Ok(active_jobs(queue, kind)?
        .into_iter()
        .find(|job| job.entity_id == entity_id)
        .map(|job| job.request_id()))
}

/// Other active jobs of `kind` for `entity`, excluding `own`.
pub fn active_duplicates<Q>(
    queue: &Q,
    kind: JobKind,
    entity_id: EntityId,
    own: JobId,
) -> Result<Vec<JobDescriptor>, QueueError>
where
    Q: JobQueue + ?Sized,
{
    Ok(active_jobs(queue, kind)?
        .into_iter()
        .filter(|job| job.entity_id == entity_id && job.id != own)
        .collect())
}

/// Active jobs of any of `kinds` that belong to `request`, excluding `own`.
pub fn outstanding_for<Q>(
    queue: &Q,
    kinds: &[JobKind],
    request: RequestId,
    own: JobId,
) -> Result<Vec<JobDescriptor>, QueueError>
where
    Q: JobQueue + ?Sized,
{
    let mut outstanding = Vec::new();
    for kind in kinds {
        outstanding.extend(
            active_jobs(queue, *kind)?
                .into_iter()
                .filter(|job| job.id != own && job.belongs_to(request)),
        );
    }
    Ok(outstanding)
}
