//! Postgres adapters: result maps, advisory locks, barriers and outcomes.
//!
//! The worker side is synchronous (plain threads), so each adapter keeps a
//! tokio runtime handle and bridges every query with `block_on`. Never call
//! these from inside an async task on the same runtime.
//!
//! Barriers and outcomes must be shared by every worker process that runs
//! bundles or children; the in-memory stores only see their own process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use lcms_core::EntityId;
use lcms_curriculum::ResultSlot;

use crate::barriers::{BarrierError, BarrierSnapshot, BarrierState, BarrierStore, BarrierTarget, ChildKey, Completion};
use crate::jobs::{JobId, JobKind, RequestId};
use crate::locks::{AdvisoryLocks, LockError, LockGuard};
use crate::outcomes::{OutcomeStore, OutcomeStoreError, RequestOutcome};
use crate::results::{ResultBackend, ResultStoreError};

/// Interval between `pg_try_advisory_lock` attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn column(slot: ResultSlot) -> &'static str {
    match slot {
        ResultSlot::Links => "links",
        ResultSlot::PreviewLinks => "preview_links",
    }
}

/// Result maps in `generation_results (entity_id, links, preview_links)`.
#[derive(Debug, Clone)]
pub struct PostgresResultBackend {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresResultBackend {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create the table if it does not exist.
    pub fn ensure_schema(&self) -> Result<(), ResultStoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS generation_results (
                    entity_id UUID PRIMARY KEY,
                    links JSONB NOT NULL DEFAULT '{}'::jsonb,
                    preview_links JSONB NOT NULL DEFAULT '{}'::jsonb,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            )
            .execute(&*pool)
            .await
            .map(|_| ())
            .map_err(|e| ResultStoreError::Backend(e.to_string()))
        })
    }
}

impl ResultBackend for PostgresResultBackend {
    #[instrument(skip(self), fields(slot = slot.as_str()), err)]
    fn load(&self, entity_id: EntityId, slot: ResultSlot) -> Result<JsonValue, ResultStoreError> {
        let pool = self.pool.clone();
        let sql = format!("SELECT {} FROM generation_results WHERE entity_id = $1", column(slot));
        let found: Option<JsonValue> = self
            .handle
            .block_on(async move {
                sqlx::query_scalar(&sql)
                    .bind(entity_id.as_uuid())
                    .fetch_optional(&*pool)
                    .await
            })
            .map_err(|e| ResultStoreError::Backend(e.to_string()))?;
        Ok(found.unwrap_or_else(|| json!({})))
    }

    #[instrument(skip(self, map), fields(slot = slot.as_str()), err)]
    fn save(&self, entity_id: EntityId, slot: ResultSlot, map: &JsonValue) -> Result<(), ResultStoreError> {
        let pool = self.pool.clone();
        let col = column(slot);
        let sql = format!(
            r#"
            INSERT INTO generation_results (entity_id, {col})
            VALUES ($1, $2)
            ON CONFLICT (entity_id)
            DO UPDATE SET {col} = EXCLUDED.{col}, updated_at = NOW()
            "#
        );
        let map = map.clone();
        self.handle
            .block_on(async move {
                sqlx::query(&sql)
                    .bind(entity_id.as_uuid())
                    .bind(map)
                    .execute(&*pool)
                    .await
            })
            .map(|_| ())
            .map_err(|e| ResultStoreError::Backend(e.to_string()))
    }
}

/// Session-level `pg_advisory_lock`s, keyed by `hashtext(name)`.
///
/// The lock lives on one pooled connection, which is held by the guard until
/// it drops.
#[derive(Debug, Clone)]
pub struct PostgresAdvisoryLocks {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresAdvisoryLocks {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }
}

impl AdvisoryLocks for PostgresAdvisoryLocks {
    #[instrument(skip(self), err)]
    fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let pool = self.pool.clone();
        let owned = name.to_string();
        let started = Instant::now();

        let conn = self.handle.block_on(async move {
            let backend = |e: sqlx::Error| LockError::Backend(e.to_string());
            let mut conn = pool.acquire().await.map_err(backend)?;
            loop {
                let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
                    .bind(&owned)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(backend)?;
                if locked {
                    return Ok(conn);
                }
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(LockError::Timeout { name: owned, waited });
                }
                tokio::time::sleep(LOCK_RETRY_INTERVAL.min(timeout - waited)).await;
            }
        })?;
        debug!(lock = %name, "advisory lock acquired");

        let handle = self.handle.clone();
        let owned = name.to_string();
        Ok(LockGuard::new(name, move || {
            let mut conn = conn;
            handle.block_on(async move {
                // Unlock failures leave the lock to die with the session.
                if sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                    .bind(&owned)
                    .execute(&mut *conn)
                    .await
                    .is_err()
                {
                    let _ = conn.close().await;
                }
            });
        }))
    }
}

fn barrier_backend(e: sqlx::Error) -> BarrierError {
    BarrierError::Backend(e.to_string())
}

fn state_name(state: BarrierState) -> &'static str {
    match state {
        BarrierState::Pending => "pending",
        BarrierState::Released => "released",
        BarrierState::Finished => "finished",
    }
}

fn parse_state(raw: &str) -> Result<BarrierState, BarrierError> {
    match raw {
        "pending" => Ok(BarrierState::Pending),
        "released" => Ok(BarrierState::Released),
        "finished" => Ok(BarrierState::Finished),
        other => Err(BarrierError::Backend(format!("unknown barrier state {other:?}"))),
    }
}

/// Barriers in `bundle_barriers`, one row per request, with outstanding
/// child keys in `bundle_barrier_children`.
///
/// Every transition locks the request's row (`FOR UPDATE`), so of two
/// children settling at once exactly one sees the key set empty.
#[derive(Debug, Clone)]
pub struct PostgresBarrierStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresBarrierStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    pub fn ensure_schema(&self) -> Result<(), BarrierError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS bundle_barriers (
                    request_id UUID PRIMARY KEY,
                    state TEXT NOT NULL,
                    target JSONB NOT NULL,
                    target_kind TEXT NOT NULL,
                    target_entity UUID NOT NULL,
                    watchdog UUID,
                    finished_at TIMESTAMPTZ
                )
                "#,
            )
            .execute(&*pool)
            .await
            .map_err(barrier_backend)?;
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS bundle_barrier_children (
                    request_id UUID NOT NULL REFERENCES bundle_barriers (request_id) ON DELETE CASCADE,
                    child_key UUID NOT NULL,
                    PRIMARY KEY (request_id, child_key)
                )
                "#,
            )
            .execute(&*pool)
            .await
            .map_err(barrier_backend)?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS bundle_barriers_target ON bundle_barriers (target_kind, target_entity)",
            )
            .execute(&*pool)
            .await
            .map(|_| ())
            .map_err(barrier_backend)
        })
    }
}

impl BarrierStore for PostgresBarrierStore {
    #[instrument(skip(self, target, children), fields(children = children.len()), err)]
    fn register(&self, request: RequestId, target: BarrierTarget, children: Vec<ChildKey>) -> Result<usize, BarrierError> {
        let pool = self.pool.clone();
        let keys: Vec<Uuid> = children.iter().map(|key| *key.as_uuid()).collect();
        self.handle.block_on(async move {
            let mut tx = pool.begin().await.map_err(barrier_backend)?;
            sqlx::query(
                r#"
                INSERT INTO bundle_barriers (request_id, state, target, target_kind, target_entity)
                VALUES ($1, 'pending', $2, $3, $4)
                ON CONFLICT (request_id)
                DO UPDATE SET target = EXCLUDED.target, target_kind = EXCLUDED.target_kind,
                              target_entity = EXCLUDED.target_entity, finished_at = NULL
                "#,
            )
            .bind(request.as_uuid())
            .bind(Json(&target))
            .bind(target.kind.as_str())
            .bind(target.entity_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(barrier_backend)?;
            sqlx::query(
                r#"
                INSERT INTO bundle_barrier_children (request_id, child_key)
                SELECT $1, key FROM UNNEST($2::uuid[]) AS key
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(request.as_uuid())
            .bind(&keys)
            .execute(&mut *tx)
            .await
            .map_err(barrier_backend)?;
            let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bundle_barrier_children WHERE request_id = $1")
                .bind(request.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(barrier_backend)?;
            let state = if remaining == 0 {
                BarrierState::Released
            } else {
                BarrierState::Pending
            };
            sqlx::query("UPDATE bundle_barriers SET state = $2 WHERE request_id = $1")
                .bind(request.as_uuid())
                .bind(state_name(state))
                .execute(&mut *tx)
                .await
                .map_err(barrier_backend)?;
            tx.commit().await.map_err(barrier_backend)?;
            Ok(remaining as usize)
        })
    }

    #[instrument(skip(self), err)]
    fn complete(&self, request: RequestId, child: ChildKey) -> Result<Completion, BarrierError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            let mut tx = pool.begin().await.map_err(barrier_backend)?;
            let row: Option<(String, Json<BarrierTarget>)> =
                sqlx::query_as("SELECT state, target FROM bundle_barriers WHERE request_id = $1 FOR UPDATE")
                    .bind(request.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(barrier_backend)?;
            let Some((state, Json(target))) = row else {
                return Ok(Completion::Untracked);
            };
            if parse_state(&state)? != BarrierState::Pending {
                return Ok(Completion::AlreadyReleased);
            }
            sqlx::query("DELETE FROM bundle_barrier_children WHERE request_id = $1 AND child_key = $2")
                .bind(request.as_uuid())
                .bind(child.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(barrier_backend)?;
            let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bundle_barrier_children WHERE request_id = $1")
                .bind(request.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(barrier_backend)?;
            let completion = if remaining == 0 {
                sqlx::query("UPDATE bundle_barriers SET state = 'released' WHERE request_id = $1")
                    .bind(request.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(barrier_backend)?;
                Completion::Released(target)
            } else {
                Completion::Remaining(remaining as usize)
            };
            tx.commit().await.map_err(barrier_backend)?;
            Ok(completion)
        })
    }

    fn snapshot(&self, request: RequestId) -> Result<Option<BarrierSnapshot>, BarrierError> {
        let pool = self.pool.clone();
        let row: Option<(String, Json<BarrierTarget>, Option<Uuid>, i64)> = self
            .handle
            .block_on(async move {
                sqlx::query_as(
                    r#"
                    SELECT b.state, b.target, b.watchdog,
                           (SELECT COUNT(*) FROM bundle_barrier_children c WHERE c.request_id = b.request_id)
                    FROM bundle_barriers b
                    WHERE b.request_id = $1
                    "#,
                )
                .bind(request.as_uuid())
                .fetch_optional(&*pool)
                .await
            })
            .map_err(barrier_backend)?;
        row.map(|(state, Json(target), watchdog, remaining)| {
            Ok(BarrierSnapshot {
                state: parse_state(&state)?,
                remaining: remaining as usize,
                target,
                watchdog: watchdog.map(JobId::from_uuid),
            })
        })
        .transpose()
    }

    fn set_watchdog(&self, request: RequestId, job_id: JobId) -> Result<(), BarrierError> {
        let pool = self.pool.clone();
        self.handle
            .block_on(async move {
                sqlx::query("UPDATE bundle_barriers SET watchdog = $2 WHERE request_id = $1")
                    .bind(request.as_uuid())
                    .bind(job_id.as_uuid())
                    .execute(&*pool)
                    .await
            })
            .map(|_| ())
            .map_err(barrier_backend)
    }

    #[instrument(skip(self), err)]
    fn finish(&self, request: RequestId) -> Result<Option<JobId>, BarrierError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            let mut tx = pool.begin().await.map_err(barrier_backend)?;
            let row: Option<(Option<Uuid>,)> =
                sqlx::query_as("SELECT watchdog FROM bundle_barriers WHERE request_id = $1 FOR UPDATE")
                    .bind(request.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(barrier_backend)?;
            let Some((watchdog,)) = row else {
                return Ok(None);
            };
            sqlx::query(
                r#"
                UPDATE bundle_barriers
                SET state = 'finished', watchdog = NULL, finished_at = COALESCE(finished_at, NOW())
                WHERE request_id = $1
                "#,
            )
            .bind(request.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(barrier_backend)?;
            sqlx::query("DELETE FROM bundle_barrier_children WHERE request_id = $1")
                .bind(request.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(barrier_backend)?;
            tx.commit().await.map_err(barrier_backend)?;
            Ok(watchdog.map(JobId::from_uuid))
        })
    }

    fn active_requests(&self, kind: JobKind, entity_id: EntityId) -> Result<Vec<RequestId>, BarrierError> {
        let pool = self.pool.clone();
        let ids: Vec<Uuid> = self
            .handle
            .block_on(async move {
                sqlx::query_scalar(
                    r#"
                    SELECT request_id FROM bundle_barriers
                    WHERE state <> 'finished' AND target_kind = $1 AND target_entity = $2
                    ORDER BY request_id
                    "#,
                )
                .bind(kind.as_str())
                .bind(entity_id.as_uuid())
                .fetch_all(&*pool)
                .await
            })
            .map_err(barrier_backend)?;
        Ok(ids.into_iter().map(RequestId::from_uuid).collect())
    }

    #[instrument(skip(self), err)]
    fn prune(&self, before: DateTime<Utc>) -> Result<usize, BarrierError> {
        let pool = self.pool.clone();
        self.handle
            .block_on(async move {
                sqlx::query("DELETE FROM bundle_barriers WHERE state = 'finished' AND finished_at < $1")
                    .bind(before)
                    .execute(&*pool)
                    .await
            })
            .map(|done| done.rows_affected() as usize)
            .map_err(barrier_backend)
    }
}

fn outcome_backend(e: sqlx::Error) -> OutcomeStoreError {
    OutcomeStoreError::Backend(e.to_string())
}

/// Outcomes in `request_outcomes` and `dependant_outcomes`.
#[derive(Debug, Clone)]
pub struct PostgresOutcomeStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresOutcomeStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    pub fn ensure_schema(&self) -> Result<(), OutcomeStoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS request_outcomes (
                    request_id UUID PRIMARY KEY,
                    outcome JSONB NOT NULL,
                    recorded_at TIMESTAMPTZ NOT NULL
                )
                "#,
            )
            .execute(&*pool)
            .await
            .map_err(outcome_backend)?;
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS dependant_outcomes (
                    request_id UUID NOT NULL,
                    job_id UUID NOT NULL,
                    outcome JSONB NOT NULL,
                    PRIMARY KEY (request_id, job_id)
                )
                "#,
            )
            .execute(&*pool)
            .await
            .map(|_| ())
            .map_err(outcome_backend)
        })
    }
}

impl OutcomeStore for PostgresOutcomeStore {
    #[instrument(skip(self, outcome), fields(ok = outcome.ok), err)]
    fn store(&self, request: RequestId, outcome: RequestOutcome) -> Result<(), OutcomeStoreError> {
        let pool = self.pool.clone();
        self.handle
            .block_on(async move {
                sqlx::query(
                    r#"
                    INSERT INTO request_outcomes (request_id, outcome, recorded_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (request_id)
                    DO UPDATE SET outcome = EXCLUDED.outcome, recorded_at = EXCLUDED.recorded_at
                    "#,
                )
                .bind(request.as_uuid())
                .bind(Json(&outcome))
                .bind(outcome.recorded_at)
                .execute(&*pool)
                .await
            })
            .map(|_| ())
            .map_err(outcome_backend)
    }

    #[instrument(skip(self, outcome), fields(ok = outcome.ok), err)]
    fn store_dependant(&self, request: RequestId, job_id: JobId, outcome: RequestOutcome) -> Result<(), OutcomeStoreError> {
        let pool = self.pool.clone();
        self.handle
            .block_on(async move {
                sqlx::query(
                    r#"
                    INSERT INTO dependant_outcomes (request_id, job_id, outcome)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (request_id, job_id) DO UPDATE SET outcome = EXCLUDED.outcome
                    "#,
                )
                .bind(request.as_uuid())
                .bind(job_id.as_uuid())
                .bind(Json(&outcome))
                .execute(&*pool)
                .await
            })
            .map(|_| ())
            .map_err(outcome_backend)
    }

    fn get(&self, request: RequestId) -> Result<Option<RequestOutcome>, OutcomeStoreError> {
        let pool = self.pool.clone();
        let found: Option<Json<RequestOutcome>> = self
            .handle
            .block_on(async move {
                sqlx::query_scalar("SELECT outcome FROM request_outcomes WHERE request_id = $1")
                    .bind(request.as_uuid())
                    .fetch_optional(&*pool)
                    .await
            })
            .map_err(outcome_backend)?;
        Ok(found.map(|Json(outcome)| outcome))
    }

    fn dependants(&self, request: RequestId) -> Result<Vec<(JobId, RequestOutcome)>, OutcomeStoreError> {
        let pool = self.pool.clone();
        let rows: Vec<(Uuid, Json<RequestOutcome>)> = self
            .handle
            .block_on(async move {
                sqlx::query_as("SELECT job_id, outcome FROM dependant_outcomes WHERE request_id = $1 ORDER BY job_id")
                    .bind(request.as_uuid())
                    .fetch_all(&*pool)
                    .await
            })
            .map_err(outcome_backend)?;
        Ok(rows
            .into_iter()
            .map(|(id, Json(outcome))| (JobId::from_uuid(id), outcome))
            .collect())
    }

    #[instrument(skip(self), err)]
    fn prune(&self, before: DateTime<Utc>) -> Result<usize, OutcomeStoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            let mut tx = pool.begin().await.map_err(outcome_backend)?;
            let gone: Vec<Uuid> =
                sqlx::query_scalar("DELETE FROM request_outcomes WHERE recorded_at < $1 RETURNING request_id")
                    .bind(before)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(outcome_backend)?;
            sqlx::query("DELETE FROM dependant_outcomes WHERE request_id = ANY($1)")
                .bind(&gone)
                .execute(&mut *tx)
                .await
                .map_err(outcome_backend)?;
            tx.commit().await.map_err(outcome_backend)?;
            Ok(gone.len())
        })
    }
}
