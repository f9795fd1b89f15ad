//! Task and build repository.
//!
//! All status transitions are conditional updates: a hand-out only
//! succeeds on a pending row, a completion or requeue only succeeds while
//! the row still carries the epoch the caller observed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use distbuild_core::ResourceId;
use distbuild_core::build::{Build, BuildDetails, NewBuild};
use distbuild_core::product::SignKey;
use distbuild_core::task::{
    Assignment, CapabilitySet, NewTask, Task, TaskKind, TaskParent, TaskPayload, TaskResult,
    TaskStatus,
};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{DbError, DbResult};

/// A worker asking for its next task.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub kind: TaskKind,
    pub worker_id: String,
    pub capabilities: CapabilitySet,
    pub now: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
}

/// Lease-related view of an active task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub task_id: ResourceId,
    pub epoch: i64,
    pub worker_id: String,
    pub assigned_at: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
}

/// Condition under which an active task may be returned to pending.
#[derive(Debug, Clone)]
pub enum RequeueGuard {
    /// The lease observed with `epoch` has run out.
    Expired { task_id: ResourceId, epoch: i64 },
    /// The task is still held by `worker_id` under `epoch` and was handed
    /// out no later than `assigned_before`.
    Abandoned {
        task_id: ResourceId,
        epoch: i64,
        worker_id: String,
        assigned_before: DateTime<Utc>,
    },
}

impl RequeueGuard {
    pub fn task_id(&self) -> ResourceId {
        match self {
            RequeueGuard::Expired { task_id, .. } | RequeueGuard::Abandoned { task_id, .. } => {
                *task_id
            }
        }
    }
}

/// Side effect applied in the same unit of work as a terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEffect {
    /// Stamp the build finished once every build task is terminal.
    SettleBuild(ResourceId),
    /// Fail pending tasks that depend, directly or transitively, on the
    /// completed task.
    FailDependents { reason: String },
    MarkBuildSigned(ResourceId),
    /// Re-arm the grace timer on the completed task.
    ArmGracePeriod { until: DateTime<Utc> },
    AttachSignKey { product_id: ResourceId, key: SignKey },
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub parent: Option<ResourceId>,
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a build and its tasks. Dependency indices are resolved to
    /// task ids. The submission must already be validated.
    async fn create_build(&self, build: &NewBuild, now: DateTime<Utc>) -> DbResult<BuildDetails>;
    async fn get_build(&self, id: ResourceId) -> DbResult<BuildDetails>;
    /// Delete a build and its tasks. Refused while any task holds a lease.
    async fn remove_build(&self, id: ResourceId) -> DbResult<()>;
    /// Cancel every non-terminal task of the build. Returns the ids of the
    /// tasks cancelled by this call.
    async fn cancel_build(
        &self,
        id: ResourceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<ResourceId>>;

    async fn create_task(&self, task: NewTask, now: DateTime<Utc>) -> DbResult<Task>;
    async fn get_task(&self, id: ResourceId) -> DbResult<Task>;
    async fn list_tasks(&self, filter: &TaskFilter) -> DbResult<Vec<Task>>;

    /// Hand the oldest eligible pending task to the worker: pending →
    /// assigned, epoch + 1, lease stamped.
    async fn claim_next(&self, claim: &ClaimRequest) -> DbResult<Option<Task>>;
    /// Push the lease of a task held by `worker_id` under `epoch`;
    /// assigned → in progress. Fails with `LeaseExpired` when the lease is
    /// no longer held.
    async fn extend_lease(
        &self,
        id: ResourceId,
        epoch: i64,
        worker_id: &str,
        lease_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Task>;
    /// Move an active task held under `epoch` to the terminal state of
    /// `result` and apply `effects`, all in one unit of work.
    async fn finish_task(
        &self,
        id: ResourceId,
        epoch: i64,
        result: &TaskResult,
        effects: &[CompletionEffect],
        now: DateTime<Utc>,
    ) -> DbResult<Task>;

    async fn expired_leases(&self, now: DateTime<Utc>) -> DbResult<Vec<LeaseSnapshot>>;
    async fn leases_for_worker(&self, worker_id: &str) -> DbResult<Vec<LeaseSnapshot>>;
    /// Return an active task to pending if `guard` still holds. Returns
    /// whether this call performed the requeue.
    async fn requeue(&self, guard: &RequeueGuard, now: DateTime<Utc>) -> DbResult<bool>;
}

pub(crate) const ACTIVE_STATUSES: &str = "('assigned', 'in_progress')";
const OPEN_STATUSES: &str = "('pending', 'assigned', 'in_progress')";

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    parent_type: String,
    parent_id: Uuid,
    status: String,
    payload: serde_json::Value,
    requirements: Vec<String>,
    worker_id: Option<String>,
    assigned_at: Option<DateTime<Utc>>,
    lease_expiry: Option<DateTime<Utc>>,
    epoch: i64,
    result: Option<serde_json::Value>,
    depends_on: Vec<Uuid>,
    grace_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> DbResult<Self> {
        let parent = match row.parent_type.as_str() {
            "build" => TaskParent::Build(row.parent_id.into()),
            "product" => TaskParent::Product(row.parent_id.into()),
            other => return Err(DbError::Decode(format!("unknown parent type: {}", other))),
        };
        let status: TaskStatus = row
            .status
            .parse()
            .map_err(|e: distbuild_core::Error| DbError::Decode(e.to_string()))?;
        let requirements = CapabilitySet::from_strings(&row.requirements)
            .map_err(|e| DbError::Decode(e.to_string()))?;
        let payload: TaskPayload = serde_json::from_value(row.payload)?;
        let result = row.result.map(serde_json::from_value).transpose()?;
        let assignment = match (row.worker_id, row.assigned_at, row.lease_expiry) {
            (Some(worker_id), Some(assigned_at), Some(lease_expiry)) => Some(Assignment {
                worker_id,
                assigned_at,
                lease_expiry,
            }),
            _ => None,
        };

        Ok(Task {
            id: row.id.into(),
            parent,
            payload,
            status,
            requirements,
            assignment,
            epoch: row.epoch,
            result,
            depends_on: row.depends_on.into_iter().map(ResourceId::from).collect(),
            grace_until: row.grace_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    id: Uuid,
    cancelled: bool,
    signed: bool,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<BuildRow> for Build {
    fn from(row: BuildRow) -> Self {
        Build {
            id: row.id.into(),
            cancelled: row.cancelled,
            signed: row.signed,
            created_at: row.created_at,
            finished_at: row.finished_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    id: Uuid,
    epoch: i64,
    worker_id: Option<String>,
    assigned_at: Option<DateTime<Utc>>,
    lease_expiry: Option<DateTime<Utc>>,
}

impl TryFrom<LeaseRow> for LeaseSnapshot {
    type Error = DbError;

    fn try_from(row: LeaseRow) -> DbResult<Self> {
        match (row.worker_id, row.assigned_at, row.lease_expiry) {
            (Some(worker_id), Some(assigned_at), Some(lease_expiry)) => Ok(LeaseSnapshot {
                task_id: row.id.into(),
                epoch: row.epoch,
                worker_id,
                assigned_at,
                lease_expiry,
            }),
            _ => Err(DbError::Decode(format!(
                "active task {} has no assignment",
                row.id
            ))),
        }
    }
}

fn decode_tasks(rows: Vec<TaskRow>) -> DbResult<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

fn parent_columns(parent: &TaskParent) -> (&'static str, Uuid) {
    match parent {
        TaskParent::Build(id) => ("build", *id.as_uuid()),
        TaskParent::Product(id) => ("product", *id.as_uuid()),
    }
}

pub(crate) async fn insert_task(
    conn: &mut PgConnection,
    id: ResourceId,
    task: &NewTask,
    now: DateTime<Utc>,
) -> DbResult<Task> {
    let (parent_type, parent_id) = parent_columns(&task.parent);
    let depends_on: Vec<Uuid> = task.depends_on.iter().map(|d| *d.as_uuid()).collect();

    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        INSERT INTO tasks (id, parent_type, parent_id, kind, status, payload, requirements,
                           epoch, depends_on, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'pending', $5, $6, 0, $7, $8, $8)
        RETURNING *
        "#,
    )
    .bind(id.as_uuid())
    .bind(parent_type)
    .bind(parent_id)
    .bind(task.payload.kind().as_str())
    .bind(serde_json::to_value(&task.payload)?)
    .bind(task.payload.requirements().to_strings())
    .bind(depends_on)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Task::try_from(row)
}

async fn apply_effect(
    conn: &mut PgConnection,
    task: &Task,
    effect: &CompletionEffect,
    now: DateTime<Utc>,
) -> DbResult<()> {
    match effect {
        CompletionEffect::SettleBuild(build_id) => {
            sqlx::query(&format!(
                r#"
                UPDATE builds SET finished_at = $2
                WHERE id = $1 AND finished_at IS NULL
                  AND NOT EXISTS (
                      SELECT 1 FROM tasks
                      WHERE parent_type = 'build' AND parent_id = $1
                        AND kind = 'build' AND status IN {}
                  )
                "#,
                OPEN_STATUSES
            ))
            .bind(build_id.as_uuid())
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        CompletionEffect::FailDependents { reason } => {
            let result = serde_json::to_value(TaskResult::Failed {
                error: reason.clone(),
                log_ref: None,
            })?;
            sqlx::query(
                r#"
                WITH RECURSIVE doomed(id) AS (
                    SELECT id FROM tasks
                    WHERE $1 = ANY(depends_on) AND status = 'pending'
                    UNION
                    SELECT t.id FROM tasks t
                    JOIN doomed d ON d.id = ANY(t.depends_on)
                    WHERE t.status = 'pending'
                )
                UPDATE tasks SET status = 'failed', result = $2, updated_at = $3
                WHERE id IN (SELECT id FROM doomed)
                "#,
            )
            .bind(task.id.as_uuid())
            .bind(result)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        CompletionEffect::MarkBuildSigned(build_id) => {
            sqlx::query("UPDATE builds SET signed = TRUE WHERE id = $1")
                .bind(build_id.as_uuid())
                .execute(&mut *conn)
                .await?;
        }
        CompletionEffect::ArmGracePeriod { until } => {
            sqlx::query("UPDATE tasks SET grace_until = $2 WHERE id = $1")
                .bind(task.id.as_uuid())
                .bind(until)
                .execute(&mut *conn)
                .await?;
        }
        CompletionEffect::AttachSignKey { product_id, key } => {
            let updated = sqlx::query("UPDATE products SET sign_key = $2 WHERE id = $1")
                .bind(product_id.as_uuid())
                .bind(serde_json::to_value(key)?)
                .execute(&mut *conn)
                .await?;
            if updated.rows_affected() == 0 {
                return Err(DbError::NotFound(format!("product {}", product_id)));
            }
        }
    }
    Ok(())
}

/// PostgreSQL implementation of TaskStore.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_build(&self, build: &NewBuild, now: DateTime<Utc>) -> DbResult<BuildDetails> {
        let mut tx = self.pool.begin().await?;

        let build_id = ResourceId::new();
        let record = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO builds (id, cancelled, signed, created_at)
            VALUES ($1, FALSE, FALSE, $2)
            RETURNING *
            "#,
        )
        .bind(build_id.as_uuid())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let ids: Vec<ResourceId> = build.tasks.iter().map(|_| ResourceId::new()).collect();
        let mut tasks = Vec::with_capacity(build.tasks.len());
        for (idx, entry) in build.tasks.iter().enumerate() {
            let new_task = NewTask::new(
                TaskParent::Build(build_id),
                TaskPayload::Build {
                    arch: entry.arch.clone(),
                    source_ref: entry.source_ref.clone(),
                },
            )
            .with_dependencies(entry.depends_on.iter().filter_map(|d| ids.get(*d).copied()).collect());
            tasks.push(insert_task(&mut tx, ids[idx], &new_task, now).await?);
        }

        tx.commit().await?;
        Ok(BuildDetails {
            build: record.into(),
            tasks,
        })
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<BuildDetails> {
        let build = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;

        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE parent_type = 'build' AND parent_id = $1 ORDER BY seq",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(BuildDetails {
            build: build.into(),
            tasks: decode_tasks(rows)?,
        })
    }

    async fn remove_build(&self, id: ResourceId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT id FROM builds WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;

        let active: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM tasks WHERE parent_type = 'build' AND parent_id = $1 AND status IN {}",
            ACTIVE_STATUSES
        ))
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            return Err(DbError::Conflict(format!(
                "build {} has {} task(s) in flight",
                id, active
            )));
        }

        sqlx::query("DELETE FROM tasks WHERE parent_type = 'build' AND parent_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(build_id = %id, "Removed build");
        Ok(())
    }

    async fn cancel_build(
        &self,
        id: ResourceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<ResourceId>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT id FROM builds WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;

        let result = serde_json::to_value(TaskResult::Cancelled {
            reason: reason.to_string(),
        })?;
        let cancelled: Vec<Uuid> = sqlx::query_scalar(&format!(
            r#"
            UPDATE tasks
            SET status = 'cancelled', result = $2, worker_id = NULL, assigned_at = NULL,
                lease_expiry = NULL, updated_at = $3
            WHERE parent_type = 'build' AND parent_id = $1 AND status IN {}
            RETURNING id
            "#,
            OPEN_STATUSES
        ))
        .bind(id.as_uuid())
        .bind(result)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE builds SET cancelled = TRUE, finished_at = COALESCE(finished_at, $2) WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(cancelled.into_iter().map(ResourceId::from).collect())
    }

    async fn create_task(&self, task: NewTask, now: DateTime<Utc>) -> DbResult<Task> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut conn, ResourceId::new(), &task, now).await
    }

    async fn get_task(&self, id: ResourceId) -> DbResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        Task::try_from(row)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> DbResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE ($1::uuid IS NULL OR parent_id = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY seq
            "#,
        )
        .bind(filter.parent.map(Uuid::from))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        decode_tasks(rows)
    }

    /// Uses SKIP LOCKED so concurrent callers never block on, or receive,
    /// the same row; the outer `status = 'pending'` re-check is the CAS.
    async fn claim_next(&self, claim: &ClaimRequest) -> DbResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'assigned', worker_id = $2, assigned_at = $3, lease_expiry = $4,
                epoch = epoch + 1, updated_at = $3
            WHERE id = (
                SELECT t.id FROM tasks t
                WHERE t.status = 'pending'
                  AND t.kind = $1
                  AND t.requirements <@ $5::text[]
                  AND NOT EXISTS (
                      SELECT 1 FROM tasks d
                      WHERE d.id = ANY(t.depends_on) AND d.status <> 'done'
                  )
                ORDER BY t.seq ASC
                FOR UPDATE OF t SKIP LOCKED
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(claim.kind.as_str())
        .bind(&claim.worker_id)
        .bind(claim.now)
        .bind(claim.lease_expiry)
        .bind(claim.capabilities.to_strings())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Task::try_from).transpose()
    }

    async fn extend_lease(
        &self,
        id: ResourceId,
        epoch: i64,
        worker_id: &str,
        lease_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE tasks
            SET lease_expiry = $4, status = 'in_progress', updated_at = $5
            WHERE id = $1 AND epoch = $2 AND worker_id = $3
              AND status IN {} AND lease_expiry > $5
            RETURNING *
            "#,
            ACTIVE_STATUSES
        ))
        .bind(id.as_uuid())
        .bind(epoch)
        .bind(worker_id)
        .bind(lease_expiry)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Task::try_from(row),
            None => {
                // Distinguish an unknown id from a lost lease.
                self.get_task(id).await?;
                Err(DbError::LeaseExpired(id))
            }
        }
    }

    async fn finish_task(
        &self,
        id: ResourceId,
        epoch: i64,
        result: &TaskResult,
        effects: &[CompletionEffect],
        now: DateTime<Utc>,
    ) -> DbResult<Task> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        let current = Task::try_from(current)?;

        if current.is_terminal() {
            return Err(DbError::AlreadyTerminal(id));
        }
        if !current.status.is_active() || current.epoch != epoch {
            return Err(DbError::StaleCompletion {
                task_id: id,
                reported: epoch,
                current: current.epoch,
            });
        }

        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = $2, result = $3, worker_id = NULL, assigned_at = NULL,
                lease_expiry = NULL, updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(result.status().as_str())
        .bind(serde_json::to_value(result)?)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let finished = Task::try_from(row)?;

        for effect in effects {
            apply_effect(&mut tx, &finished, effect, now).await?;
        }

        tx.commit().await?;

        if effects
            .iter()
            .any(|e| matches!(e, CompletionEffect::ArmGracePeriod { .. }))
        {
            return self.get_task(id).await;
        }
        Ok(finished)
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> DbResult<Vec<LeaseSnapshot>> {
        let rows = sqlx::query_as::<_, LeaseRow>(&format!(
            r#"
            SELECT id, epoch, worker_id, assigned_at, lease_expiry FROM tasks
            WHERE status IN {} AND lease_expiry <= $1
            ORDER BY lease_expiry
            "#,
            ACTIVE_STATUSES
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LeaseSnapshot::try_from).collect()
    }

    async fn leases_for_worker(&self, worker_id: &str) -> DbResult<Vec<LeaseSnapshot>> {
        let rows = sqlx::query_as::<_, LeaseRow>(&format!(
            r#"
            SELECT id, epoch, worker_id, assigned_at, lease_expiry FROM tasks
            WHERE status IN {} AND worker_id = $1
            ORDER BY seq
            "#,
            ACTIVE_STATUSES
        ))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LeaseSnapshot::try_from).collect()
    }

    async fn requeue(&self, guard: &RequeueGuard, now: DateTime<Utc>) -> DbResult<bool> {
        let reset = format!(
            r#"
            UPDATE tasks
            SET status = 'pending', worker_id = NULL, assigned_at = NULL,
                lease_expiry = NULL, updated_at = $3
            WHERE id = $1 AND epoch = $2 AND status IN {}
            "#,
            ACTIVE_STATUSES
        );

        let updated = match guard {
            RequeueGuard::Expired { task_id, epoch } => {
                sqlx::query(&format!("{} AND lease_expiry <= $3", reset))
                    .bind(task_id.as_uuid())
                    .bind(epoch)
                    .bind(now)
                    .execute(&self.pool)
                    .await?
            }
            RequeueGuard::Abandoned {
                task_id,
                epoch,
                worker_id,
                assigned_before,
            } => {
                sqlx::query(&format!(
                    "{} AND worker_id = $4 AND assigned_at <= $5",
                    reset
                ))
                .bind(task_id.as_uuid())
                .bind(epoch)
                .bind(now)
                .bind(worker_id)
                .bind(assigned_before)
                .execute(&self.pool)
                .await?
            }
        };
        let requeued = updated.rows_affected() == 1;
        if !requeued {
            debug!(task_id = %guard.task_id(), "Requeue lost to a newer transition");
        }
        Ok(requeued)
    }
}
