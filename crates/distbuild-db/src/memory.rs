//! In-memory store.
//!
//! Implements every repository trait behind a single mutex, so each call
//! is one unit of work. Used by tests and by single-process deployments
//! without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use distbuild_core::ResourceId;
use distbuild_core::build::{Build, BuildDetails, NewBuild};
use distbuild_core::errata::{ErrataRecord, NewErrataRecord, ReleaseStart, ReleaseStatus};
use distbuild_core::product::{NewProduct, Product, ProductChange};
use distbuild_core::task::{
    Assignment, NewTask, Task, TaskKind, TaskParent, TaskPayload, TaskResult, TaskStatus,
};
use tracing::{debug, info};

use crate::repo::{
    ClaimRequest, CompletionEffect, ErrataRepo, LeaseSnapshot, ProductRepo, RequeueGuard,
    TaskFilter, TaskStore,
};
use crate::{DbError, DbResult};

#[derive(Debug, Clone, Default)]
struct State {
    builds: HashMap<ResourceId, Build>,
    /// Insertion order is hand-out order.
    tasks: Vec<Task>,
    products: HashMap<ResourceId, Product>,
    errata: BTreeMap<String, ErrataRecord>,
}

impl State {
    fn task(&self, id: ResourceId) -> DbResult<&Task> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))
    }

    fn task_mut(&mut self, id: ResourceId) -> DbResult<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))
    }

    fn build_tasks(&self, build_id: ResourceId) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .filter(move |t| t.parent == TaskParent::Build(build_id))
    }

    fn details(&self, build_id: ResourceId) -> DbResult<BuildDetails> {
        let build = self
            .builds
            .get(&build_id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", build_id)))?;
        Ok(BuildDetails {
            build: build.clone(),
            tasks: self.build_tasks(build_id).cloned().collect(),
        })
    }

    /// A dependency that no longer exists does not block.
    fn dependencies_done(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.tasks
                .iter()
                .find(|t| t.id == *dep)
                .is_none_or(|t| t.status == TaskStatus::Done)
        })
    }

    fn apply_effect(
        &mut self,
        task_id: ResourceId,
        effect: &CompletionEffect,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        match effect {
            CompletionEffect::SettleBuild(build_id) => {
                let settled = self
                    .build_tasks(*build_id)
                    .filter(|t| t.kind() == TaskKind::Build)
                    .all(Task::is_terminal);
                if let Some(build) = self.builds.get_mut(build_id) {
                    if settled && build.finished_at.is_none() {
                        build.finished_at = Some(now);
                    }
                }
            }
            CompletionEffect::FailDependents { reason } => {
                let mut doomed: HashSet<ResourceId> = HashSet::from([task_id]);
                loop {
                    let next: Vec<ResourceId> = self
                        .tasks
                        .iter()
                        .filter(|t| t.status == TaskStatus::Pending && !doomed.contains(&t.id))
                        .filter(|t| t.depends_on.iter().any(|d| doomed.contains(d)))
                        .map(|t| t.id)
                        .collect();
                    if next.is_empty() {
                        break;
                    }
                    doomed.extend(next);
                }
                doomed.remove(&task_id);
                for task in self.tasks.iter_mut().filter(|t| doomed.contains(&t.id)) {
                    task.status = TaskStatus::Failed;
                    task.result = Some(TaskResult::Failed {
                        error: reason.clone(),
                        log_ref: None,
                    });
                    task.updated_at = now;
                }
            }
            CompletionEffect::MarkBuildSigned(build_id) => {
                if let Some(build) = self.builds.get_mut(build_id) {
                    build.signed = true;
                }
            }
            CompletionEffect::ArmGracePeriod { until } => {
                self.task_mut(task_id)?.grace_until = Some(*until);
            }
            CompletionEffect::AttachSignKey { product_id, key } => {
                let product = self
                    .products
                    .get_mut(product_id)
                    .ok_or_else(|| DbError::NotFound(format!("product {}", product_id)))?;
                product.sign_key = Some(key.clone());
            }
        }
        Ok(())
    }
}

fn snapshot(task: &Task) -> Option<LeaseSnapshot> {
    let assignment = task.assignment.as_ref()?;
    task.status.is_active().then(|| LeaseSnapshot {
        task_id: task.id,
        epoch: task.epoch,
        worker_id: assignment.worker_id.clone(),
        assigned_at: assignment.assigned_at,
        lease_expiry: assignment.lease_expiry,
    })
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> DbResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| DbError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_build(&self, build: &NewBuild, now: DateTime<Utc>) -> DbResult<BuildDetails> {
        let mut state = self.state()?;
        let build_id = ResourceId::new();
        state.builds.insert(
            build_id,
            Build {
                id: build_id,
                cancelled: false,
                signed: false,
                created_at: now,
                finished_at: None,
            },
        );

        let ids: Vec<ResourceId> = build.tasks.iter().map(|_| ResourceId::new()).collect();
        for (idx, entry) in build.tasks.iter().enumerate() {
            let task = NewTask::new(
                TaskParent::Build(build_id),
                TaskPayload::Build {
                    arch: entry.arch.clone(),
                    source_ref: entry.source_ref.clone(),
                },
            )
            .with_dependencies(entry.depends_on.iter().filter_map(|d| ids.get(*d).copied()).collect())
            .into_task(ids[idx], now);
            state.tasks.push(task);
        }

        state.details(build_id)
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<BuildDetails> {
        self.state()?.details(id)
    }

    async fn remove_build(&self, id: ResourceId) -> DbResult<()> {
        let mut state = self.state()?;
        if !state.builds.contains_key(&id) {
            return Err(DbError::NotFound(format!("build {}", id)));
        }
        let active = state
            .build_tasks(id)
            .filter(|t| t.status.is_active())
            .count();
        if active > 0 {
            return Err(DbError::Conflict(format!(
                "build {} has {} task(s) in flight",
                id, active
            )));
        }
        state.tasks.retain(|t| t.parent != TaskParent::Build(id));
        state.builds.remove(&id);
        for product in state.products.values_mut() {
            product.builds.retain(|b| *b != id);
        }
        info!(build_id = %id, "Removed build");
        Ok(())
    }

    async fn cancel_build(
        &self,
        id: ResourceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<ResourceId>> {
        let mut state = self.state()?;
        let build = state
            .builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        build.cancelled = true;
        build.finished_at.get_or_insert(now);

        let mut cancelled = Vec::new();
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.parent == TaskParent::Build(id) && !t.is_terminal())
        {
            task.status = TaskStatus::Cancelled;
            task.result = Some(TaskResult::Cancelled {
                reason: reason.to_string(),
            });
            task.assignment = None;
            task.updated_at = now;
            cancelled.push(task.id);
        }
        Ok(cancelled)
    }

    async fn create_task(&self, task: NewTask, now: DateTime<Utc>) -> DbResult<Task> {
        let task = task.into_task(ResourceId::new(), now);
        self.state()?.tasks.push(task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: ResourceId) -> DbResult<Task> {
        self.state()?.task(id).cloned()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> DbResult<Vec<Task>> {
        let state = self.state()?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| filter.parent.is_none_or(|p| t.parent.id() == p))
            .filter(|t| filter.kind.is_none_or(|k| t.kind() == k))
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect())
    }

    async fn claim_next(&self, claim: &ClaimRequest) -> DbResult<Option<Task>> {
        let mut state = self.state()?;
        let Some(idx) = state.tasks.iter().position(|t| {
            t.status == TaskStatus::Pending
                && t.kind() == claim.kind
                && claim.capabilities.satisfies(&t.requirements)
                && state.dependencies_done(t)
        }) else {
            return Ok(None);
        };

        let task = &mut state.tasks[idx];
        task.status = TaskStatus::Assigned;
        task.epoch += 1;
        task.assignment = Some(Assignment {
            worker_id: claim.worker_id.clone(),
            assigned_at: claim.now,
            lease_expiry: claim.lease_expiry,
        });
        task.updated_at = claim.now;
        Ok(Some(task.clone()))
    }

    async fn extend_lease(
        &self,
        id: ResourceId,
        epoch: i64,
        worker_id: &str,
        lease_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Task> {
        let mut state = self.state()?;
        let task = state.task_mut(id)?;
        let held = task.status.is_active()
            && task.epoch == epoch
            && task.worker_id() == Some(worker_id)
            && !task.lease_expired(now);
        if !held {
            return Err(DbError::LeaseExpired(id));
        }
        task.status = TaskStatus::InProgress;
        if let Some(assignment) = task.assignment.as_mut() {
            assignment.lease_expiry = lease_expiry;
        }
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn finish_task(
        &self,
        id: ResourceId,
        epoch: i64,
        result: &TaskResult,
        effects: &[CompletionEffect],
        now: DateTime<Utc>,
    ) -> DbResult<Task> {
        let mut state = self.state()?;
        let current = state.task(id)?;
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

        // Work on a copy so a failing effect leaves nothing behind.
        let mut next = state.clone();
        let task = next.task_mut(id)?;
        task.status = result.status();
        task.result = Some(result.clone());
        task.assignment = None;
        task.updated_at = now;
        for effect in effects {
            next.apply_effect(id, effect, now)?;
        }

        let finished = next.task(id)?.clone();
        *state = next;
        Ok(finished)
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> DbResult<Vec<LeaseSnapshot>> {
        let state = self.state()?;
        let mut leases: Vec<LeaseSnapshot> = state
            .tasks
            .iter()
            .filter(|t| t.lease_expired(now))
            .filter_map(snapshot)
            .collect();
        leases.sort_by_key(|l| l.lease_expiry);
        Ok(leases)
    }

    async fn leases_for_worker(&self, worker_id: &str) -> DbResult<Vec<LeaseSnapshot>> {
        let state = self.state()?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.worker_id() == Some(worker_id))
            .filter_map(snapshot)
            .collect())
    }

    async fn requeue(&self, guard: &RequeueGuard, now: DateTime<Utc>) -> DbResult<bool> {
        let mut state = self.state()?;
        let task = state.task_mut(guard.task_id())?;
        let Some(lease) = snapshot(task) else {
            return Ok(false);
        };

        let holds = match guard {
            RequeueGuard::Expired { epoch, .. } => {
                lease.epoch == *epoch && lease.lease_expiry <= now
            }
            RequeueGuard::Abandoned {
                epoch,
                worker_id,
                assigned_before,
                ..
            } => {
                lease.epoch == *epoch
                    && lease.worker_id == *worker_id
                    && lease.assigned_at <= *assigned_before
            }
        };
        if !holds {
            debug!(
                task_id = %lease.task_id,
                epoch = lease.epoch,
                "Requeue lost to a newer transition"
            );
            return Ok(false);
        }

        task.status = TaskStatus::Pending;
        task.assignment = None;
        task.updated_at = now;
        Ok(true)
    }
}

#[async_trait]
impl ProductRepo for MemoryStore {
    async fn create(&self, product: &NewProduct, now: DateTime<Utc>) -> DbResult<(Product, Task)> {
        let mut state = self.state()?;
        if state.products.values().any(|p| p.name == product.name) {
            return Err(DbError::Duplicate(format!("product {}", product.name)));
        }
        let created = Product {
            id: ResourceId::new(),
            name: product.name.clone(),
            owner: product.owner.clone(),
            is_community: product.is_community,
            sign_key: None,
            builds: Vec::new(),
            created_at: now,
        };
        let task = created.gen_key_task().into_task(ResourceId::new(), now);
        state.products.insert(created.id, created.clone());
        state.tasks.push(task.clone());
        Ok((created, task))
    }

    async fn get(&self, id: ResourceId) -> DbResult<Product> {
        self.state()?
            .products
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("product {}", id)))
    }

    async fn get_by_name(&self, name: &str) -> DbResult<Product> {
        self.state()?
            .products
            .values()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("product {}", name)))
    }

    async fn change_builds(
        &self,
        product_id: ResourceId,
        build_id: ResourceId,
        change: ProductChange,
        _now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut state = self.state()?;
        if !state.builds.contains_key(&build_id) {
            return Err(DbError::NotFound(format!("build {}", build_id)));
        }
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| DbError::NotFound(format!("product {}", product_id)))?;

        let present = product.builds.contains(&build_id);
        match change {
            ProductChange::Add if !present => product.builds.push(build_id),
            ProductChange::Remove if present => product.builds.retain(|b| *b != build_id),
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn remove(&self, id: ResourceId) -> DbResult<()> {
        let mut state = self.state()?;
        if !state.products.contains_key(&id) {
            return Err(DbError::NotFound(format!("product {}", id)));
        }
        let parent = TaskParent::Product(id);
        if state
            .tasks
            .iter()
            .any(|t| t.parent == parent && t.status.is_active())
        {
            return Err(DbError::Conflict(format!(
                "product {} has a key generation task in flight",
                id
            )));
        }
        state.tasks.retain(|t| t.parent != parent);
        state.products.remove(&id);
        info!(product_id = %id, "Removed product");
        Ok(())
    }
}

#[async_trait]
impl ErrataRepo for MemoryStore {
    async fn create(
        &self,
        record: &NewErrataRecord,
        now: DateTime<Utc>,
    ) -> DbResult<ErrataRecord> {
        let mut state = self.state()?;
        if state.errata.contains_key(&record.id) {
            return Err(DbError::Duplicate(format!("errata record {}", record.id)));
        }
        let created = ErrataRecord {
            id: record.id.clone(),
            platform: record.platform.clone(),
            title: record.title.clone(),
            packages: record.packages.clone(),
            release_status: ReleaseStatus::NotReleased,
            last_release_log: None,
            updated_at: now,
        };
        state.errata.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn get(&self, id: &str) -> DbResult<ErrataRecord> {
        self.state()?
            .errata
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("errata record {}", id)))
    }

    async fn list(&self, status: Option<ReleaseStatus>) -> DbResult<Vec<ErrataRecord>> {
        Ok(self
            .state()?
            .errata
            .values()
            .filter(|r| status.is_none_or(|s| r.release_status == s))
            .cloned()
            .collect())
    }

    async fn begin_release(&self, id: &str, now: DateTime<Utc>) -> DbResult<ReleaseStart> {
        let mut state = self.state()?;
        let Some(record) = state.errata.get_mut(id) else {
            return Ok(ReleaseStart::NotFound);
        };
        if record.release_status == ReleaseStatus::InProgress {
            return Ok(ReleaseStart::AlreadyInProgress);
        }
        record.release_status = ReleaseStatus::InProgress;
        record.last_release_log = None;
        record.updated_at = now;
        Ok(ReleaseStart::Started)
    }

    async fn finish_release(
        &self,
        id: &str,
        status: ReleaseStatus,
        log: &str,
        now: DateTime<Utc>,
    ) -> DbResult<ErrataRecord> {
        let mut state = self.state()?;
        let record = state
            .errata
            .get_mut(id)
            .ok_or_else(|| DbError::NotFound(format!("errata record {}", id)))?;
        record.release_status = status;
        record.last_release_log = Some(log.to_string());
        record.updated_at = now;
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use distbuild_core::build::NewBuildTask;
    use distbuild_core::product::{ProductOwner, SignKey};
    use distbuild_core::task::CapabilitySet;

    fn build_task(arch: &str, depends_on: Vec<usize>) -> NewBuildTask {
        NewBuildTask {
            arch: arch.to_string(),
            source_ref: format!("https://git.example.org/rpms/{}.git", arch),
            depends_on,
        }
    }

    fn claim(worker: &str, caps: &[&str], now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            kind: TaskKind::Build,
            worker_id: worker.to_string(),
            capabilities: CapabilitySet::from_strings(caps).unwrap(),
            now,
            lease_expiry: now + Duration::seconds(300),
        }
    }

    fn succeeded() -> TaskResult {
        TaskResult::Succeeded {
            artifacts: vec![],
            sign_key: None,
        }
    }

    #[tokio::test]
    async fn test_claim_respects_order_and_capabilities() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let build = NewBuild {
            tasks: vec![build_task("aarch64", vec![]), build_task("x86_64", vec![])],
        };
        let details = store.create_build(&build, now).await.unwrap();

        let task = store
            .claim_next(&claim("node-1", &["arch:x86_64"], now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, details.tasks[1].id);
        assert_eq!(task.epoch, 1);
        assert_eq!(task.worker_id(), Some("node-1"));

        let none = store
            .claim_next(&claim("node-2", &["arch:x86_64"], now))
            .await
            .unwrap();
        assert!(none.is_none());

        let multi = store
            .claim_next(&claim("node-3", &["arch:x86_64", "arch:aarch64"], now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(multi.id, details.tasks[0].id);
    }

    #[tokio::test]
    async fn test_dependencies_gate_eligibility() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let build = NewBuild {
            tasks: vec![build_task("x86_64", vec![1]), build_task("x86_64", vec![])],
        };
        let details = store.create_build(&build, now).await.unwrap();
        let caps = ["arch:x86_64"];

        let first = store
            .claim_next(&claim("node-1", &caps, now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, details.tasks[1].id);
        assert!(
            store
                .claim_next(&claim("node-1", &caps, now))
                .await
                .unwrap()
                .is_none()
        );

        store
            .finish_task(first.id, first.epoch, &succeeded(), &[], now)
            .await
            .unwrap();
        let second = store
            .claim_next(&claim("node-1", &caps, now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, details.tasks[0].id);
    }

    #[tokio::test]
    async fn test_finish_rejects_stale_and_terminal() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let build = NewBuild {
            tasks: vec![build_task("x86_64", vec![])],
        };
        store.create_build(&build, now).await.unwrap();
        let task = store
            .claim_next(&claim("node-1", &["arch:x86_64"], now))
            .await
            .unwrap()
            .unwrap();

        let stale = store
            .finish_task(task.id, 7, &succeeded(), &[], now)
            .await
            .unwrap_err();
        assert!(matches!(
            stale,
            DbError::StaleCompletion {
                reported: 7,
                current: 1,
                ..
            }
        ));

        let done = store
            .finish_task(task.id, 1, &succeeded(), &[], now)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.assignment.is_none());

        let again = store
            .finish_task(task.id, 1, &succeeded(), &[], now)
            .await
            .unwrap_err();
        assert!(matches!(again, DbError::AlreadyTerminal(_)));
    }

    #[tokio::test]
    async fn test_failed_task_cascades_to_dependents() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let build = NewBuild {
            tasks: vec![
                build_task("x86_64", vec![]),
                build_task("x86_64", vec![0]),
                build_task("x86_64", vec![1]),
                build_task("aarch64", vec![]),
            ],
        };
        let details = store.create_build(&build, now).await.unwrap();
        let build_id = details.build.id;
        let root = store
            .claim_next(&claim("node-1", &["arch:x86_64"], now))
            .await
            .unwrap()
            .unwrap();

        let failed = TaskResult::Failed {
            error: "mock exited 1".to_string(),
            log_ref: None,
        };
        let effects = [
            CompletionEffect::FailDependents {
                reason: "dependency failed".to_string(),
            },
            CompletionEffect::SettleBuild(build_id),
        ];
        store
            .finish_task(root.id, root.epoch, &failed, &effects, now)
            .await
            .unwrap();

        let after = store.get_build(build_id).await.unwrap();
        let statuses: Vec<TaskStatus> = after.tasks.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Failed,
                TaskStatus::Failed,
                TaskStatus::Failed,
                TaskStatus::Pending,
            ]
        );
        assert!(after.build.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_failing_effect_rolls_back_transition() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let product_id = ResourceId::new();
        store
            .create_task(
                NewTask::new(
                    TaskParent::Product(product_id),
                    TaskPayload::GenKey {
                        product_name: "ghost".to_string(),
                        user_name: "nobody".to_string(),
                        user_email: "nobody@example.org".to_string(),
                    },
                ),
                now,
            )
            .await
            .unwrap();
        let mut request = claim("signer", &["keygen"], now);
        request.kind = TaskKind::GenKey;
        let task = store.claim_next(&request).await.unwrap().unwrap();

        let key = SignKey {
            keyid: "ABCD1234".to_string(),
            fingerprint: "0123456789ABCDEF".to_string(),
            public_url: "https://keys.example.org/ABCD1234.asc".to_string(),
        };
        let result = TaskResult::Succeeded {
            artifacts: vec![],
            sign_key: Some(key.clone()),
        };
        let effects = [CompletionEffect::AttachSignKey { product_id, key }];
        let err = store
            .finish_task(task.id, task.epoch, &result, &effects, now)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));

        let unchanged = store.get_task(task.id).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_cancel_and_remove_build() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let build = NewBuild {
            tasks: vec![build_task("x86_64", vec![]), build_task("x86_64", vec![])],
        };
        let details = store.create_build(&build, now).await.unwrap();
        let id = details.build.id;
        store
            .claim_next(&claim("node-1", &["arch:x86_64"], now))
            .await
            .unwrap()
            .unwrap();

        let err = store.remove_build(id).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        let cancelled = store
            .cancel_build(id, "cancelled by user", now)
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 2);
        let again = store
            .cancel_build(id, "cancelled by user", now)
            .await
            .unwrap();
        assert!(again.is_empty());

        let after = store.get_build(id).await.unwrap();
        assert!(after.build.cancelled);
        assert!(after.tasks.iter().all(|t| t.assignment.is_none()));

        store.remove_build(id).await.unwrap();
        assert!(matches!(
            store.get_build(id).await.unwrap_err(),
            DbError::NotFound(_)
        ));
        assert!(store.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_guards() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let build = NewBuild {
            tasks: vec![build_task("x86_64", vec![])],
        };
        store.create_build(&build, now).await.unwrap();
        let task = store
            .claim_next(&claim("node-1", &["arch:x86_64"], now))
            .await
            .unwrap()
            .unwrap();

        // Not expired yet.
        let expired = RequeueGuard::Expired {
            task_id: task.id,
            epoch: task.epoch,
        };
        assert!(!store.requeue(&expired, now).await.unwrap());

        let abandoned = RequeueGuard::Abandoned {
            task_id: task.id,
            epoch: task.epoch,
            worker_id: "node-2".to_string(),
            assigned_before: now,
        };
        assert!(!store.requeue(&abandoned, now).await.unwrap());

        let later = now + Duration::seconds(301);
        assert_eq!(store.expired_leases(later).await.unwrap().len(), 1);
        assert!(store.requeue(&expired, later).await.unwrap());
        assert!(!store.requeue(&expired, later).await.unwrap());

        let requeued = store.get_task(task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.epoch, 1);
    }

    #[tokio::test]
    async fn test_extend_lease_requires_current_holder() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let build = NewBuild {
            tasks: vec![build_task("x86_64", vec![])],
        };
        store.create_build(&build, now).await.unwrap();
        let task = store
            .claim_next(&claim("node-1", &["arch:x86_64"], now))
            .await
            .unwrap()
            .unwrap();

        let extended = store
            .extend_lease(task.id, 1, "node-1", now + Duration::seconds(600), now)
            .await
            .unwrap();
        assert_eq!(extended.status, TaskStatus::InProgress);

        let wrong_worker = store
            .extend_lease(task.id, 1, "node-2", now + Duration::seconds(600), now)
            .await
            .unwrap_err();
        assert!(matches!(wrong_worker, DbError::LeaseExpired(_)));

        let late = now + Duration::seconds(700);
        let expired = store
            .extend_lease(task.id, 1, "node-1", late + Duration::seconds(300), late)
            .await
            .unwrap_err();
        assert!(matches!(expired, DbError::LeaseExpired(_)));
    }

    #[tokio::test]
    async fn test_errata_release_lifecycle() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = NewErrataRecord {
            id: "ALSA-2024:0001".to_string(),
            platform: "AlmaLinux-9".to_string(),
            title: "Important: openssl security update".to_string(),
            packages: vec!["openssl".to_string()],
        };
        ErrataRepo::create(&store, &record, now).await.unwrap();
        assert!(matches!(
            ErrataRepo::create(&store, &record, now).await.unwrap_err(),
            DbError::Duplicate(_)
        ));

        assert_eq!(
            store.begin_release("ALSA-2024:0001", now).await.unwrap(),
            ReleaseStart::Started
        );
        assert_eq!(
            store.begin_release("ALSA-2024:0001", now).await.unwrap(),
            ReleaseStart::AlreadyInProgress
        );
        assert_eq!(
            store.begin_release("ALSA-2024:9999", now).await.unwrap(),
            ReleaseStart::NotFound
        );

        let released = store
            .finish_release("ALSA-2024:0001", ReleaseStatus::Released, "ok", now)
            .await
            .unwrap();
        assert_eq!(released.release_status, ReleaseStatus::Released);
        assert_eq!(
            store
                .list(Some(ReleaseStatus::Released))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store.list(Some(ReleaseStatus::Failed)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_product_names_are_unique() {
        let store = MemoryStore::new();
        let product = NewProduct {
            name: "community-tools".to_string(),
            owner: ProductOwner {
                username: "alice".to_string(),
                email: "alice@example.org".to_string(),
            },
            is_community: true,
        };
        let (created, task) = ProductRepo::create(&store, &product, Utc::now())
            .await
            .unwrap();
        assert!(created.sign_key.is_none());
        assert_eq!(task.parent, TaskParent::Product(created.id));
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Pending);
        assert!(matches!(
            ProductRepo::create(&store, &product, Utc::now())
                .await
                .unwrap_err(),
            DbError::Duplicate(_)
        ));
    }

    #[tokio::test]
    async fn test_product_assembly_and_removal() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (product, gen_key) = ProductRepo::create(
            &store,
            &NewProduct {
                name: "bob-extras".to_string(),
                owner: ProductOwner {
                    username: "bob".to_string(),
                    email: "bob@example.org".to_string(),
                },
                is_community: true,
            },
            now,
        )
        .await
        .unwrap();
        let build = store
            .create_build(
                &NewBuild {
                    tasks: vec![build_task("x86_64", vec![])],
                },
                now,
            )
            .await
            .unwrap()
            .build
            .id;

        assert!(
            store
                .change_builds(product.id, build, ProductChange::Add, now)
                .await
                .unwrap()
        );
        assert!(
            !store
                .change_builds(product.id, build, ProductChange::Add, now)
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_by_name("bob-extras").await.unwrap().builds,
            vec![build]
        );
        assert!(matches!(
            store
                .change_builds(product.id, ResourceId::new(), ProductChange::Add, now)
                .await,
            Err(DbError::NotFound(_))
        ));

        // Removing the build takes it out of the product too.
        store.remove_build(build).await.unwrap();
        assert!(
            ProductRepo::get(&store, product.id)
                .await
                .unwrap()
                .builds
                .is_empty()
        );

        // A key generation task held by a worker blocks removal.
        let held = store
            .claim_next(&ClaimRequest {
                kind: TaskKind::GenKey,
                ..claim("sign-node-1", &["keygen"], now)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.id, gen_key.id);
        assert!(matches!(
            ProductRepo::remove(&store, product.id).await,
            Err(DbError::Conflict(_))
        ));
        store
            .finish_task(gen_key.id, 1, &succeeded(), &[], now)
            .await
            .unwrap();
        ProductRepo::remove(&store, product.id).await.unwrap();
        assert!(matches!(
            store.get_task(gen_key.id).await,
            Err(DbError::NotFound(_))
        ));
        assert!(matches!(
            store.get_by_name("bob-extras").await,
            Err(DbError::NotFound(_))
        ));
    }
}
