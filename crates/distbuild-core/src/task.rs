//! Tasks: the unit of assignable work.
//!
//! Build, sign and key-generation tasks share one status lifecycle and
//! differ only in their payload. A task is handed to at most one worker at
//! a time under a lease; every fresh hand-out bumps the task's epoch so
//! that reports from a superseded lease can be told apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::product::SignKey;
use crate::{Error, ResourceId};

/// Reason recorded on tasks cancelled through their parent build.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses that carry a lease.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown task status: {}", other))),
        }
    }
}

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Build,
    Sign,
    GenKey,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Build => "build",
            TaskKind::Sign => "sign",
            TaskKind::GenKey => "gen_key",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(TaskKind::Build),
            "sign" => Ok(TaskKind::Sign),
            "gen_key" => Ok(TaskKind::GenKey),
            other => Err(Error::Validation(format!("unknown task kind: {}", other))),
        }
    }
}

/// Something a worker can do. Tasks require a set of these; a worker
/// declares the set it holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Capability {
    /// Can build for the given architecture.
    Arch(String),
    /// Holds the signing key with the given id.
    SigningKey(String),
    /// Can generate signing keys.
    KeyGeneration,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Arch(arch) => write!(f, "arch:{}", arch),
            Capability::SigningKey(key_id) => write!(f, "key:{}", key_id),
            Capability::KeyGeneration => f.write_str("keygen"),
        }
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "keygen" {
            return Ok(Capability::KeyGeneration);
        }
        match s.split_once(':') {
            Some(("arch", arch)) if !arch.is_empty() => Ok(Capability::Arch(arch.to_string())),
            Some(("key", key_id)) if !key_id.is_empty() => {
                Ok(Capability::SigningKey(key_id.to_string()))
            }
            _ => Err(Error::Validation(format!("unknown capability: {}", s))),
        }
    }
}

impl From<Capability> for String {
    fn from(capability: Capability) -> Self {
        capability.to_string()
    }
}

impl TryFrom<String> for Capability {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// An ordered set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    /// True when every capability in `required` is held by `self`.
    pub fn satisfies(&self, required: &CapabilitySet) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// String form used for storage and wire transfer.
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(Capability::to_string).collect()
    }

    pub fn from_strings<I, S>(values: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        values
            .into_iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A package produced by a build task or consumed by a sign task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    /// Location in the artifact repository.
    pub href: String,
}

/// Kind-specific content handed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Build {
        arch: String,
        source_ref: String,
    },
    Sign {
        key_id: String,
        packages: Vec<PackageRef>,
    },
    GenKey {
        product_name: String,
        user_name: String,
        user_email: String,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Build { .. } => TaskKind::Build,
            TaskPayload::Sign { .. } => TaskKind::Sign,
            TaskPayload::GenKey { .. } => TaskKind::GenKey,
        }
    }

    /// Capabilities a worker must hold to be handed this task.
    pub fn requirements(&self) -> CapabilitySet {
        match self {
            TaskPayload::Build { arch, .. } => [Capability::Arch(arch.clone())].into_iter().collect(),
            TaskPayload::Sign { key_id, .. } => {
                [Capability::SigningKey(key_id.clone())].into_iter().collect()
            }
            TaskPayload::GenKey { .. } => [Capability::KeyGeneration].into_iter().collect(),
        }
    }
}

/// What a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TaskParent {
    Build(ResourceId),
    Product(ResourceId),
}

impl TaskParent {
    pub fn id(&self) -> ResourceId {
        match self {
            TaskParent::Build(id) | TaskParent::Product(id) => *id,
        }
    }

    pub fn build_id(&self) -> Option<ResourceId> {
        match self {
            TaskParent::Build(id) => Some(*id),
            TaskParent::Product(_) => None,
        }
    }
}

/// An exclusive, time-bounded claim on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub worker_id: String,
    pub assigned_at: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
}

/// Recorded once a task reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResult {
    Succeeded {
        artifacts: Vec<PackageRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sign_key: Option<SignKey>,
    },
    Failed {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_ref: Option<String>,
    },
    Cancelled {
        reason: String,
    },
}

impl TaskResult {
    /// Terminal status this result belongs to.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskResult::Succeeded { .. } => TaskStatus::Done,
            TaskResult::Failed { .. } => TaskStatus::Failed,
            TaskResult::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            TaskResult::Succeeded { .. } => None,
            TaskResult::Failed { error, .. } => Some(error),
            TaskResult::Cancelled { reason } => Some(reason),
        }
    }
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: ResourceId,
    pub parent: TaskParent,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub requirements: CapabilitySet,
    /// Set only while the status is assigned or in progress.
    pub assignment: Option<Assignment>,
    /// Incremented on each fresh assignment.
    pub epoch: i64,
    pub result: Option<TaskResult>,
    /// Sibling tasks that must be done before this one is eligible.
    pub depends_on: Vec<ResourceId>,
    /// Grace window during which a signed artifact is still referenced.
    pub grace_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active()
            && self
                .assignment
                .as_ref()
                .is_some_and(|a| a.lease_expiry <= now)
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.worker_id.as_str())
    }
}

/// A task about to be created.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub parent: TaskParent,
    pub payload: TaskPayload,
    pub depends_on: Vec<ResourceId>,
}

impl NewTask {
    pub fn new(parent: TaskParent, payload: TaskPayload) -> Self {
        Self {
            parent,
            payload,
            depends_on: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, depends_on: Vec<ResourceId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Materialize as a pending task with a pre-allocated id.
    pub fn into_task(self, id: ResourceId, now: DateTime<Utc>) -> Task {
        let requirements = self.payload.requirements();
        Task {
            id,
            parent: self.parent,
            payload: self.payload,
            status: TaskStatus::Pending,
            requirements,
            assignment: None,
            epoch: 0,
            result: None,
            depends_on: self.depends_on,
            grace_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn build_payload(arch: &str) -> TaskPayload {
        TaskPayload::Build {
            arch: arch.to_string(),
            source_ref: "https://git.example.org/rpms/bash.git#c8".to_string(),
        }
    }

    #[test]
    fn test_status_lifecycle_classes() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Pending.is_active());
        assert!(TaskStatus::Assigned.is_active());
        assert!(TaskStatus::InProgress.is_active());
        for status in [TaskStatus::Done, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
    }

    #[test]
    fn test_status_string_form() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_capability_parsing() {
        assert_eq!(
            "arch:x86_64".parse::<Capability>().unwrap(),
            Capability::Arch("x86_64".to_string())
        );
        assert_eq!(
            "key:51D6647EC21AD6EA".parse::<Capability>().unwrap(),
            Capability::SigningKey("51D6647EC21AD6EA".to_string())
        );
        assert_eq!(
            "keygen".parse::<Capability>().unwrap(),
            Capability::KeyGeneration
        );
        assert!("arch:".parse::<Capability>().is_err());
        assert!("gpu:a100".parse::<Capability>().is_err());
    }

    #[test]
    fn test_capability_serializes_as_string() {
        let json = serde_json::to_string(&Capability::Arch("aarch64".to_string())).unwrap();
        assert_eq!(json, r#""arch:aarch64""#);
        let set: CapabilitySet = serde_json::from_str(r#"["key:ABC","arch:i686"]"#).unwrap();
        assert!(set.contains(&Capability::SigningKey("ABC".to_string())));
        assert!(set.contains(&Capability::Arch("i686".to_string())));
    }

    #[test]
    fn test_worker_must_hold_every_required_capability() {
        let worker: CapabilitySet = [
            Capability::Arch("x86_64".to_string()),
            Capability::Arch("i686".to_string()),
        ]
        .into_iter()
        .collect();

        assert!(worker.satisfies(&build_payload("i686").requirements()));
        assert!(!worker.satisfies(&build_payload("ppc64le").requirements()));
        assert!(worker.satisfies(&CapabilitySet::new()));
    }

    #[test]
    fn test_payload_requirements_by_kind() {
        let sign = TaskPayload::Sign {
            key_id: "ABC".to_string(),
            packages: vec![],
        };
        assert_eq!(sign.kind(), TaskKind::Sign);
        assert_eq!(sign.requirements().to_strings(), vec!["key:ABC"]);

        let gen_key = TaskPayload::GenKey {
            product_name: "community-product".to_string(),
            user_name: "maintainer".to_string(),
            user_email: "maintainer@example.org".to_string(),
        };
        assert_eq!(gen_key.requirements().to_strings(), vec!["keygen"]);
    }

    #[test]
    fn test_new_task_starts_pending_without_lease() {
        let now = Utc::now();
        let task = NewTask::new(TaskParent::Build(ResourceId::new()), build_payload("x86_64"))
            .into_task(ResourceId::new(), now);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.epoch, 0);
        assert!(task.assignment.is_none());
        assert!(task.result.is_none());
        assert_eq!(task.requirements.to_strings(), vec!["arch:x86_64"]);
    }

    #[test]
    fn test_lease_expiry_only_applies_to_active_tasks() {
        let now = Utc::now();
        let mut task = NewTask::new(TaskParent::Build(ResourceId::new()), build_payload("x86_64"))
            .into_task(ResourceId::new(), now);
        task.status = TaskStatus::Assigned;
        task.assignment = Some(Assignment {
            worker_id: "node-1".to_string(),
            assigned_at: now - Duration::seconds(60),
            lease_expiry: now - Duration::seconds(1),
        });
        assert!(task.lease_expired(now));

        task.status = TaskStatus::Done;
        assert!(!task.lease_expired(now));
    }

    #[test]
    fn test_result_maps_to_terminal_status() {
        let failed = TaskResult::Failed {
            error: "mock exited with 1".to_string(),
            log_ref: None,
        };
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert_eq!(failed.error_message(), Some("mock exited with 1"));

        let cancelled = TaskResult::Cancelled {
            reason: CANCELLED_BY_USER.to_string(),
        };
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);
    }
}
