//! Builds and their submission payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::task::Task;
use crate::{Error, ResourceId, Result};

/// A build record. Its build tasks live in the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub cancelled: bool,
    /// Set once a sign task for this build completes.
    pub signed: bool,
    pub created_at: DateTime<Utc>,
    /// Stamped when every task of the build is terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

/// A build together with its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDetails {
    #[serde(flatten)]
    pub build: Build,
    pub tasks: Vec<Task>,
}

/// A build submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBuild {
    pub tasks: Vec<NewBuildTask>,
}

/// One task of a build submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBuildTask {
    pub arch: String,
    pub source_ref: String,
    /// Indices into `NewBuild::tasks` that must finish first.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl NewBuild {
    /// Reject empty builds, dangling dependency indices and cycles.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Validation("build has no tasks".to_string()));
        }

        for (idx, task) in self.tasks.iter().enumerate() {
            if task.arch.trim().is_empty() {
                return Err(Error::Validation(format!("task {} has no arch", idx)));
            }
            if task.source_ref.trim().is_empty() {
                return Err(Error::Validation(format!("task {} has no source ref", idx)));
            }
            for dep in &task.depends_on {
                if *dep >= self.tasks.len() {
                    return Err(Error::Validation(format!(
                        "task {} depends on unknown task {}",
                        idx, dep
                    )));
                }
            }
        }

        if let Some(cycle) = detect_cycle(&self.tasks) {
            return Err(Error::Validation(format!(
                "cycle detected in task dependencies: {}",
                cycle
            )));
        }

        Ok(())
    }
}

/// Detect cycles in the task dependency graph using DFS.
fn detect_cycle(tasks: &[NewBuildTask]) -> Option<String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    for idx in 0..tasks.len() {
        if !visited.contains_key(&idx) {
            if let Some(cycle) = dfs_detect_cycle(idx, tasks, &mut visited, &mut rec_stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_detect_cycle(
    node: usize,
    tasks: &[NewBuildTask],
    visited: &mut HashMap<usize, bool>,
    rec_stack: &mut HashMap<usize, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    for &dep in &tasks[node].depends_on {
        if !visited.contains_key(&dep) {
            if let Some(cycle) = dfs_detect_cycle(dep, tasks, visited, rec_stack) {
                return Some(cycle);
            }
        } else if rec_stack.get(&dep).copied().unwrap_or(false) {
            return Some(format!("{} -> {}", node, dep));
        }
    }

    rec_stack.insert(node, false);
    None
}
