//! Completion reports submitted by workers.

use serde::{Deserialize, Serialize};

use crate::product::SignKey;
use crate::task::{PackageRef, TaskKind, TaskResult};
use crate::{Error, Result};

/// A worker's report that it finished (or gave up on) a task.
///
/// `epoch` is the epoch the worker was handed with the task; reports
/// carrying an older epoch are rejected as stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub epoch: i64,
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<PackageRef>,
    #[serde(default)]
    pub error: Option<String>,
    /// Reference to a build or signing log in the artifact repository.
    #[serde(default)]
    pub log_ref: Option<String>,
    /// Generated key; key-generation tasks only.
    #[serde(default)]
    pub sign_key: Option<SignKey>,
}

impl CompletionReport {
    pub fn succeeded(epoch: i64, artifacts: Vec<PackageRef>) -> Self {
        Self {
            epoch,
            success: true,
            artifacts,
            error: None,
            log_ref: None,
            sign_key: None,
        }
    }

    pub fn failed(epoch: i64, error: impl Into<String>) -> Self {
        Self {
            epoch,
            success: false,
            artifacts: Vec::new(),
            error: Some(error.into()),
            log_ref: None,
            sign_key: None,
        }
    }

    pub fn with_sign_key(mut self, key: SignKey) -> Self {
        self.sign_key = Some(key);
        self
    }

    /// Check the report is internally consistent for a task of `kind` and
    /// turn it into the result to record.
    pub fn validate(&self, kind: TaskKind) -> Result<TaskResult> {
        if self.epoch < 1 {
            return Err(Error::Validation(format!(
                "epoch must be positive, got {}",
                self.epoch
            )));
        }
        if self.sign_key.is_some() && kind != TaskKind::GenKey {
            return Err(Error::Validation(format!(
                "{} reports must not carry a sign key",
                kind
            )));
        }

        if !self.success {
            let error = self
                .error
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| {
                    Error::Validation("failed report must carry an error message".to_string())
                })?;
            if !self.artifacts.is_empty() {
                return Err(Error::Validation(
                    "failed report must not carry artifacts".to_string(),
                ));
            }
            return Ok(TaskResult::Failed {
                error: error.to_string(),
                log_ref: self.log_ref.clone(),
            });
        }

        if self.error.is_some() {
            return Err(Error::Validation(
                "successful report must not carry an error".to_string(),
            ));
        }
        if let Some(artifact) = self
            .artifacts
            .iter()
            .find(|a| a.name.is_empty() || a.href.is_empty())
        {
            return Err(Error::Validation(format!(
                "artifact is missing a name or href: {:?}",
                artifact
            )));
        }

        match kind {
            TaskKind::Sign if self.artifacts.is_empty() => {
                return Err(Error::Validation(
                    "sign report must list the signed packages".to_string(),
                ));
            }
            TaskKind::GenKey => match &self.sign_key {
                None => {
                    return Err(Error::Validation(
                        "key generation report must carry the generated key".to_string(),
                    ));
                }
                Some(key) if key.keyid.is_empty() || key.fingerprint.is_empty() => {
                    return Err(Error::Validation(
                        "generated key is missing its keyid or fingerprint".to_string(),
                    ));
                }
                Some(_) => {}
            },
            _ => {}
        }

        Ok(TaskResult::Succeeded {
            artifacts: self.artifacts.clone(),
            sign_key: self.sign_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(name: &str) -> PackageRef {
        PackageRef {
            name: name.to_string(),
            href: format!("/pulp/api/v3/content/rpm/packages/{}/", name),
        }
    }

    fn key() -> SignKey {
        SignKey {
            keyid: "ABCDEF0123456789".to_string(),
            fingerprint: "0123456789ABCDEF0123456789ABCDEF01234567".to_string(),
            public_url: "https://keys.example.org/ABCDEF0123456789.asc".to_string(),
        }
    }

    #[test]
    fn test_successful_build_report() {
        let report = CompletionReport::succeeded(1, vec![package("bash-5.1-1.x86_64.rpm")]);
        let result = report.validate(TaskKind::Build).unwrap();
        assert!(matches!(result, TaskResult::Succeeded { ref artifacts, .. } if artifacts.len() == 1));
    }

    #[test]
    fn test_failed_report_requires_error_message() {
        let mut report = CompletionReport::failed(1, "   ");
        assert!(matches!(
            report.validate(TaskKind::Build),
            Err(Error::Validation(_))
        ));

        report.error = None;
        assert!(report.validate(TaskKind::Build).is_err());

        let report = CompletionReport::failed(2, "mock exited with status 1");
        let result = report.validate(TaskKind::Build).unwrap();
        assert_eq!(result.error_message(), Some("mock exited with status 1"));
    }

    #[test]
    fn test_success_with_error_is_inconsistent() {
        let mut report = CompletionReport::succeeded(1, vec![]);
        report.error = Some("but also broken".to_string());
        assert!(report.validate(TaskKind::Build).is_err());
    }

    #[test]
    fn test_failed_report_with_artifacts_is_inconsistent() {
        let mut report = CompletionReport::failed(1, "broken");
        report.artifacts.push(package("bash"));
        assert!(report.validate(TaskKind::Build).is_err());
    }

    #[test]
    fn test_epoch_must_be_positive() {
        let report = CompletionReport::succeeded(0, vec![]);
        assert!(report.validate(TaskKind::Build).is_err());
    }

    #[test]
    fn test_sign_success_requires_packages() {
        let report = CompletionReport::succeeded(1, vec![]);
        assert!(report.validate(TaskKind::Sign).is_err());

        let report = CompletionReport::succeeded(1, vec![package("bash")]);
        assert!(report.validate(TaskKind::Sign).is_ok());
    }

    #[test]
    fn test_gen_key_success_requires_key() {
        let report = CompletionReport::succeeded(1, vec![]);
        assert!(report.validate(TaskKind::GenKey).is_err());

        let report = CompletionReport::succeeded(1, vec![]).with_sign_key(key());
        let result = report.validate(TaskKind::GenKey).unwrap();
        assert!(matches!(result, TaskResult::Succeeded { sign_key: Some(_), .. }));
    }

    #[test]
    fn test_sign_key_rejected_outside_gen_key() {
        let report = CompletionReport::succeeded(1, vec![package("bash")]).with_sign_key(key());
        assert!(report.validate(TaskKind::Sign).is_err());
    }
}
