//! Errata (update advisory) records and their release lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    NotReleased,
    InProgress,
    Released,
    Failed,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::NotReleased => "not_released",
            ReleaseStatus::InProgress => "in_progress",
            ReleaseStatus::Released => "released",
            ReleaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_released" => Ok(ReleaseStatus::NotReleased),
            "in_progress" => Ok(ReleaseStatus::InProgress),
            "released" => Ok(ReleaseStatus::Released),
            "failed" => Ok(ReleaseStatus::Failed),
            other => Err(Error::Validation(format!(
                "unknown release status: {}",
                other
            ))),
        }
    }
}

/// An errata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrataRecord {
    /// Advisory id, e.g. `ALSA-2024:0001`.
    pub id: String,
    pub platform: String,
    pub title: String,
    /// Package names covered by the advisory.
    pub packages: Vec<String>,
    pub release_status: ReleaseStatus,
    pub last_release_log: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewErrataRecord {
    pub id: String,
    pub platform: String,
    pub title: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

impl NewErrataRecord {
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("errata id must not be empty".to_string()));
        }
        if self.platform.trim().is_empty() {
            return Err(Error::Validation(
                "errata platform must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of asking for a record to be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStart {
    NotFound,
    AlreadyInProgress,
    Started,
}

impl ReleaseStart {
    pub fn message(&self, record_id: &str) -> String {
        match self {
            ReleaseStart::NotFound => format!("Record {} doesn't exist", record_id),
            ReleaseStart::AlreadyInProgress => {
                format!("Record {} already in progress", record_id)
            }
            ReleaseStart::Started => {
                format!("Release updateinfo record {} has been started", record_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_status_string_form() {
        for status in [
            ReleaseStatus::NotReleased,
            ReleaseStatus::InProgress,
            ReleaseStatus::Released,
            ReleaseStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ReleaseStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_release_start_messages() {
        assert_eq!(
            ReleaseStart::AlreadyInProgress.message("ALSA-2024:0001"),
            "Record ALSA-2024:0001 already in progress"
        );
        assert!(ReleaseStart::Started.message("X").contains("has been started"));
    }
}
