use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::clock::Clock;
use crate::error::KiraError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum JobStatus {
    Preparing,
    Running,
    Suspended,
    Succeeded,
    Failed,
    Other(String),
}

impl JobStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            JobStatus::Preparing | JobStatus::Running | JobStatus::Suspended
        )
    }
}

impl From<String> for JobStatus {
    fn from(value: String) -> Self {
        match value.trim().to_uppercase().as_str() {
            "PREPARING" => JobStatus::Preparing,
            "RUNNING" => JobStatus::Running,
            "SUSPENDED" => JobStatus::Suspended,
            "SUCCEEDED" => JobStatus::Succeeded,
            "FAILED" => JobStatus::Failed,
            _ => JobStatus::Other(value),
        }
    }
}

impl FromStr for JobStatus {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(JobStatus::from(value.to_string()))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Preparing => write!(f, "PREPARING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Suspended => write!(f, "SUSPENDED"),
            JobStatus::Succeeded => write!(f, "SUCCEEDED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Other(value) => write!(f, "{value}"),
        }
    }
}

/// One observation of a job: its status and, once succeeded, its link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// Polls `status_fn` until the job leaves the pending states.
///
/// Sleeps `interval` between pending observations, never after the last one.
/// A rejected status request counts as a pending observation; any other error
/// is returned as is.
pub fn poll_until_terminal<F>(
    job_id: &str,
    mut status_fn: F,
    settings: PollSettings,
    clock: &dyn Clock,
) -> Result<String, KiraError>
where
    F: FnMut(&str) -> Result<JobSnapshot, KiraError>,
{
    let mut attempts = 0u32;
    while attempts < settings.max_attempts {
        attempts += 1;
        match status_fn(job_id) {
            Ok(JobSnapshot {
                status: JobStatus::Succeeded,
                link: Some(link),
            }) => {
                tracing::info!(job_id, attempts, "download ready");
                return Ok(link);
            }
            Ok(JobSnapshot {
                status: JobStatus::Succeeded,
                link: None,
            }) => {
                return Err(KiraError::InvalidResponse {
                    service: "gbif".to_string(),
                    message: format!("job {job_id} succeeded without a download link"),
                });
            }
            Ok(snapshot) if snapshot.status.is_pending() => {
                tracing::debug!(job_id, status = %snapshot.status, attempts, "job pending");
            }
            Ok(snapshot) => {
                return Err(KiraError::JobFailed {
                    job_id: job_id.to_string(),
                    status: snapshot.status.to_string(),
                });
            }
            Err(KiraError::RemoteRejected { status, .. }) => {
                tracing::warn!(job_id, status, attempts, "status request rejected");
            }
            Err(err) => return Err(err),
        }
        if attempts < settings.max_attempts {
            clock.sleep(settings.interval);
        }
    }
    Err(KiraError::PollTimeout {
        job_id: job_id.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use assert_matches::assert_matches;

    use super::*;
    use crate::clock::RecordingClock;

    fn scripted(
        statuses: Vec<(&'static str, Option<&'static str>)>,
    ) -> impl FnMut(&str) -> Result<JobSnapshot, KiraError> {
        let mut queue: VecDeque<_> = statuses.into();
        move |_job| {
            let (status, link) = queue.pop_front().expect("script exhausted");
            Ok(JobSnapshot {
                status: status.parse().unwrap(),
                link: link.map(str::to_string),
            })
        }
    }

    fn settings(max_attempts: u32) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(30),
            max_attempts,
        }
    }

    #[test]
    fn sleeps_between_pending_polls() {
        let clock = RecordingClock::new();
        let status = scripted(vec![
            ("RUNNING", None),
            ("RUNNING", None),
            ("SUCCEEDED", Some("https://example.org/a.zip")),
        ]);
        let link = poll_until_terminal("0001", status, settings(250), &clock).unwrap();
        assert_eq!(link, "https://example.org/a.zip");
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30); 2]);
    }

    #[test]
    fn failure_is_immediate() {
        let clock = RecordingClock::new();
        let status = scripted(vec![("FAILED", None)]);
        let err = poll_until_terminal("0002", status, settings(250), &clock).unwrap_err();
        assert_matches!(err, KiraError::JobFailed { ref status, .. } if status == "FAILED");
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn unknown_status_is_failure() {
        let clock = RecordingClock::new();
        let status = scripted(vec![("PREPARING", None), ("KILLED", None)]);
        let err = poll_until_terminal("0003", status, settings(250), &clock).unwrap_err();
        assert_matches!(err, KiraError::JobFailed { ref status, .. } if status == "KILLED");
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[test]
    fn times_out_after_budget() {
        let clock = RecordingClock::new();
        let status = scripted(vec![("RUNNING", None), ("SUSPENDED", None), ("RUNNING", None)]);
        let err = poll_until_terminal("0004", status, settings(3), &clock).unwrap_err();
        assert_matches!(err, KiraError::PollTimeout { attempts: 3, .. });
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[test]
    fn rejected_status_request_keeps_polling() {
        let clock = RecordingClock::new();
        let mut calls = 0;
        let status = |_: &str| {
            calls += 1;
            if calls == 1 {
                Err(KiraError::RemoteRejected {
                    service: "gbif".to_string(),
                    status: 404,
                    message: "not yet".to_string(),
                })
            } else {
                Ok(JobSnapshot {
                    status: JobStatus::Succeeded,
                    link: Some("https://example.org/b.zip".to_string()),
                })
            }
        };
        let link = poll_until_terminal("0005", status, settings(5), &clock).unwrap();
        assert_eq!(link, "https://example.org/b.zip");
        assert_eq!(clock.sleeps().len(), 1);
    }
}
