//! Jobs and their lifecycle
//!
//! A job is the durable record of one transformation request. Its status
//! walks a fixed state machine; terminal states are immutable except for
//! label edits. Children (steps, work items) reference the job by id and
//! never hold a pointer back to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Longest failure message stored on a job.
pub const MAX_JOB_MESSAGE_LEN: usize = 3096;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Request accepted, workflow not yet planned
    Accepted,

    /// Waiting for the user to review a preview before full processing
    Previewing,

    /// Workflow is being processed
    Running,

    /// Still processing, but at least one item failed permanently
    RunningWithErrors,

    /// Finished with recorded failures (ignore-errors jobs only)
    CompleteWithErrors,

    /// All items finished without failures
    Successful,

    /// Terminated by a permanent failure
    Failed,

    /// Terminated by the control plane
    Canceled,

    /// Dispatch suspended by the control plane
    Paused,
}

impl JobStatus {
    /// Terminal states admit no further status changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Successful
                | JobStatus::Failed
                | JobStatus::Canceled
                | JobStatus::CompleteWithErrors
        )
    }

    /// States in which the dispatcher may lease this job's items.
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            JobStatus::Running | JobStatus::RunningWithErrors | JobStatus::Previewing
        )
    }

    /// States a pause request is valid from.
    pub fn can_pause(&self) -> bool {
        matches!(
            self,
            JobStatus::Running | JobStatus::RunningWithErrors | JobStatus::Previewing
        )
    }

    /// States a resume request is valid from.
    pub fn can_resume(&self) -> bool {
        matches!(self, JobStatus::Paused | JobStatus::Previewing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::Previewing => "previewing",
            Self::Running => "running",
            Self::RunningWithErrors => "running_with_errors",
            Self::CompleteWithErrors => "complete_with_errors",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "previewing" => Ok(Self::Previewing),
            "running" => Ok(Self::Running),
            "running_with_errors" => Ok(Self::RunningWithErrors),
            "complete_with_errors" => Ok(Self::CompleteWithErrors),
            "successful" => Ok(Self::Successful),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "paused" => Ok(Self::Paused),
            other => Err(ServiceError::server(format!("unknown job status: {other}"))),
        }
    }
}

/// One transformation request materialized as a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub username: String,
    pub status: JobStatus,
    /// Percent complete, 0..=100. Monotonic over the job's lifetime.
    pub progress: i32,
    pub message: String,
    /// Origin request URI
    pub request: String,
    pub num_input_granules: i32,
    pub ignore_errors: bool,
    pub is_synchronous: bool,
    /// Normalized labels: lowercased, trimmed, sorted, deduplicated
    pub labels: Vec<String>,
    pub collection_ids: Vec<String>,
    pub destination_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Validate a status transition against the job state machine.
    ///
    /// Terminal states are immutable; cancel is allowed from any
    /// non-terminal state; everything else is enumerated explicitly.
    pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if from.is_terminal() {
            return Err(ServiceError::conflict(format!(
                "job is already {from} and cannot become {to}"
            )));
        }
        let ok = match to {
            JobStatus::Canceled => true,
            JobStatus::Paused => from.can_pause(),
            JobStatus::Running => matches!(
                from,
                JobStatus::Accepted
                    | JobStatus::Previewing
                    | JobStatus::Paused
                    | JobStatus::RunningWithErrors
            ),
            JobStatus::RunningWithErrors => matches!(
                from,
                JobStatus::Running | JobStatus::Previewing | JobStatus::Paused
            ),
            JobStatus::Previewing => matches!(from, JobStatus::Accepted),
            // In-flight items finish normally while paused, so a paused job
            // whose last item completes may go terminal.
            JobStatus::Successful => from.is_dispatchable() || from == JobStatus::Paused,
            JobStatus::CompleteWithErrors => matches!(
                from,
                JobStatus::Running | JobStatus::RunningWithErrors | JobStatus::Paused
            ),
            JobStatus::Failed => !from.is_terminal(),
            JobStatus::Accepted => false,
        };
        if ok {
            Ok(())
        } else {
            Err(ServiceError::conflict(format!(
                "invalid job status transition {from} -> {to}"
            )))
        }
    }

    /// Truncate a failure description to the stored message limit.
    pub fn truncate_message(message: &str) -> String {
        if message.len() <= MAX_JOB_MESSAGE_LEN {
            return message.to_string();
        }
        let mut end = MAX_JOB_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}

/// Normalize labels: lowercase, trim, drop empties, sort, dedup.
pub fn normalize_labels<I, S>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = labels
        .into_iter()
        .map(|l| l.as_ref().trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Temporal extent of an output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TemporalRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// One output descriptor appended to a job as its items finish
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobLink {
    pub href: String,
    pub rel: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal: Option<TemporalRange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_immutable() {
        for from in [
            JobStatus::Successful,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::CompleteWithErrors,
        ] {
            assert!(Job::validate_transition(from, JobStatus::Running).is_err());
            assert!(Job::validate_transition(from, JobStatus::Canceled).is_err());
        }
    }

    #[test]
    fn cancel_is_allowed_from_any_non_terminal_state() {
        for from in [
            JobStatus::Accepted,
            JobStatus::Previewing,
            JobStatus::Running,
            JobStatus::RunningWithErrors,
            JobStatus::Paused,
        ] {
            Job::validate_transition(from, JobStatus::Canceled).unwrap();
        }
    }

    #[test]
    fn pause_requires_an_active_job() {
        Job::validate_transition(JobStatus::Running, JobStatus::Paused).unwrap();
        Job::validate_transition(JobStatus::Previewing, JobStatus::Paused).unwrap();
        assert!(Job::validate_transition(JobStatus::Accepted, JobStatus::Paused).is_err());
    }

    #[test]
    fn message_truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_JOB_MESSAGE_LEN);
        let truncated = Job::truncate_message(&long);
        assert!(truncated.len() <= MAX_JOB_MESSAGE_LEN);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn labels_are_normalized() {
        let labels = normalize_labels(["  Foo ", "bar", "FOO", "", "baz"]);
        assert_eq!(labels, vec!["bar", "baz", "foo"]);
    }
}
