use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{download_spec::DownloadRequest, runner::JobOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("job {id} cannot move from {from:?} to {to:?}")]
pub struct JobStateError {
    pub id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One request-scoped invocation of the external tool.
///
/// Moves `pending -> running -> {succeeded, failed, timed_out}` exactly once;
/// a terminal job rejects every further transition.
#[derive(Debug, Clone)]
pub struct Job {
    id: String,
    request: DownloadRequest,
    output_path: PathBuf,
    status: JobStatus,
    exit_code: Option<i32>,
    stderr_excerpt: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, request: DownloadRequest, output_path: PathBuf) -> Self {
        Self {
            id: id.into(),
            request,
            output_path,
            status: JobStatus::Pending,
            exit_code: None,
            stderr_excerpt: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stderr_excerpt(&self) -> Option<&str> {
        self.stderr_excerpt.as_deref()
    }

    pub fn start(&mut self) -> Result<(), JobStateError> {
        self.transition(JobStatus::Pending, JobStatus::Running)
    }

    /// Records the runner's outcome as the job's terminal state.
    pub fn finish(&mut self, outcome: &JobOutcome) -> Result<(), JobStateError> {
        let next = match outcome {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::TimedOut { .. } => JobStatus::TimedOut,
        };
        self.transition(JobStatus::Running, next)?;

        match outcome {
            JobOutcome::Succeeded { .. } => self.exit_code = Some(0),
            JobOutcome::Failed {
                exit_code,
                stderr_excerpt,
            } => {
                self.exit_code = *exit_code;
                self.stderr_excerpt = Some(stderr_excerpt.clone());
            }
            JobOutcome::TimedOut { .. } => {}
        }

        Ok(())
    }

    fn transition(&mut self, expected: JobStatus, next: JobStatus) -> Result<(), JobStateError> {
        if self.status != expected {
            return Err(JobStateError {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
