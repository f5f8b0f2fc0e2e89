use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("missing config file kira-bg.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("malformed artifact line: {0}")]
    ArtifactFormat(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("artifact for stage {0} does not exist")]
    ArtifactNotFound(String),

    #[error("artifact for stage {0} already exists")]
    ArtifactExists(String),

    #[error("{service} unavailable after {attempts} attempt(s): {reason}")]
    RemoteUnavailable {
        service: String,
        attempts: u32,
        reason: String,
    },

    #[error("{service} returned status {status}: {message}")]
    RemoteRejected {
        service: String,
        status: u16,
        message: String,
    },

    #[error("{service} sent an unexpected response: {message}")]
    InvalidResponse { service: String, message: String },

    #[error("download job {job_id} ended with status {status}")]
    JobFailed { job_id: String, status: String },

    #[error("{} download job(s) failed: {}", .0.len(), summarize_jobs(.0))]
    JobsFailed(Vec<(String, String)>),

    #[error("download job {job_id} still pending after {attempts} polls")]
    PollTimeout { job_id: String, attempts: u32 },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("raster error: {0}")]
    Raster(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("stage registered twice: {0}")]
    DuplicateStage(String),

    #[error("dependency cycle between stages: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("stage {stage} failed")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<KiraError>,
    },
}

impl KiraError {
    /// Innermost error, looking through `StageFailed` wrappers.
    pub fn root(&self) -> &KiraError {
        match self {
            KiraError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

fn summarize_jobs(jobs: &[(String, String)]) -> String {
    jobs.iter()
        .map(|(id, status)| format!("{id}={status}"))
        .collect::<Vec<_>>()
        .join(", ")
}
