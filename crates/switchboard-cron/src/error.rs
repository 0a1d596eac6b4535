use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    /// The schedule cannot be evaluated (bad cron expression, bad timestamp).
    #[error("Schedule computation error: {0}")]
    ScheduleComputation(String),

    /// The job definition violates an invariant (session target vs payload
    /// kind, webhook delivery without a valid URL).
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Cron store I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CronError {
    pub fn code(&self) -> &'static str {
        match self {
            CronError::ScheduleComputation(_) => "SCHEDULE_COMPUTATION_ERROR",
            CronError::InvalidJob(_) => "INVALID_JOB",
            CronError::JobNotFound { .. } => "JOB_NOT_FOUND",
            CronError::Io { .. } => "IO_ERROR",
            CronError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
