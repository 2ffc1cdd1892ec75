use thiserror::Error;

use crate::store::FailOutcome;

/// What a job handler reports when it cannot finish a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the job is retried while attempts remain.
    #[error("{0}")]
    Retryable(anyhow::Error),
    /// Permanent failure; the job goes straight to the dead set.
    #[error("fatal: {0}")]
    Fatal(anyhow::Error),
}

impl JobError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        JobError::Retryable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        JobError::Fatal(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Fatal(_))
    }

    pub fn inner(&self) -> &anyhow::Error {
        match self {
            JobError::Retryable(err) | JobError::Fatal(err) => err,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Retryable(err)
    }
}

/// Reported to a worker's error callback.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue store error: {0}")]
    Store(anyhow::Error),
    #[error("job {job_id} in group {group_id} failed on attempt {attempts}: {error}")]
    Job {
        job_id: String,
        group_id: String,
        attempts: i64,
        outcome: FailOutcome,
        error: anyhow::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_with_anyhow() -> Result<(), JobError> {
        Err(anyhow::anyhow!("upstream timed out"))?;
        Ok(())
    }

    #[test]
    fn anyhow_errors_convert_to_retryable() {
        let err = fails_with_anyhow().unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "upstream timed out");
    }

    #[test]
    fn fatal_errors_keep_their_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad row");
        let err = JobError::fatal(io);
        assert!(err.is_fatal());
        assert_eq!(err.inner().to_string(), "bad row");
        assert_eq!(err.to_string(), "fatal: bad row");
    }

    #[test]
    fn worker_error_names_the_job() {
        let err = WorkerError::Job {
            job_id: "j1".to_string(),
            group_id: "g1".to_string(),
            attempts: 2,
            outcome: FailOutcome::Requeued,
            error: anyhow::anyhow!("boom"),
        };
        assert_eq!(
            err.to_string(),
            "job j1 in group g1 failed on attempt 2: boom"
        );
    }
}
