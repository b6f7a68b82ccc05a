use std::fmt;
use std::time::Duration;

/// Errors produced by the worker pool and the job completion primitive.
///
/// Backpressure is deliberately absent: a full backlog blocks the submitter
/// instead of producing an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Pool sizing is unusable (zero workers or zero queue depth).
    InvalidConfig {
        /// What was wrong with the configuration
        reason: String,
    },
    /// `start()` was called on a pool that is already running or stopped.
    AlreadyStarted,
    /// The pool is shutting down and no longer accepts jobs.
    ShuttingDown,
    /// The job was accepted but discarded by shutdown before any worker ran it.
    Rejected,
    /// A deadline-bounded wait elapsed before the job signalled completion.
    ///
    /// The job itself keeps running.
    Timeout(Duration),
    /// A worker or dispatcher coroutine could not be spawned.
    Spawn(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidConfig { reason } => {
                write!(f, "invalid worker pool configuration: {reason}")
            }
            PoolError::AlreadyStarted => write!(f, "worker pool has already been started"),
            PoolError::ShuttingDown => {
                write!(f, "worker pool is shutting down and rejects new jobs")
            }
            PoolError::Rejected => write!(f, "job was rejected by worker pool shutdown"),
            PoolError::Timeout(d) => {
                write!(f, "job did not complete within {} ms", d.as_millis())
            }
            PoolError::Spawn(e) => write!(f, "failed to spawn pool coroutine: {e}"),
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            PoolError::Timeout(Duration::from_millis(250)).to_string(),
            "job did not complete within 250 ms"
        );
        assert!(PoolError::ShuttingDown.to_string().contains("shutting down"));
        let invalid = PoolError::InvalidConfig {
            reason: "workers must be > 0".into(),
        };
        assert!(invalid.to_string().contains("workers must be > 0"));
    }
}
