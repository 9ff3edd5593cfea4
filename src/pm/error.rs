use thiserror::Error;

/// Failures a supervisor command can surface to the operator or the scheduler.
///
/// Only the process exit code and the log sink lines leave the process; the CLI
/// maps each variant to an exit code in [`SupervisorError::exit_code`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{service} is already running (PID={pid})")]
    AlreadyRunning { service: String, pid: i32 },

    #[error("failed to launch {service}: {reason}")]
    LaunchFailure {
        service: String,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("host scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("declined by operator")]
    Declined,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn launch(service: &str, reason: impl Into<String>, source: Option<std::io::Error>) -> Self {
        SupervisorError::LaunchFailure {
            service: service.to_string(),
            reason: reason.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorError::AlreadyRunning { .. } | SupervisorError::Declined => 1,
            SupervisorError::SchedulerUnavailable(_) => 3,
            SupervisorError::LaunchFailure { .. } | SupervisorError::Other(_) => 2,
        }
    }

    /// Informational outcomes are logged where they happen; only fatal ones are
    /// written again by the CLI before exiting.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SupervisorError::AlreadyRunning { .. } | SupervisorError::Declined
        )
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        SupervisorError::Other(e.into())
    }
}
