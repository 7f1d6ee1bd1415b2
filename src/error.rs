use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::panic::Location;

use thiserror::Error;

/// Errors surfaced inside a task at a suspension point.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The deadline passed before a resume or readiness event.
    #[error("timed out")]
    Timeout,
    /// The task was dropped by its connection; unwind and return.
    #[error("task cancelled")]
    Cancelled,
    #[error("task is not suspended")]
    NotSuspended,
    #[error("task is already suspended")]
    AlreadySuspended,
    /// Error injected with [`Continuation::throw`](crate::scheduler::Continuation::throw).
    #[error("{0}")]
    Thrown(Box<AppError>),
    #[error("i/o error while waiting: {0}")]
    Io(#[from] io::Error),
}

/// Error raised by application code or by the response protocol on its behalf.
///
/// Records the source location where it was created, which is what the
/// error log reports.
#[derive(Error)]
#[error("{message}")]
pub struct AppError {
    message: String,
    location: &'static Location<'static>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl AppError {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Location::caller(),
            source: None,
        }
    }

    #[track_caller]
    pub fn from_error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: err.to_string(),
            location: Location::caller(),
            source: Some(Box::new(err)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn file(&self) -> &'static str {
        self.location.file()
    }

    pub fn line(&self) -> u32 {
        self.location.line()
    }

    /// True when this error wraps a task timeout.
    pub fn is_timeout(&self) -> bool {
        self.task_error()
            .is_some_and(|e| matches!(e, TaskError::Timeout))
    }

    pub fn task_error(&self) -> Option<&TaskError> {
        self.source.as_ref()?.downcast_ref::<TaskError>()
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.file(), self.line())
    }
}

impl From<TaskError> for AppError {
    #[track_caller]
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Thrown(inner) => *inner,
            other => AppError::from_error(other),
        }
    }
}

impl From<io::Error> for AppError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        AppError::from_error(err)
    }
}
