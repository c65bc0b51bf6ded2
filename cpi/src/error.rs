use std::fmt;
use std::time::Duration;

pub type Result<T, E = CpiError> = std::result::Result<T, E>;

/// Errors raised by the protocol client and the task waiter.
#[derive(Debug, thiserror::Error)]
pub enum CpiError {
    #[error("{kind} not found: {reference}")]
    NotFound { kind: String, reference: String },

    #[error("already exists: {message}")]
    AlreadyExists { message: String },

    #[error("{operation} did not complete within {} seconds", .waited.as_secs())]
    Timeout { operation: String, waited: Duration },

    /// Network or TLS level failure. The only kind the retry policy retries.
    #[error("transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("{operation} failed ({status}): {message}")]
    Protocol {
        operation: String,
        status: u16,
        major_code: Option<i64>,
        minor_code: Option<String>,
        message: String,
    },

    #[error("invalid response from {operation}: {message}")]
    InvalidResponse { operation: String, message: String },

    #[error("task failed: {0}")]
    TaskFailure(TaskFailureInfo),

    #[error("{} task(s) failed on {entity}: {}", .failures.len(), TaskFailureList(.failures))]
    EntityTaskFailure {
        entity: String,
        failures: Vec<TaskFailureInfo>,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("failed to read {path}: {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CpiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CpiError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CpiError::NotFound { .. })
    }

    pub(crate) fn invalid_response(operation: &str, message: impl fmt::Display) -> Self {
        CpiError::InvalidResponse {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

/// Identity and detail of a remote task that ended badly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailureInfo {
    pub id: String,
    pub operation: String,
    pub status: String,
    pub detail: String,
}

impl fmt::Display for TaskFailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} ({}) ended with status {}: {}",
            self.id, self.operation, self.status, self.detail
        )
    }
}

struct TaskFailureList<'a>(&'a [TaskFailureInfo]);

impl fmt::Display for TaskFailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

/// Failure of a transaction body. Carries the original error untouched.
#[derive(Debug)]
pub struct StepFailure {
    pub transaction: String,
    /// Step whose `perform` raised, `None` when the body itself failed.
    pub step: Option<String>,
    source: anyhow::Error,
}

impl StepFailure {
    pub(crate) fn new(transaction: &str, step: Option<String>, source: anyhow::Error) -> Self {
        Self {
            transaction: transaction.to_string(),
            step,
            source,
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.source
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.source
    }

    /// Protocol error behind the failure, if the step failed on a remote call.
    pub fn cpi_error(&self) -> Option<&CpiError> {
        self.source.downcast_ref::<CpiError>()
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(
                f,
                "{}: step {} failed: {:#}",
                self.transaction, step, self.source
            ),
            None => write!(f, "{} failed: {:#}", self.transaction, self.source),
        }
    }
}

impl std::error::Error for StepFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}
