//! Documents returned by the control plane.
//!
//! Bodies are kept as JSON values behind [`Document`] so callers can navigate
//! fields the typed accessors do not cover.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CpiError, Result, TaskFailureInfo};

/// Lifecycle state of a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Queued,
    PreRunning,
    Running,
    Success,
    Error,
    Aborted,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Aborted | TaskStatus::Canceled
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TaskStatus::Error | TaskStatus::Aborted | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::PreRunning => write!(f, "preRunning"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Aborted => write!(f, "aborted"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// Structured error body: `{majorErrorCode, minorErrorCode, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDocument {
    #[serde(default)]
    pub major_error_code: Option<i64>,
    #[serde(default)]
    pub minor_error_code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default)]
    pub rel: String,
    #[serde(rename = "type", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Remote asynchronous unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub href: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub operation_name: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorDocument>,
}

impl Task {
    /// Stable identifier used in logs and errors (falls back to the href).
    pub fn ident(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.href)
    }

    /// True when the task started before `now - threshold`.
    /// Tasks without a start time are never considered old.
    pub fn is_older_than(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.start_time {
            Some(start) => start < now - threshold,
            None => false,
        }
    }

    pub fn failure_info(&self) -> TaskFailureInfo {
        let detail = self
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .or_else(|| self.details.clone())
            .unwrap_or_default();
        TaskFailureInfo {
            id: self.ident().to_string(),
            operation: self.operation.clone(),
            status: self.status.to_string(),
            detail,
        }
    }
}

/// Parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    value: Value,
}

impl Document {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn parse(operation: &str, body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| CpiError::invalid_response(operation, format!("{}: {}", e, body)))?;
        if !value.is_object() {
            return Err(CpiError::invalid_response(
                operation,
                format!("expected an object, got: {}", body),
            ));
        }
        Ok(Self { value })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    pub fn href(&self) -> Option<&str> {
        self.str_field("href")
    }

    pub fn media_type(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field("id")
    }

    /// Entity status. Numeric codes are rendered as strings.
    pub fn status(&self) -> Option<String> {
        match self.value.get("status")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Navigates nested objects: `doc.get(&["owner", "user", "name"])`.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.value, |v, key| v.get(key))
    }

    /// Label for logs and errors: name, else href, else `<anonymous>`.
    pub fn label(&self) -> String {
        self.name()
            .or_else(|| self.href())
            .unwrap_or("<anonymous>")
            .to_string()
    }

    pub fn is_task(&self) -> bool {
        self.media_type()
            .map(|t| t.to_ascii_lowercase().contains("task"))
            .unwrap_or(false)
    }

    pub fn to_task(&self) -> Result<Task> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            CpiError::invalid_response(self.href().unwrap_or("task"), format!("not a task: {}", e))
        })
    }

    /// Tasks attached to the entity (the `tasks` array).
    pub fn tasks(&self) -> Result<Vec<Task>> {
        match self.value.get("tasks") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(tasks) => serde_json::from_value(tasks.clone()).map_err(|e| {
                CpiError::invalid_response(
                    self.href().unwrap_or("entity"),
                    format!("malformed task list: {}", e),
                )
            }),
        }
    }

    pub fn links(&self) -> Vec<Link> {
        self.value
            .get("links")
            .and_then(|links| serde_json::from_value(links.clone()).ok())
            .unwrap_or_default()
    }

    /// First link matching `rel` and, when given, the media type.
    pub fn link(&self, rel: &str, media_type: Option<&str>) -> Option<Link> {
        self.links().into_iter().find(|l| {
            l.rel == rel
                && media_type
                    .map(|t| l.media_type.as_deref() == Some(t))
                    .unwrap_or(true)
        })
    }

    pub fn error(&self) -> Option<ErrorDocument> {
        if self.value.get("minorErrorCode").is_none() && self.value.get("majorErrorCode").is_none()
        {
            return None;
        }
        serde_json::from_value(self.value.clone()).ok()
    }

    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            CpiError::invalid_response(self.href().unwrap_or("document"), e)
        })
    }
}
