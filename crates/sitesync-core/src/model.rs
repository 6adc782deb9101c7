//! The five persisted entities from spec §3, plus their status enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "stopped" => RunStatus::Stopped,
            "error" => RunStatus::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub config_snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "in_progress" => TaskStatus::InProgress,
            "finished" => TaskStatus::Finished,
            "error" => TaskStatus::Error,
            _ => return None,
        })
    }

    /// I2: finished/error never revert.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Error)
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub run_id: Uuid,
    pub url: String,
    pub depth: i64,
    pub source_name: String,
    pub plugin_hint: Option<String>,
    pub status: TaskStatus,
    pub attempt_count: i64,
    pub next_run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Asset {
    pub id: Uuid,
    pub source_name: String,
    pub url: String,
    pub asset_type: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffClass {
    New,
    Updated,
    Unchanged,
}

impl DiffClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DiffClass::New => "new",
            DiffClass::Updated => "updated",
            DiffClass::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssetVersion {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub run_id: Uuid,
    pub normalized_hash: String,
    pub raw_hash: String,
    pub payload_ref: String,
    pub created_at: DateTime<Utc>,
    pub diff_class: DiffClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    TransientFetch,
    PermanentFetch,
    Normalization,
    Missing,
}

impl ExceptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionKind::TransientFetch => "transient_fetch",
            ExceptionKind::PermanentFetch => "permanent_fetch",
            ExceptionKind::Normalization => "normalization",
            ExceptionKind::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "transient_fetch" => ExceptionKind::TransientFetch,
            "permanent_fetch" => ExceptionKind::PermanentFetch,
            "normalization" => ExceptionKind::Normalization,
            "missing" => ExceptionKind::Missing,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Exception {
    pub id: Uuid,
    pub run_id: Uuid,
    pub task_id: Option<Uuid>,
    pub url: String,
    pub kind: ExceptionKind,
    pub message: String,
    pub context_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
