use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use typed_builder::TypedBuilder;

use super::job::{ArrayBounds, JobId};
use crate::model::vo::status::MainStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Single,
    Array,
}

/// Running-time bookkeeping of one array task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_id: u32,
    pub status: MainStatus,
    /// When the task was first seen running, if it was.
    pub running_start: Option<Instant>,
    pub running_time: Duration,
}

impl TaskInfo {
    pub fn new(task_id: u32, status: MainStatus) -> Self {
        Self {
            task_id,
            status,
            running_start: None,
            running_time: Duration::ZERO,
        }
    }
}

/// A job accepted by the scheduler and still under supervision.
#[derive(Debug, Clone, TypedBuilder)]
pub struct JobHistoryRecord {
    pub job_id: JobId,
    pub job_name: String,
    pub session_name: String,
    pub job_type: JobType,
    /// Last status acted upon by the supervisor.
    pub status: MainStatus,
    #[builder(default)]
    pub array: Option<ArrayBounds>,
    #[builder(default)]
    pub tasks: Vec<TaskInfo>,
    /// Requester IP.
    pub user: String,
    pub submitted_at: DateTime<Utc>,
    /// Start of the current time budget: submission, then the moment the
    /// job was seen running.
    pub reference_time: Instant,
    /// Sum of the tasks' running times (array jobs only).
    #[builder(default)]
    pub total_execution_time: Duration,
}

impl JobHistoryRecord {
    pub fn task_mut(&mut self, task_id: u32) -> Option<&mut TaskInfo> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }
}

/// Request history of one requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub ip: String,
    pub requests: VecDeque<DateTime<Utc>>,
}

impl UserRecord {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            requests: VecDeque::new(),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn last_request(&self) -> Option<DateTime<Utc>> {
        self.requests.back().copied()
    }
}
