use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::status::{MainStatus, JobStatus};

/// State codes of the jobs currently known to the DRM queue.
///
/// Jobs (and array tasks) that already left the queue are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrmSnapshot {
    pub jobs: HashMap<String, SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEntry {
    Single { state: String },
    /// Raw state code per task id still in the queue.
    Array { tasks: BTreeMap<u32, String> },
}

impl DrmSnapshot {
    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Status of a job still in the queue: the mapped state code, or for
    /// arrays ERROR if any task is in error and UNDETERMINED otherwise.
    pub fn queued_status(&self, job_id: &str) -> Option<MainStatus> {
        let status = match self.jobs.get(job_id)? {
            SnapshotEntry::Single { state } => map_code(state),
            SnapshotEntry::Array { tasks } => {
                if tasks.values().any(|code| map_code(code) == MainStatus::Error) {
                    MainStatus::Error
                } else {
                    MainStatus::Undetermined
                }
            }
        };
        Some(status)
    }

    /// Status of one job task still in the queue.
    ///
    /// A single-job entry answers for any task id, since the DRM lists an
    /// array with one pending task the same way.
    pub fn task_status(&self, job_id: &str, task_id: u32) -> Option<JobStatus> {
        let code = match self.jobs.get(job_id)? {
            SnapshotEntry::Single { state } => state,
            SnapshotEntry::Array { tasks } => tasks.get(&task_id)?,
        };
        Some(JobStatus::new(map_code(code)))
    }
}

pub(crate) fn map_code(code: &str) -> MainStatus {
    MainStatus::from_drm_code(code).unwrap_or(MainStatus::Undetermined)
}

/// Details of a single job as reported by the DRM's per-job query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDetails {
    pub job_id: String,
    pub job_name: String,
    pub submission_time: DateTime<Utc>,
    pub error_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: String,
    pub minor: String,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmsInfo {
    pub drms_name: String,
    pub version: Version,
}
