use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

/// Accounting entry the DRM keeps for a finished job or array task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountingRecord {
    pub job_id: String,
    pub task_id: Option<u32>,
    pub exit_status: i32,
    /// Failure code, `0` when the job ran to completion. The DRM may append
    /// a description after the code.
    pub failed: String,
    pub raw: HashMap<String, String>,
}

impl AccountingRecord {
    pub fn has_failed(&self) -> bool {
        self.failed.split_whitespace().next().is_some_and(|code| code != "0")
    }
}

/// Result of an accounting query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accounting {
    NotFound,
    Single(AccountingRecord),
    /// Records available so far, by task id.
    Array(BTreeMap<u32, AccountingRecord>),
}

impl Accounting {
    pub fn is_found(&self) -> bool {
        !matches!(self, Self::NotFound)
    }

    /// Failure flag of one task: `None` when its record is not available yet.
    pub fn task_failed(&self, task_id: u32) -> Option<bool> {
        match self {
            Self::NotFound => None,
            Self::Single(record) => Some(record.has_failed()),
            Self::Array(tasks) => tasks.get(&task_id).map(AccountingRecord::has_failed),
        }
    }

    /// Failure flag of the whole job: any failed record counts.
    pub fn job_failed(&self) -> Option<bool> {
        match self {
            Self::NotFound => None,
            Self::Single(record) => Some(record.has_failed()),
            Self::Array(tasks) => Some(tasks.values().any(AccountingRecord::has_failed)),
        }
    }

    pub fn record_count(&self) -> usize {
        match self {
            Self::NotFound => 0,
            Self::Single(_) => 1,
            Self::Array(tasks) => tasks.len(),
        }
    }

    pub fn into_records(self) -> Vec<AccountingRecord> {
        match self {
            Self::NotFound => Vec::new(),
            Self::Single(record) => vec![record],
            Self::Array(tasks) => tasks.into_values().collect(),
        }
    }
}

/// Final information about a job that left the DRM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub job_id: String,
    /// One record for single jobs, one per task for arrays.
    pub records: Vec<AccountingRecord>,
    pub errors: Vec<String>,
    /// The job was terminated through the session's control interface.
    pub deleted: bool,
}

impl JobInfo {
    pub fn exit_statuses(&self) -> Vec<i32> {
        self.records.iter().map(|r| r.exit_status).collect()
    }

    pub fn failures(&self) -> Vec<String> {
        self.records.iter().map(|r| r.failed.clone()).collect()
    }
}
