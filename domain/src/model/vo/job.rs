use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DrmaaError;

/// Native submit options that would break job tracking if passed through.
const UNSUPPORTED_NATIVE_OPTIONS: [&str; 5] = ["-help", "-sync", "-t", "-verify", "-w"];

/// Submission options of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobTemplate {
    /// Executable or script to run, relative to the working directory.
    pub remote_command: String,
    pub args: Vec<String>,
    pub submit_as_hold: bool,
    pub job_environment: BTreeMap<String, Option<String>>,
    pub working_directory: String,
    /// Extra native submit options, separated by spaces.
    pub native_specification: String,
    pub email: Vec<String>,
    pub block_email: bool,
    /// `[[CC]YY]MMDDhhmm[.SS]` in the DRM server's timezone.
    pub start_time: String,
    pub job_name: String,
    pub input_path: String,
    pub output_path: String,
    pub error_path: String,
    pub join_files: bool,
}

impl JobTemplate {
    pub fn new(remote_command: impl Into<String>) -> Self {
        Self {
            remote_command: remote_command.into(),
            block_email: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), DrmaaError> {
        if self.remote_command.trim().is_empty() {
            return Err(DrmaaError::invalid_argument(
                "Job template provided must contain at least the 'remoteCommand' property",
            ));
        }
        if let Some(option) = self
            .native_specification
            .split_whitespace()
            .find(|opt| UNSUPPORTED_NATIVE_OPTIONS.contains(opt))
        {
            return Err(DrmaaError::UnsupportedAttribute(format!(
                "The attribute {option} is not supported"
            )));
        }
        Ok(())
    }
}

/// Action applied to a job through the DRM's control interface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    Suspend,
    Resume,
    Hold,
    Release,
    Terminate,
}

impl ControlAction {
    pub fn parse(code: &str) -> Result<Self, DrmaaError> {
        code.parse()
            .map_err(|_| DrmaaError::invalid_argument(format!("Invalid action: {code}")))
    }
}

/// Either explicit job ids or every job of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSelection {
    Ids(Vec<String>),
    All,
}

impl JobSelection {
    pub fn one(job_id: impl Into<String>) -> Self {
        Self::Ids(vec![job_id.into()])
    }
}

impl<S: Into<String>> FromIterator<S> for JobSelection {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::Ids(iter.into_iter().map(Into::into).collect())
    }
}

/// How long `synchronize`/`wait` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    WaitForever,
    After(std::time::Duration),
}

impl From<std::time::Duration> for Timeout {
    fn from(value: std::time::Duration) -> Self {
        Self::After(value)
    }
}
