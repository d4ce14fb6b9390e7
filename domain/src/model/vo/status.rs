use serde::Serialize;

/// Coarse lifecycle stage of a job or an array task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MainStatus {
    Queued,
    OnHold,
    Running,
    Suspended,
    Error,
    Completed,
    /// Only produced when aggregating an array job whose tasks are not all
    /// finished, or for a DRM state code outside the known table.
    Undetermined,
}

/// Completion qualifier, meaningful only next to [`MainStatus::Completed`]
/// (and [`MainStatus::Error`] for force-terminated jobs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubStatus {
    Undetermined,
    Done,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub main_status: MainStatus,
    pub sub_status: Option<SubStatus>,
}

impl JobStatus {
    pub const fn new(main_status: MainStatus) -> Self {
        Self {
            main_status,
            sub_status: None,
        }
    }

    pub const fn completed(sub_status: SubStatus) -> Self {
        Self {
            main_status: MainStatus::Completed,
            sub_status: Some(sub_status),
        }
    }

    pub const fn with_sub(main_status: MainStatus, sub_status: SubStatus) -> Self {
        Self {
            main_status,
            sub_status: Some(sub_status),
        }
    }

    /// Completed or in error: the job will not make progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self.main_status, MainStatus::Completed | MainStatus::Error)
    }
}

impl MainStatus {
    /// Maps a grid-engine state code, as reported by the DRM status snapshot.
    pub fn from_drm_code(code: &str) -> Option<Self> {
        let status = match code {
            "qw" => Self::Queued,
            "hqw" | "hRqw" | "hRwq" => Self::OnHold,
            "r" | "t" | "Rr" | "Rt" => Self::Running,
            "s" | "ts" | "S" | "tS" | "T" | "tT" | "Rs" | "Rts" | "RS" | "RtS" | "RT" | "RtT" => {
                Self::Suspended
            }
            "Eqw" | "Ehqw" | "EhRqw" => Self::Error,
            _ => return None,
        };
        Some(status)
    }
}

/// Sub status of a job (or task) that left the DRM queue, from its
/// accounting record: `None` while the record is not available yet.
pub fn completion_sub_status(failed: Option<bool>) -> SubStatus {
    match failed {
        None => SubStatus::Undetermined,
        Some(true) => SubStatus::Failed,
        Some(false) => SubStatus::Done,
    }
}

/// Aggregate status of an array job from the statuses of its tasks.
///
/// Any task in error makes the whole job ERROR. Otherwise a single task that
/// is not completed yet leaves the job UNDETERMINED. Once every task is
/// completed the sub status is FAILED if any task failed, else UNDETERMINED
/// if any accounting record is missing, else DONE.
pub fn aggregate_array_status<'a, I>(tasks: I) -> JobStatus
where
    I: IntoIterator<Item = &'a JobStatus>,
{
    let tasks: Vec<&JobStatus> = tasks.into_iter().collect();

    if tasks.iter().any(|t| t.main_status == MainStatus::Error) {
        return JobStatus::new(MainStatus::Error);
    }
    if tasks.iter().any(|t| t.main_status != MainStatus::Completed) {
        return JobStatus::new(MainStatus::Undetermined);
    }

    let has_sub = |sub: SubStatus| tasks.iter().any(|t| t.sub_status == Some(sub));
    let sub_status = if has_sub(SubStatus::Failed) {
        SubStatus::Failed
    } else if tasks
        .iter()
        .any(|t| matches!(t.sub_status, None | Some(SubStatus::Undetermined)))
    {
        SubStatus::Undetermined
    } else {
        SubStatus::Done
    };
    JobStatus::completed(sub_status)
}
