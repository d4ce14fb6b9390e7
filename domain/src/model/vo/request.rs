use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::job::JobTemplate;
use crate::model::entity::ArrayBounds;

/// A client's request to run a job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub ip: String,
    /// Milliseconds since the epoch on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub job_data: JobRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(flatten)]
    pub template: JobTemplate,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub incr: Option<i64>,
}

impl RequestData {
    /// Requester address with any `...:` prefix removed, so IPv4-mapped IPv6
    /// addresses compare equal to their IPv4 form.
    pub fn normalized_ip(&self) -> &str {
        self.ip.rsplit(':').next().unwrap_or(&self.ip)
    }
}

impl JobRequest {
    /// Array bounds if the request describes an array job with more than one
    /// task; anything else is submitted as a single job.
    pub fn array_bounds(&self) -> Option<ArrayBounds> {
        let (start, end, incr) = (self.start?, self.end?, self.incr?);
        let past_end = start.checked_add(incr).map_or(true, |next| next > end);
        if start <= 0 || incr <= 0 || past_end {
            return None;
        }
        let convert = |v: i64| u32::try_from(v).ok();
        ArrayBounds::new(convert(start)?, convert(end)?, convert(incr)?).ok()
    }
}
