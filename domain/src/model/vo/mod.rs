pub mod accounting;
pub mod job;
pub mod request;
pub mod snapshot;
pub mod status;

#[rustfmt::skip]
pub use self::{
    accounting::{Accounting, AccountingRecord, JobInfo},
    job::{ControlAction, JobSelection, JobTemplate, Timeout},
    request::{JobRequest, RequestData},
    snapshot::{DrmSnapshot, DrmsInfo, JobDetails, SnapshotEntry, Version},
    status::{aggregate_array_status, completion_sub_status, JobStatus, MainStatus, SubStatus},
};
