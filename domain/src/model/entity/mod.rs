pub mod history;
pub mod job;

#[rustfmt::skip]
pub use self::{
    history::{JobHistoryRecord, JobType, TaskInfo, UserRecord},
    job::{ArrayBounds, Job, JobId},
};
