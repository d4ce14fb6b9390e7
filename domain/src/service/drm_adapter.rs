use crate::model::entity::ArrayBounds;
use crate::model::vo::{Accounting, ControlAction, DrmSnapshot, DrmsInfo, JobDetails, JobTemplate};

/// Access to the cluster resource manager.
///
/// Errors are opaque to callers; they end the current operation and are
/// handed back unchanged.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait::async_trait]
pub trait DrmAdapter: Send + Sync {
    /// Name and version of the DRM, also used as a liveness probe.
    async fn drms_info(&self) -> anyhow::Result<DrmsInfo>;

    async fn submit(&self, template: &JobTemplate) -> anyhow::Result<String>;

    /// Returns the job id and the task bounds the DRM actually accepted.
    async fn submit_array(
        &self,
        template: &JobTemplate,
        bounds: ArrayBounds,
    ) -> anyhow::Result<(String, ArrayBounds)>;

    /// Every job currently in the queue.
    async fn query_status(&self) -> anyhow::Result<DrmSnapshot>;

    async fn query_job(&self, job_id: &str) -> anyhow::Result<JobDetails>;

    async fn query_accounting(&self, job_id: &str) -> anyhow::Result<Accounting>;

    /// Returns the DRM's acknowledgement once the request was received.
    async fn control(&self, job_id: &str, action: ControlAction) -> anyhow::Result<String>;
}
