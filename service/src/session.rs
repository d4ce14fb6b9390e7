use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use domain::{
    error::{DrmaaError, DrmaaResult},
    model::{
        entity::{ArrayBounds, Job, JobId},
        vo::{
            aggregate_array_status, completion_sub_status, ControlAction, DrmSnapshot, JobDetails,
            JobInfo, JobSelection, JobStatus, JobTemplate, MainStatus, SubStatus, Timeout,
        },
    },
    service::DrmAdapter,
};
use futures::future::try_join_all;
use serde::Serialize;

use crate::job_monitor::{JobMonitor, MonitorEvent, DEFAULT_REFRESH_INTERVAL};

/// Status of a job as seen through a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStatus {
    #[serde(flatten)]
    pub status: JobStatus,
    /// Per-task statuses, for array jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<BTreeMap<u32, JobStatus>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub job_id: JobId,
    pub message: String,
    pub status: JobStatus,
    /// Diagnostics reported by the DRM for jobs that ended in error.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub job_id: JobId,
    pub action: ControlAction,
    pub data: String,
}

/// A named group of jobs submitted through the same DRM.
pub struct Session {
    name: String,
    contact: Option<String>,
    drm: Arc<dyn DrmAdapter>,
    monitor: Arc<JobMonitor>,
    jobs: DashMap<JobId, Job>,
    deleted: DashSet<JobId>,
    refresh_interval: Duration,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        contact: Option<String>,
        drm: Arc<dyn DrmAdapter>,
        monitor: Arc<JobMonitor>,
    ) -> Self {
        Self {
            name: name.into(),
            contact,
            drm,
            monitor,
            jobs: DashMap::new(),
            deleted: DashSet::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Interval between accounting queries while waiting for a job.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contact(&self) -> Option<&str> {
        self.contact.as_deref()
    }

    pub fn job(&self, job_id: &str) -> DrmaaResult<Job> {
        self.jobs
            .get(job_id)
            .map(|job| job.clone())
            .ok_or_else(|| DrmaaError::unknown_job(job_id, &self.name))
    }

    pub fn is_deleted(&self, job_id: &str) -> bool {
        self.deleted.contains(job_id)
    }

    pub async fn run_job(&self, template: JobTemplate) -> DrmaaResult<JobId> {
        template.validate()?;
        let job_id: JobId = self.drm.submit(&template).await?.into();
        self.add_job(job_id.clone(), template, None);
        Ok(job_id)
    }

    pub async fn run_bulk_jobs(
        &self,
        template: JobTemplate,
        start: u32,
        end: u32,
        increment: u32,
    ) -> DrmaaResult<JobId> {
        template.validate()?;
        let requested = ArrayBounds::new(start, end, increment)?;
        let (job_id, accepted) = self.drm.submit_array(&template, requested).await?;
        let job_id: JobId = job_id.into();
        self.add_job(job_id.clone(), template, Some(accepted));
        Ok(job_id)
    }

    fn add_job(&self, job_id: JobId, template: JobTemplate, array: Option<ArrayBounds>) {
        tracing::info!(job_id = %job_id, session = %self.name, "Job submitted");
        let job = Job {
            id: job_id.clone(),
            session_name: self.name.clone(),
            template,
            array,
        };
        if self.jobs.insert(job_id.clone(), job).is_some() {
            tracing::warn!(job_id = %job_id, "DRM reused the id of a job still in the session");
        }
    }

    pub async fn job_details(&self, job_id: &str) -> DrmaaResult<JobDetails> {
        let job = self.job(job_id)?;
        Ok(self.drm.query_job(&job.id).await?)
    }

    pub async fn job_program_status(
        &self,
        selection: &JobSelection,
    ) -> DrmaaResult<HashMap<JobId, ProgramStatus>> {
        let jobs = self.select(selection)?;
        let snapshot = self.drm.query_status().await?;
        let statuses =
            try_join_all(jobs.iter().map(|job| self.derive_status(job, &snapshot))).await?;
        Ok(jobs.into_iter().map(|job| job.id).zip(statuses).collect())
    }

    async fn derive_status(&self, job: &Job, snapshot: &DrmSnapshot) -> DrmaaResult<ProgramStatus> {
        if self.is_deleted(&job.id) {
            return Ok(ProgramStatus {
                status: JobStatus::completed(SubStatus::Deleted),
                tasks: None,
            });
        }

        let Some(bounds) = job.array else {
            let status = match snapshot.queued_status(&job.id) {
                Some(status) => JobStatus::new(status),
                None => {
                    let accounting = self.drm.query_accounting(&job.id).await?;
                    JobStatus::completed(completion_sub_status(accounting.job_failed()))
                }
            };
            return Ok(ProgramStatus { status, tasks: None });
        };

        let mut tasks = BTreeMap::new();
        let mut finished = vec![];
        for task_id in bounds.task_ids() {
            match snapshot.task_status(&job.id, task_id) {
                Some(status) => {
                    tasks.insert(task_id, status);
                }
                None => finished.push(task_id),
            }
        }
        if !finished.is_empty() {
            let accounting = self.drm.query_accounting(&job.id).await?;
            for task_id in finished {
                let sub_status = completion_sub_status(accounting.task_failed(task_id));
                tasks.insert(task_id, JobStatus::completed(sub_status));
            }
        }

        Ok(ProgramStatus {
            status: aggregate_array_status(tasks.values()),
            tasks: Some(tasks),
        })
    }

    /// Waits until every selected job left the queue or entered an error
    /// state.
    pub async fn synchronize(
        &self,
        selection: &JobSelection,
        timeout: Timeout,
    ) -> DrmaaResult<Vec<SyncResponse>> {
        let jobs = self.select(selection)?;
        let job_ids: Vec<JobId> = jobs.into_iter().map(|job| job.id).collect();
        let waiting = self.wait_for_events(job_ids);
        match timeout {
            Timeout::WaitForever => waiting.await,
            Timeout::After(timeout) => tokio::time::timeout(timeout, waiting)
                .await
                .map_err(|_| DrmaaError::ExitTimeout)?,
        }
    }

    async fn wait_for_events(&self, job_ids: Vec<JobId>) -> DrmaaResult<Vec<SyncResponse>> {
        let events = self.monitor.subscribe();
        let _watch = self.monitor.register(job_ids.iter().cloned());
        let mut pending: HashSet<JobId> = job_ids.into_iter().collect();
        let mut responses = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            let Some(event) = events.recv().await else {
                return Err(anyhow::anyhow!("Job monitor stopped").into());
            };
            match event {
                MonitorEvent::Completed(job_id) if pending.remove(&job_id) => {
                    tracing::debug!(job_id = %job_id, session = %self.name, "Job completed");
                    let sub_status = if self.is_deleted(&job_id) {
                        SubStatus::Deleted
                    } else {
                        SubStatus::Undetermined
                    };
                    responses.push(SyncResponse {
                        job_id,
                        message: "Job completed".to_owned(),
                        status: JobStatus::completed(sub_status),
                        errors: vec![],
                    });
                }
                MonitorEvent::Error(job_id) if pending.remove(&job_id) => {
                    let details = self.drm.query_job(&job_id).await?;
                    tracing::debug!(job_id = %job_id, session = %self.name, "Job is in error");
                    responses.push(SyncResponse {
                        job_id,
                        message: "Job is in an error state".to_owned(),
                        status: JobStatus::new(MainStatus::Error),
                        errors: details.error_reasons,
                    });
                }
                MonitorEvent::QueryFailed(reason) => {
                    tracing::warn!(session = %self.name, "Still waiting for jobs: {reason}");
                }
                _ => {}
            }
        }

        Ok(responses)
    }

    /// Waits for a job to leave the queue and for its accounting to be
    /// available. The timeout covers both.
    pub async fn wait(&self, job_id: &str, timeout: Timeout) -> DrmaaResult<JobInfo> {
        let job = self.job(job_id)?;
        let waiting = self.wait_for_accounting(job);
        match timeout {
            Timeout::WaitForever => waiting.await,
            Timeout::After(timeout) => tokio::time::timeout(timeout, waiting)
                .await
                .map_err(|_| DrmaaError::ExitTimeout)?,
        }
    }

    async fn wait_for_accounting(&self, job: Job) -> DrmaaResult<JobInfo> {
        let mut responses = self.wait_for_events(vec![job.id.clone()]).await?;
        let errors = responses
            .pop()
            .filter(|response| response.status.main_status == MainStatus::Error)
            .map(|response| response.errors)
            .unwrap_or_default();

        let expected = job.task_count();
        loop {
            let accounting = self.drm.query_accounting(&job.id).await?;
            let deleted = self.is_deleted(&job.id);
            let complete = expected <= 1 || deleted || accounting.record_count() >= expected;
            if accounting.is_found() && complete {
                tracing::debug!(job_id = %job.id, "Job accounting available");
                return Ok(JobInfo {
                    job_id: job.id.to_string(),
                    records: accounting.into_records(),
                    errors,
                    deleted,
                });
            }
            tokio::time::sleep(self.refresh_interval).await;
        }
    }

    /// Applies `action` to the selected jobs. Terminated jobs are remembered
    /// as deleted.
    pub async fn control(
        &self,
        selection: &JobSelection,
        action: ControlAction,
    ) -> DrmaaResult<Vec<ControlResponse>> {
        let jobs = self.select(selection)?;
        try_join_all(jobs.into_iter().map(|job| async move {
            let data = self.drm.control(&job.id, action).await?;
            tracing::info!(job_id = %job.id, session = %self.name, %action, "Job controlled");
            if action == ControlAction::Terminate {
                self.deleted.insert(job.id.clone());
            }
            Ok::<_, DrmaaError>(ControlResponse {
                job_id: job.id,
                action,
                data,
            })
        }))
        .await
    }

    fn select(&self, selection: &JobSelection) -> DrmaaResult<Vec<Job>> {
        let jobs: Vec<Job> = match selection {
            JobSelection::All => self.jobs.iter().map(|job| job.clone()).collect(),
            JobSelection::Ids(ids) => ids
                .iter()
                .map(|id| self.job(id))
                .collect::<DrmaaResult<_>>()?,
        };
        if jobs.is_empty() {
            return Err(DrmaaError::invalid_argument(format!(
                "No jobs selected in session {}",
                self.name
            )));
        }
        Ok(jobs)
    }
}
