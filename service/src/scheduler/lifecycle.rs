use std::time::{Duration, Instant};

use domain::{
    error::{DrmaaError, DrmaaResult},
    model::{
        entity::{JobHistoryRecord, JobType, TaskInfo},
        vo::{ControlAction, JobInfo, JobSelection, JobStatus, MainStatus, SubStatus},
    },
};
use serde::Serialize;

use super::SchedulerManager;
use crate::{clock, session::ProgramStatus};

/// Upper bound on waiting for the accounting of a job that left the queue.
const FINAL_ACCOUNTING_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one supervision round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReport {
    pub job_id: String,
    pub job_name: String,
    pub session_name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<Vec<String>>,
    pub errors: Vec<String>,
    pub description: String,
}

impl PolicyReport {
    fn new(record: &JobHistoryRecord, status: JobStatus, description: impl Into<String>) -> Self {
        Self {
            job_id: record.job_id.to_string(),
            job_name: record.job_name.clone(),
            session_name: record.session_name.clone(),
            status,
            exit_status: None,
            failed: None,
            errors: vec![],
            description: description.into(),
        }
    }

    /// Job deleted for overrunning the time budget of `stage`.
    fn exceeded(record: &JobHistoryRecord, stage: MainStatus, info: Option<JobInfo>) -> Self {
        let reason = format!("Maximum {stage} runtime exceeded.");
        Self::new(record, JobStatus::completed(SubStatus::Deleted), reason.clone())
            .with_errors(vec![reason])
            .with_info(info)
    }

    fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors.extend(errors);
        self
    }

    fn with_info(mut self, info: Option<JobInfo>) -> Self {
        if let Some(info) = info {
            self.exit_status = Some(info.exit_statuses());
            self.failed = Some(info.failures());
            self.errors.extend(info.errors);
        }
        self
    }
}

/// Failure of one supervision round.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    /// Retried on the next round.
    #[error("Error reading status for job {job_id}: {source}")]
    Transient {
        job_id: String,
        #[source]
        source: DrmaaError,
    },
    /// Supervision stops and the job leaves the history.
    #[error("Supervision of job {job_id} aborted: {source}")]
    Fatal {
        job_id: String,
        #[source]
        source: DrmaaError,
    },
}

impl TickError {
    fn transient(job_id: &str) -> impl FnOnce(DrmaaError) -> Self + '_ {
        move |source| Self::Transient {
            job_id: job_id.to_owned(),
            source,
        }
    }

    fn fatal(job_id: &str) -> impl FnOnce(DrmaaError) -> Self + '_ {
        move |source| Self::Fatal {
            job_id: job_id.to_owned(),
            source,
        }
    }
}

/// Updates the running-time bookkeeping of a task seen in `current` and
/// returns the running time gained since the last update.
pub(crate) fn account_task(task: &mut TaskInfo, current: MainStatus, now: Instant) -> Duration {
    let previous = task.running_time;
    match current {
        MainStatus::Running if task.status != MainStatus::Running => {
            task.status = MainStatus::Running;
            task.running_start = Some(now);
        }
        MainStatus::Running => {
            let start = *task.running_start.get_or_insert(now);
            task.running_time = now.saturating_duration_since(start);
        }
        MainStatus::Completed => {
            task.status = MainStatus::Completed;
            if let Some(start) = task.running_start {
                task.running_time = now.saturating_duration_since(start);
            }
        }
        _ => {}
    }
    task.running_time.saturating_sub(previous)
}

impl SchedulerManager {
    /// Supervises a job of the history until it reaches a terminal state.
    ///
    /// Transient failures are logged and retried. A fatal one removes the
    /// job from the history and is returned.
    pub async fn get_job_result(&self, job_id: &str) -> DrmaaResult<PolicyReport> {
        loop {
            let interval = self.params.load().job_polling_interval;
            tokio::time::sleep(interval).await;
            if !self.jobs.contains_key(job_id) {
                return Err(DrmaaError::invalid_argument(format!(
                    "Job {job_id} is not in the job history"
                )));
            }

            match self.poll_job(job_id).await {
                Ok(report) if report.status.is_terminal() => {
                    tracing::info!(
                        job_id,
                        status = %report.status.main_status,
                        "{}",
                        report.description
                    );
                    return Ok(report);
                }
                Ok(report) => {
                    tracing::debug!(
                        job_id,
                        status = %report.status.main_status,
                        "{}",
                        report.description
                    );
                }
                Err(e @ TickError::Transient { .. }) => tracing::warn!(job_id, "{e}"),
                Err(TickError::Fatal { source, .. }) => {
                    tracing::error!(job_id, "Supervision aborted: {source}");
                    self.remove_job_from_history(job_id);
                    return Err(source);
                }
            }
        }
    }

    /// One supervision round of a job of the history.
    pub async fn poll_job(&self, job_id: &str) -> Result<PolicyReport, TickError> {
        let record = self.history_record(job_id).ok_or_else(|| {
            TickError::fatal(job_id)(DrmaaError::invalid_argument(format!(
                "Job {job_id} is not in the job history"
            )))
        })?;
        let status = self
            .session
            .job_program_status(&JobSelection::one(job_id))
            .await
            .and_then(|mut statuses| {
                statuses.remove(job_id).ok_or_else(|| {
                    DrmaaError::invalid_argument(format!("No status returned for job {job_id}"))
                })
            })
            .map_err(TickError::transient(job_id))?;

        match record.job_type {
            JobType::Single => self.monitor_single_job(&record, status.status).await,
            JobType::Array => self.monitor_array_job(&record, status).await,
        }
    }

    async fn monitor_single_job(
        &self,
        record: &JobHistoryRecord,
        status: JobStatus,
    ) -> Result<PolicyReport, TickError> {
        let job_id: &str = &record.job_id;
        let now = clock::now();
        let current = status.main_status;

        if current == MainStatus::Running && record.status != MainStatus::Running {
            tracing::info!(job_id, "Job switched from {} to {current}", record.status);
            if let Some(mut entry) = self.jobs.get_mut(job_id) {
                entry.status = MainStatus::Running;
                entry.reference_time = now;
            }
            let description = format!("Job switched from {} to {current}.", record.status);
            return Ok(PolicyReport::new(record, status, description));
        }

        match current {
            MainStatus::Completed => self.finish_job(record, status).await,
            MainStatus::Error => self.terminate_error_job(record).await,
            _ => {
                let budget = {
                    let params = self.params.load();
                    if current == MainStatus::Running {
                        params.max_job_running_time
                    } else {
                        params.max_job_queued_time
                    }
                };
                if now.saturating_duration_since(record.reference_time) <= budget {
                    return Ok(PolicyReport::new(record, status, "Job still running."));
                }

                tracing::info!(
                    job_id,
                    job_name = %record.job_name,
                    "Job has exceeded maximum {current} runtime"
                );
                let info = self
                    .delete_job(job_id, current == MainStatus::Running)
                    .await
                    .map_err(TickError::fatal(job_id))?;
                Ok(PolicyReport::exceeded(record, current, info))
            }
        }
    }

    /// Queued budget is judged on the first task only, assuming the DRM
    /// starts array tasks in index order.
    async fn monitor_array_job(
        &self,
        record: &JobHistoryRecord,
        status: ProgramStatus,
    ) -> Result<PolicyReport, TickError> {
        let job_id: &str = &record.job_id;
        match status.status.main_status {
            MainStatus::Error => return self.terminate_error_job(record).await,
            MainStatus::Completed => return self.finish_job(record, status.status).await,
            _ => {}
        }

        let Some(bounds) = record.array else {
            return Err(TickError::fatal(job_id)(DrmaaError::invalid_argument(format!(
                "Array job {job_id} has no task range"
            ))));
        };
        let tasks = status.tasks.unwrap_or_default();
        let params = self.params.load_full();
        let now = clock::now();

        let first = tasks
            .get(&bounds.start)
            .map_or(MainStatus::Undetermined, |task| task.main_status);
        if !matches!(first, MainStatus::Running | MainStatus::Completed)
            && now.saturating_duration_since(record.reference_time)
                > params.max_array_job_queued_time
        {
            tracing::info!(
                job_id,
                job_name = %record.job_name,
                "Job has exceeded maximum {first} runtime. Terminating"
            );
            self.delete_job(job_id, false)
                .await
                .map_err(TickError::fatal(job_id))?;
            return Ok(PolicyReport::exceeded(record, first, None));
        }

        let mut updated = record.clone();
        for task_id in bounds.task_ids() {
            let Some(current) = tasks.get(&task_id).map(|task| task.main_status) else {
                continue;
            };
            let Some(task) = updated.task_mut(task_id) else {
                continue;
            };
            if task.status == MainStatus::Completed {
                continue;
            }
            let gained = account_task(task, current, now);
            updated.total_execution_time += gained;

            if updated.total_execution_time > params.max_array_job_running_time {
                tracing::info!(
                    job_id,
                    job_name = %record.job_name,
                    "Job has exceeded maximum RUNNING runtime. Terminating"
                );
                let info = self
                    .delete_job(job_id, true)
                    .await
                    .map_err(TickError::fatal(job_id))?;
                return Ok(PolicyReport::exceeded(record, MainStatus::Running, info));
            }
        }

        if let Some(mut entry) = self.jobs.get_mut(job_id) {
            entry.tasks = updated.tasks;
            entry.total_execution_time = updated.total_execution_time;
        }
        Ok(PolicyReport::new(record, status.status, "Job still RUNNING."))
    }

    async fn finish_job(
        &self,
        record: &JobHistoryRecord,
        status: JobStatus,
    ) -> Result<PolicyReport, TickError> {
        let job_id: &str = &record.job_id;
        let info = self
            .session
            .wait(job_id, FINAL_ACCOUNTING_TIMEOUT.into())
            .await
            .map_err(TickError::transient(job_id))?;
        self.remove_job_from_history(job_id);
        Ok(
            PolicyReport::new(record, status, "Job completed within allotted runtimes.")
                .with_info(Some(info)),
        )
    }

    /// Deletes a job in error, reporting the DRM's diagnostics.
    async fn terminate_error_job(
        &self,
        record: &JobHistoryRecord,
    ) -> Result<PolicyReport, TickError> {
        let job_id: &str = &record.job_id;
        let diagnostics = match self.session.job_details(job_id).await {
            Ok(details) => details.error_reasons,
            Err(e) => {
                tracing::warn!(job_id, "Unable to read the error reasons: {e}");
                vec![]
            }
        };
        let ran = record.status == MainStatus::Running
            || record
                .tasks
                .iter()
                .any(|task| task.running_start.is_some() || task.status == MainStatus::Completed);
        let info = self
            .delete_job(job_id, ran)
            .await
            .map_err(TickError::fatal(job_id))?;

        Ok(PolicyReport::new(
            record,
            JobStatus::with_sub(MainStatus::Error, SubStatus::Deleted),
            "An error occurred.",
        )
        .with_errors(diagnostics)
        .with_info(info))
    }

    /// Terminates a job of the history and removes it once done. When
    /// `with_accounting` is set, waits for the job's final accounting first.
    ///
    /// Returns `Ok(None)` without touching the DRM if the job already left
    /// the history.
    pub async fn delete_job(
        &self,
        job_id: &str,
        with_accounting: bool,
    ) -> DrmaaResult<Option<JobInfo>> {
        if !self.jobs.contains_key(job_id) {
            tracing::debug!(job_id, "Job already removed from the history");
            return Ok(None);
        }

        self.session
            .control(&JobSelection::one(job_id), ControlAction::Terminate)
            .await
            .map_err(|e| {
                tracing::error!(job_id, "Unable to terminate the job: {e}");
                e
            })?;
        tracing::info!(job_id, "Job terminated");

        let info = if with_accounting {
            Some(self.session.wait(job_id, FINAL_ACCOUNTING_TIMEOUT.into()).await?)
        } else {
            None
        };
        self.remove_job_from_history(job_id);
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        scheduler::{tests::request, SchedulerParams},
        testing::harness,
    };

    fn params() -> SchedulerParams {
        SchedulerParams {
            max_concurrent_jobs: 100,
            max_requests_per_sec_user: 100,
            max_requests_per_sec_global: 100,
            job_polling_interval: Duration::from_millis(100),
            max_job_queued_time: Duration::from_secs(1),
            max_job_running_time: Duration::from_secs(2),
            max_array_job_queued_time: Duration::from_secs(1),
            max_array_job_running_time: Duration::from_secs(3),
            ..Default::default()
        }
    }

    fn array_request(start: i64, end: i64) -> domain::model::vo::RequestData {
        let mut request = request("1.1.1.1", Utc::now());
        request.job_data.start = Some(start);
        request.job_data.end = Some(end);
        request.job_data.incr = Some(1);
        request
    }

    #[test]
    fn task_running_time_is_tracked_lazily() {
        let t0 = Instant::now();
        let mut task = TaskInfo::new(1, MainStatus::Queued);

        assert_eq!(account_task(&mut task, MainStatus::Queued, t0), Duration::ZERO);
        assert_eq!(account_task(&mut task, MainStatus::Running, t0), Duration::ZERO);
        assert_eq!(task.running_start, Some(t0));
        assert_eq!(
            account_task(&mut task, MainStatus::Running, t0 + Duration::from_secs(2)),
            Duration::from_secs(2)
        );
        assert_eq!(
            account_task(&mut task, MainStatus::Completed, t0 + Duration::from_secs(3)),
            Duration::from_secs(1)
        );
        assert_eq!(task.status, MainStatus::Completed);
        assert_eq!(task.running_time, Duration::from_secs(3));

        // Already running at submission: the start is the first sighting.
        let mut task = TaskInfo::new(2, MainStatus::Running);
        assert_eq!(account_task(&mut task, MainStatus::Running, t0), Duration::ZERO);
        assert_eq!(task.running_start, Some(t0));

        // Completed without ever being seen running.
        let mut task = TaskInfo::new(3, MainStatus::Queued);
        assert_eq!(account_task(&mut task, MainStatus::Completed, t0), Duration::ZERO);
        assert_eq!(task.status, MainStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_single_job_is_deleted_after_its_budget() {
        let h = harness().await;
        let scheduler = h.scheduler(params());
        let admitted = scheduler.handle_request(request("1.1.1.1", Utc::now())).await.unwrap();
        let job_id = admitted.job.job_id.clone();

        let report = admitted.supervision.await.unwrap().unwrap();

        assert_eq!(report.status, JobStatus::completed(SubStatus::Deleted));
        assert_eq!(report.errors, vec!["Maximum QUEUED runtime exceeded."]);
        assert_eq!(report.description, "Maximum QUEUED runtime exceeded.");
        assert_eq!(report.exit_status, None);
        assert_eq!(h.drm.controls(), vec![(job_id.to_string(), ControlAction::Terminate)]);
        assert_eq!(scheduler.history_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn running_budget_restarts_when_the_job_starts() {
        let h = harness().await;
        let scheduler = h.scheduler(params());
        let admitted = scheduler.handle_request(request("1.1.1.1", Utc::now())).await.unwrap();
        let job_id = admitted.job.job_id.clone();

        // Queued for most of the queued budget, then running.
        tokio::time::sleep(Duration::from_millis(950)).await;
        h.drm.set_state(&job_id, "r");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            scheduler.history_record(&job_id).unwrap().status,
            MainStatus::Running
        );

        let report = admitted.supervision.await.unwrap().unwrap();
        assert_eq!(report.errors, vec!["Maximum RUNNING runtime exceeded."]);
        assert_eq!(report.exit_status, Some(vec![137]));
        assert_eq!(report.failed, Some(vec!["100".to_owned()]));
        assert!(!h.drm.queued(&job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn job_in_error_is_deleted_with_diagnostics() {
        let h = harness().await;
        let scheduler = h.scheduler(params());
        let admitted = scheduler.handle_request(request("1.1.1.1", Utc::now())).await.unwrap();
        let job_id = admitted.job.job_id.clone();
        h.drm.set_state(&job_id, "Eqw");
        h.drm.set_error_reasons(&job_id, &["error: can't chdir to /scratch"]);

        let report = admitted.supervision.await.unwrap().unwrap();
        assert_eq!(
            report.status,
            JobStatus::with_sub(MainStatus::Error, SubStatus::Deleted)
        );
        assert_eq!(report.errors, vec!["error: can't chdir to /scratch"]);
        assert_eq!(report.description, "An error occurred.");
        assert_eq!(scheduler.history_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn array_job_with_a_task_in_error_is_deleted() {
        let h = harness().await;
        let scheduler = h.scheduler(params());
        let admitted = scheduler.handle_request(array_request(1, 10)).await.unwrap();
        let job_id = admitted.job.job_id.clone();
        for task_id in 1..=10 {
            h.drm.set_task_state(&job_id, task_id, "r");
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        for task_id in (1..=10).filter(|id| *id != 7) {
            h.drm.finish_task(&job_id, task_id, "0");
        }
        h.drm.set_task_state(&job_id, 7, "Eqw");

        let report = admitted.supervision.await.unwrap().unwrap();
        assert_eq!(report.status.main_status, MainStatus::Error);
        assert_eq!(report.status.sub_status, Some(SubStatus::Deleted));
        assert_eq!(scheduler.history_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn array_job_queued_past_its_budget_is_deleted() {
        let h = harness().await;
        let scheduler = h.scheduler(params());
        let admitted = scheduler.handle_request(array_request(1, 4)).await.unwrap();
        let job_id = admitted.job.job_id.clone();
        // Later tasks running do not count while the first one waits.
        h.drm.set_task_state(&job_id, 3, "r");

        let report = admitted.supervision.await.unwrap().unwrap();
        assert_eq!(report.status, JobStatus::completed(SubStatus::Deleted));
        assert_eq!(report.errors, vec!["Maximum QUEUED runtime exceeded."]);
        assert_eq!(h.drm.controls(), vec![(job_id.to_string(), ControlAction::Terminate)]);
    }

    #[tokio::test(start_paused = true)]
    async fn array_running_time_adds_up_across_tasks() {
        let h = harness().await;
        let scheduler = h.scheduler(params());
        let started = tokio::time::Instant::now();
        let admitted = scheduler.handle_request(array_request(1, 2)).await.unwrap();
        let job_id = admitted.job.job_id.clone();
        h.drm.set_task_state(&job_id, 1, "r");
        h.drm.set_task_state(&job_id, 2, "r");

        // Two tasks running in parallel exhaust 3 s of budget in about 1.5 s.
        let report = admitted.supervision.await.unwrap().unwrap();
        assert_eq!(report.errors, vec!["Maximum RUNNING runtime exceeded."]);
        assert_eq!(report.exit_status, Some(vec![137, 137]));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_array_job_reports_accounting() {
        let h = harness().await;
        let scheduler = h.scheduler(params());
        let admitted = scheduler.handle_request(array_request(1, 3)).await.unwrap();
        let job_id = admitted.job.job_id.clone();
        h.drm.finish_task(&job_id, 1, "0");
        h.drm.finish_task(&job_id, 2, "0");
        h.drm.finish_task(&job_id, 3, "1 : before job");

        let report = admitted.supervision.await.unwrap().unwrap();
        assert_eq!(report.status, JobStatus::completed(SubStatus::Failed));
        assert_eq!(report.description, "Job completed within allotted runtimes.");
        assert_eq!(report.exit_status, Some(vec![0, 0, 137]));
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_twice_terminates_once() {
        let h = harness().await;
        let scheduler = h.scheduler(SchedulerParams {
            job_polling_interval: Duration::from_secs(60),
            ..params()
        });
        let admitted = scheduler.handle_request(request("1.1.1.1", Utc::now())).await.unwrap();
        let job_id = admitted.job.job_id.clone();

        assert_eq!(scheduler.delete_job(&job_id, false).await.unwrap(), None);
        assert_eq!(scheduler.delete_job(&job_id, false).await.unwrap(), None);
        assert_eq!(h.drm.controls().len(), 1);
        assert_eq!(scheduler.history_len(), 0);

        let err = admitted.supervision.await.unwrap().unwrap_err();
        assert!(matches!(err, DrmaaError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_termination_aborts_supervision() {
        let h = harness().await;
        let scheduler = h.scheduler(params());
        let admitted = scheduler.handle_request(request("1.1.1.1", Utc::now())).await.unwrap();
        h.drm.fail_control(true);

        let err = admitted.supervision.await.unwrap().unwrap_err();
        assert!(matches!(err, DrmaaError::Adapter(_)));
        assert_eq!(scheduler.history_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_query_failures_are_retried() {
        let h = harness().await;
        let scheduler = h.scheduler(SchedulerParams {
            max_job_queued_time: Duration::from_secs(60),
            ..params()
        });
        let admitted = scheduler.handle_request(request("1.1.1.1", Utc::now())).await.unwrap();
        let job_id = admitted.job.job_id.clone();
        h.drm.fail_status(true);

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert!(!admitted.supervision.is_finished());
        assert_eq!(scheduler.history_len(), 1);

        h.drm.fail_status(false);
        h.drm.finish(&job_id, "0");
        let report = admitted.supervision.await.unwrap().unwrap();
        assert_eq!(report.status, JobStatus::completed(SubStatus::Done));
    }
}
