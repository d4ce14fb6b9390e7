mod admission;
mod lifecycle;
mod lists;
mod maintenance;
mod params;

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use domain::{
    error::DrmaaResult,
    model::{
        entity::{JobHistoryRecord, JobId, JobType, TaskInfo},
        vo::{JobRequest, JobSelection, MainStatus, RequestData},
    },
};
use tokio::task::JoinHandle;

use crate::{clock, session::Session};

#[rustfmt::skip]
pub use self::{
    admission::{AdmissionError, Verdict},
    lifecycle::{PolicyReport, TickError},
    lists::AccessLists,
    params::SchedulerParams,
};
use self::admission::AdmissionState;

/// A request that passed admission and whose job is now supervised.
#[derive(Debug)]
pub struct Admitted {
    pub ip: String,
    pub time: DateTime<Utc>,
    pub description: String,
    pub verdict: Verdict,
    pub job: JobHistoryRecord,
    /// Resolves once the job reached a terminal state or supervision failed.
    pub supervision: JoinHandle<DrmaaResult<PolicyReport>>,
}

#[derive(Debug, thiserror::Error)]
#[error("Request from {ip} rejected: {reason}")]
pub struct Rejected {
    pub ip: String,
    pub time: DateTime<Utc>,
    #[source]
    pub reason: AdmissionError,
}

/// Admission control and supervision of the jobs submitted through one
/// session.
pub struct SchedulerManager {
    name: String,
    session: Arc<Session>,
    input_file: Option<PathBuf>,
    last_input_update: Mutex<Instant>,
    params: ArcSwap<SchedulerParams>,
    lists: ArcSwap<AccessLists>,
    admission: Mutex<AdmissionState>,
    jobs: DashMap<JobId, JobHistoryRecord>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

/// Slot reserved for a submission in flight.
struct Reservation<'a>(&'a Mutex<AdmissionState>);

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.0).release_pending();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SchedulerManager {
    /// Creates a manager tuned by `input_file`, falling back to the default
    /// parameters when it cannot be read. Must be called within a tokio
    /// runtime.
    pub fn new(
        name: impl Into<String>,
        input_file: Option<PathBuf>,
        session: Arc<Session>,
    ) -> Arc<Self> {
        let params = match &input_file {
            Some(path) => SchedulerParams::load(path).unwrap_or_else(|e| {
                tracing::warn!("Using default scheduler parameters: {e:#}");
                SchedulerParams::default()
            }),
            None => SchedulerParams::default(),
        };
        Self::build(name.into(), input_file, session, params)
    }

    pub fn with_params(
        name: impl Into<String>,
        session: Arc<Session>,
        params: SchedulerParams,
    ) -> Arc<Self> {
        Self::build(name.into(), None, session, params.sanitized())
    }

    fn build(
        name: String,
        input_file: Option<PathBuf>,
        session: Arc<Session>,
        params: SchedulerParams,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            name,
            session,
            input_file,
            last_input_update: Mutex::new(clock::now()),
            params: ArcSwap::from_pointee(params),
            lists: ArcSwap::default(),
            admission: Mutex::default(),
            jobs: DashMap::new(),
            maintenance: Mutex::default(),
        });
        scheduler.load_lists();
        scheduler.start_maintenance();
        tracing::info!(
            scheduler = %scheduler.name,
            session = %scheduler.session.name(),
            "Scheduler started"
        );
        scheduler
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn params(&self) -> Arc<SchedulerParams> {
        self.params.load_full()
    }

    pub fn set_params(&self, params: SchedulerParams) {
        self.params.store(Arc::new(params.sanitized()));
    }

    pub fn lists(&self) -> Arc<AccessLists> {
        self.lists.load_full()
    }

    pub fn set_lists(&self, lists: AccessLists) {
        self.lists.store(Arc::new(lists));
    }

    pub fn history_len(&self) -> usize {
        self.jobs.len()
    }

    pub fn history_record(&self, job_id: &str) -> Option<JobHistoryRecord> {
        self.jobs.get(job_id).map(|record| record.clone())
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.admission).pending()
    }

    pub fn user_count(&self) -> usize {
        lock(&self.admission).user_count()
    }

    /// Admits `request` or explains why it was turned down. Admitted jobs
    /// are added to the history and supervised until they end.
    pub async fn handle_request(
        self: &Arc<Self>,
        request: RequestData,
    ) -> Result<Admitted, Rejected> {
        let ip = request.normalized_ip().to_owned();
        let time = request.time;
        tracing::info!(%ip, %time, "Request received");
        self.refresh_params_if_stale().await;

        let verdict = {
            let params = self.params.load();
            let lists = self.lists.load();
            lock(&self.admission).admit(&ip, time, &lists, &params, self.jobs.len())
        };
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(reason) => {
                tracing::info!(%ip, "Request rejected: {reason}");
                return Err(Rejected { ip, time, reason });
            }
        };
        if verdict == Verdict::Whitelisted {
            tracing::info!(%ip, "Requester is whitelisted");
        }

        let reservation = Reservation(&self.admission);
        let record = match self.submit(&ip, request.job_data).await {
            Ok(record) => record,
            Err(e) => {
                drop(reservation);
                tracing::warn!(%ip, "Job submission failed: {e}");
                return Err(Rejected {
                    ip,
                    time,
                    reason: e.into(),
                });
            }
        };
        self.jobs.insert(record.job_id.clone(), record.clone());
        drop(reservation);
        tracing::info!(
            job_id = %record.job_id,
            history = self.jobs.len(),
            "Added job to the history"
        );

        let supervision = {
            let scheduler = Arc::clone(self);
            let job_id = record.job_id.clone();
            tokio::spawn(async move { scheduler.get_job_result(&job_id).await })
        };

        Ok(Admitted {
            ip,
            time,
            description: format!("Request accepted: job {} submitted.", record.job_id),
            verdict,
            job: record,
            supervision,
        })
    }

    async fn submit(&self, ip: &str, request: JobRequest) -> DrmaaResult<JobHistoryRecord> {
        let bounds = request.array_bounds();
        let JobRequest { template, .. } = request;
        let job_name = template.job_name.clone();
        let job_id = match bounds {
            Some(bounds) => {
                self.session
                    .run_bulk_jobs(template, bounds.start, bounds.end, bounds.increment)
                    .await?
            }
            None => self.session.run_job(template).await?,
        };
        let job = self.session.job(&job_id)?;
        let reference_time = clock::now();

        // The job is already in the DRM: a failed lookup only degrades the record.
        let status = match self
            .session
            .job_program_status(&JobSelection::one(&*job_id))
            .await
        {
            Ok(mut statuses) => statuses.remove(&job_id),
            Err(e) => {
                tracing::warn!(job_id = %job_id, "Unable to read the initial job status: {e}");
                None
            }
        };
        let (job_name, submitted_at) = match self.session.job_details(&job_id).await {
            Ok(details) => (details.job_name, details.submission_time),
            Err(e) => {
                tracing::warn!(job_id = %job_id, "Unable to read the job details: {e}");
                (job_name, Utc::now())
            }
        };

        let main_status = status
            .as_ref()
            .map_or(MainStatus::Queued, |status| status.status.main_status);
        let tasks = job
            .array
            .map(|bounds| {
                bounds
                    .task_ids()
                    .map(|task_id| {
                        let task_status = status
                            .as_ref()
                            .and_then(|status| status.tasks.as_ref())
                            .and_then(|tasks| tasks.get(&task_id))
                            .map_or(MainStatus::Queued, |status| status.main_status);
                        TaskInfo::new(task_id, task_status)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(JobHistoryRecord::builder()
            .job_id(job_id)
            .job_name(job_name)
            .session_name(self.session.name().to_owned())
            .job_type(if job.is_array() { JobType::Array } else { JobType::Single })
            .status(main_status)
            .array(job.array)
            .tasks(tasks)
            .user(ip.to_owned())
            .submitted_at(submitted_at)
            .reference_time(reference_time)
            .build())
    }

    /// Returns whether the job was in the history.
    pub fn remove_job_from_history(&self, job_id: &str) -> bool {
        let removed = self.jobs.remove(job_id).is_some();
        if removed {
            tracing::info!(job_id, history = self.jobs.len(), "Removed job from the history");
        }
        removed
    }
}
