//! In-memory DRM used by the service tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::bail;
use chrono::Utc;
use domain::{
    model::{
        entity::ArrayBounds,
        vo::{
            Accounting, AccountingRecord, ControlAction, DrmSnapshot, DrmsInfo, JobDetails,
            JobTemplate, SnapshotEntry, Version,
        },
    },
    service::DrmAdapter,
};

use crate::{
    scheduler::{SchedulerManager, SchedulerParams},
    session::Session,
    session_manager::SessionManager,
};

#[derive(Default)]
struct State {
    next_id: u64,
    queue: HashMap<String, SnapshotEntry>,
    accounting: HashMap<String, Accounting>,
    details: HashMap<String, JobDetails>,
    controls: Vec<(String, ControlAction)>,
    fail_status: bool,
    fail_control: bool,
    fail_submit: bool,
}

#[derive(Default)]
pub(crate) struct FakeDrm {
    state: Mutex<State>,
}

fn record(job_id: &str, task_id: Option<u32>, failed: &str) -> AccountingRecord {
    AccountingRecord {
        job_id: job_id.to_owned(),
        task_id,
        exit_status: if failed == "0" { 0 } else { 137 },
        failed: failed.to_owned(),
        raw: HashMap::new(),
    }
}

impl FakeDrm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_id: 1,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn enqueue(&self, job_id: &str, code: &str) {
        let mut state = self.state();
        state.queue.insert(
            job_id.to_owned(),
            SnapshotEntry::Single {
                state: code.to_owned(),
            },
        );
        state.details.insert(
            job_id.to_owned(),
            JobDetails {
                job_id: job_id.to_owned(),
                job_name: "job".to_owned(),
                submission_time: Utc::now(),
                error_reasons: vec![],
            },
        );
    }

    pub fn set_state(&self, job_id: &str, code: &str) {
        if let Some(SnapshotEntry::Single { state }) = self.state().queue.get_mut(job_id) {
            *state = code.to_owned();
        }
    }

    /// Removes a job from the queue without leaving any accounting.
    pub fn vanish(&self, job_id: &str) {
        self.state().queue.remove(job_id);
    }

    pub fn set_task_state(&self, job_id: &str, task_id: u32, code: &str) {
        if let Some(SnapshotEntry::Array { tasks }) = self.state().queue.get_mut(job_id) {
            tasks.insert(task_id, code.to_owned());
        }
    }

    /// Removes a job from the queue and records its accounting.
    pub fn finish(&self, job_id: &str, failed: &str) {
        let mut state = self.state();
        state.queue.remove(job_id);
        state
            .accounting
            .insert(job_id.to_owned(), Accounting::Single(record(job_id, None, failed)));
    }

    pub fn finish_task(&self, job_id: &str, task_id: u32, failed: &str) {
        let mut state = self.state();
        let emptied = match state.queue.get_mut(job_id) {
            Some(SnapshotEntry::Array { tasks }) => {
                tasks.remove(&task_id);
                tasks.is_empty()
            }
            _ => false,
        };
        if emptied {
            state.queue.remove(job_id);
        }
        let accounting = state
            .accounting
            .entry(job_id.to_owned())
            .or_insert_with(|| Accounting::Array(BTreeMap::new()));
        if let Accounting::Array(tasks) = accounting {
            tasks.insert(task_id, record(job_id, Some(task_id), failed));
        }
    }

    pub fn set_error_reasons(&self, job_id: &str, reasons: &[&str]) {
        if let Some(details) = self.state().details.get_mut(job_id) {
            details.error_reasons = reasons.iter().map(|r| r.to_string()).collect();
        }
    }

    pub fn fail_status(&self, fail: bool) {
        self.state().fail_status = fail;
    }

    pub fn fail_control(&self, fail: bool) {
        self.state().fail_control = fail;
    }

    pub fn fail_submit(&self, fail: bool) {
        self.state().fail_submit = fail;
    }

    pub fn controls(&self) -> Vec<(String, ControlAction)> {
        self.state().controls.clone()
    }

    pub fn queued(&self, job_id: &str) -> bool {
        self.state().queue.contains_key(job_id)
    }

    fn new_job(&self, template: &JobTemplate, entry: SnapshotEntry) -> anyhow::Result<String> {
        let mut state = self.state();
        if state.fail_submit {
            bail!("Unable to run job: denied by the DRM");
        }
        let job_id = state.next_id.to_string();
        state.next_id += 1;
        state.queue.insert(job_id.clone(), entry);
        state.details.insert(
            job_id.clone(),
            JobDetails {
                job_id: job_id.clone(),
                job_name: template.job_name.clone(),
                submission_time: Utc::now(),
                error_reasons: vec![],
            },
        );
        Ok(job_id)
    }
}

#[async_trait::async_trait]
impl DrmAdapter for FakeDrm {
    async fn drms_info(&self) -> anyhow::Result<DrmsInfo> {
        Ok(DrmsInfo {
            drms_name: "GE".to_owned(),
            version: Version {
                major: "8".to_owned(),
                minor: "1".to_owned(),
            },
        })
    }

    async fn submit(&self, template: &JobTemplate) -> anyhow::Result<String> {
        self.new_job(
            template,
            SnapshotEntry::Single {
                state: "qw".to_owned(),
            },
        )
    }

    async fn submit_array(
        &self,
        template: &JobTemplate,
        bounds: ArrayBounds,
    ) -> anyhow::Result<(String, ArrayBounds)> {
        let tasks = bounds.task_ids().map(|id| (id, "qw".to_owned())).collect();
        let job_id = self.new_job(template, SnapshotEntry::Array { tasks })?;
        Ok((job_id, bounds))
    }

    async fn query_status(&self) -> anyhow::Result<DrmSnapshot> {
        let state = self.state();
        if state.fail_status {
            bail!("error: failed receiving gdi request");
        }
        Ok(DrmSnapshot {
            jobs: state.queue.clone(),
        })
    }

    async fn query_job(&self, job_id: &str) -> anyhow::Result<JobDetails> {
        match self.state().details.get(job_id) {
            Some(details) => Ok(details.clone()),
            None => bail!("Following jobs do not exist: {job_id}"),
        }
    }

    async fn query_accounting(&self, job_id: &str) -> anyhow::Result<Accounting> {
        Ok(self
            .state()
            .accounting
            .get(job_id)
            .cloned()
            .unwrap_or(Accounting::NotFound))
    }

    async fn control(&self, job_id: &str, action: ControlAction) -> anyhow::Result<String> {
        let mut state = self.state();
        if state.fail_control {
            bail!("denied: job \"{job_id}\" does not exist");
        }
        state.controls.push((job_id.to_owned(), action));
        if action == ControlAction::Terminate {
            let accounting = match state.queue.remove(job_id) {
                Some(SnapshotEntry::Single { state: code }) if code == "r" => {
                    Some(Accounting::Single(record(job_id, None, "100")))
                }
                Some(SnapshotEntry::Array { tasks }) => {
                    let ran: BTreeMap<_, _> = tasks
                        .iter()
                        .filter(|(_, code)| code.as_str() == "r")
                        .map(|(id, _)| (*id, record(job_id, Some(*id), "100")))
                        .collect();
                    (!ran.is_empty()).then_some(Accounting::Array(ran))
                }
                _ => None,
            };
            if let Some(accounting) = accounting {
                let merged = match (state.accounting.remove(job_id), accounting) {
                    (Some(Accounting::Array(mut existing)), Accounting::Array(ran)) => {
                        existing.extend(ran);
                        Accounting::Array(existing)
                    }
                    (_, accounting) => accounting,
                };
                state.accounting.insert(job_id.to_owned(), merged);
            }
        }
        Ok(format!("{action} {job_id}"))
    }
}

pub(crate) const TEST_REFRESH: Duration = Duration::from_millis(10);

pub(crate) struct Harness {
    pub drm: Arc<FakeDrm>,
    pub manager: SessionManager,
    pub session: Arc<Session>,
}

pub(crate) async fn harness() -> Harness {
    let drm = FakeDrm::new();
    let manager = SessionManager::with_refresh_interval(drm.clone(), TEST_REFRESH)
        .await
        .unwrap();
    let session = manager.create_session("test", None).unwrap();
    Harness {
        drm,
        manager,
        session,
    }
}

impl Harness {
    pub fn scheduler(&self, params: SchedulerParams) -> Arc<SchedulerManager> {
        SchedulerManager::with_params("test", self.session.clone(), params)
    }
}
