use std::{
    collections::{HashMap, HashSet},
    ops::ControlFlow,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use domain::{model::entity::JobId, model::vo::MainStatus, service::DrmAdapter};
use infrastructure::sync::{timer, Notifier, Subscription};
use tokio::task::JoinHandle;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(1000);

/// Outcome of one monitoring pass, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The job left the DRM queue.
    Completed(JobId),
    /// The job (or one of its tasks) is in an error state.
    Error(JobId),
    /// The DRM could not be queried; registrations are kept.
    QueryFailed(Arc<str>),
}

struct Registration {
    generation: u64,
    tokens: HashSet<u64>,
}

#[derive(Default)]
struct Queue {
    generation: u64,
    next_token: u64,
    jobs: HashMap<JobId, Registration>,
}

/// Polls the DRM for the registered jobs and reports the ones that left the
/// queue or entered an error state.
pub struct JobMonitor {
    drm: Arc<dyn DrmAdapter>,
    queue: Mutex<Queue>,
    events: Notifier<MonitorEvent>,
    interval: Duration,
}

/// Registration of a set of jobs. Dropping it deregisters whatever the
/// monitor has not already reported.
pub struct Watch<'a> {
    monitor: &'a JobMonitor,
    token: u64,
    job_ids: Vec<JobId>,
}

impl JobMonitor {
    pub fn new(drm: Arc<dyn DrmAdapter>, interval: Duration) -> Self {
        Self {
            drm,
            queue: Mutex::default(),
            events: Notifier::new(),
            interval,
        }
    }

    /// Polls on a fixed interval for as long as the monitor is alive.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(timer::new(self.interval, move || {
            let monitor = monitor.clone();
            async move {
                match monitor.upgrade() {
                    Some(monitor) => {
                        monitor.poll_once().await;
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                }
            }
        }))
    }

    pub fn subscribe(&self) -> Subscription<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn register(&self, job_ids: impl IntoIterator<Item = JobId>) -> Watch<'_> {
        let mut queue = self.lock_queue();
        let token = queue.next_token;
        queue.next_token += 1;
        let generation = queue.generation;
        let job_ids: Vec<JobId> = job_ids.into_iter().collect();
        for job_id in &job_ids {
            queue
                .jobs
                .entry(job_id.clone())
                .or_insert_with(|| Registration {
                    generation,
                    tokens: HashSet::new(),
                })
                .tokens
                .insert(token);
        }
        Watch {
            monitor: self,
            token,
            job_ids,
        }
    }

    pub fn registered_count(&self) -> usize {
        self.lock_queue().jobs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Queries the DRM once and reports every registered job that left the
    /// queue or is in error. Reported jobs are deregistered.
    pub async fn poll_once(&self) {
        let generation = {
            let mut queue = self.lock_queue();
            if queue.jobs.is_empty() {
                return;
            }
            queue.generation += 1;
            queue.generation
        };

        let snapshot = match self.drm.query_status().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Job monitor could not query the DRM: {e:#}");
                self.events.publish(MonitorEvent::QueryFailed(format!("{e:#}").into()));
                return;
            }
        };

        let mut events = vec![];
        // Jobs registered after the query started may be missing from the snapshot.
        self.lock_queue().jobs.retain(|job_id, registration| {
            if registration.generation >= generation {
                return true;
            }
            match snapshot.queued_status(job_id) {
                None => {
                    events.push(MonitorEvent::Completed(job_id.clone()));
                    false
                }
                Some(MainStatus::Error) => {
                    events.push(MonitorEvent::Error(job_id.clone()));
                    false
                }
                Some(_) => true,
            }
        });

        for event in events {
            match &event {
                MonitorEvent::Completed(job_id) => {
                    tracing::debug!(job_id = %job_id, "Job left the queue")
                }
                MonitorEvent::Error(job_id) => {
                    tracing::debug!(job_id = %job_id, "Job is in error")
                }
                MonitorEvent::QueryFailed(_) => {}
            }
            self.events.publish(event);
        }
    }

    fn deregister(&self, token: u64, job_ids: &[JobId]) {
        let mut queue = self.lock_queue();
        for job_id in job_ids {
            if let Some(registration) = queue.jobs.get_mut(job_id) {
                registration.tokens.remove(&token);
                if registration.tokens.is_empty() {
                    queue.jobs.remove(job_id);
                }
            }
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Watch<'_> {
    fn drop(&mut self) {
        self.monitor.deregister(self.token, &self.job_ids);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{OnceLock, Weak};

    use anyhow::anyhow;
    use domain::{model::vo::DrmSnapshot, service::MockDrmAdapter};

    use super::*;
    use crate::testing::FakeDrm;

    fn id(s: &str) -> JobId {
        Arc::from(s)
    }

    #[tokio::test]
    async fn reports_completed_and_error_jobs() {
        let drm = FakeDrm::new();
        drm.enqueue("1", "r");
        drm.enqueue("2", "Eqw");
        drm.enqueue("3", "qw");
        let monitor = JobMonitor::new(drm.clone(), DEFAULT_REFRESH_INTERVAL);
        let events = monitor.subscribe();
        let _watch = monitor.register([id("1"), id("2"), id("3")]);

        drm.finish("1", "0");
        monitor.poll_once().await;

        let mut received = vec![events.recv().await.unwrap(), events.recv().await.unwrap()];
        received.sort_by_key(|event| format!("{event:?}"));
        assert_eq!(
            received,
            vec![MonitorEvent::Completed(id("1")), MonitorEvent::Error(id("2"))]
        );
        assert_eq!(monitor.registered_count(), 1);
    }

    #[tokio::test]
    async fn query_failure_is_broadcast_and_keeps_registrations() {
        let mut drm = MockDrmAdapter::new();
        drm.expect_query_status()
            .times(1)
            .returning(|| Err(anyhow!("qstat: command not found")));
        let monitor = JobMonitor::new(Arc::new(drm), DEFAULT_REFRESH_INTERVAL);
        let events = monitor.subscribe();
        let _watch = monitor.register([id("1")]);

        monitor.poll_once().await;

        assert_eq!(
            events.recv().await,
            Some(MonitorEvent::QueryFailed("qstat: command not found".into()))
        );
        assert_eq!(monitor.registered_count(), 1);
    }

    #[tokio::test]
    async fn jobs_registered_during_a_query_wait_for_the_next_one() {
        let monitor_slot: Arc<OnceLock<Weak<JobMonitor>>> = Arc::default();
        let mut drm = MockDrmAdapter::new();
        let slot = monitor_slot.clone();
        drm.expect_query_status().times(2).returning(move || {
            if let Some(monitor) = slot.get().and_then(Weak::upgrade) {
                // Stays registered until reported.
                std::mem::forget(monitor.register([id("late")]));
            }
            Ok(DrmSnapshot::default())
        });
        let monitor = Arc::new(JobMonitor::new(Arc::new(drm), DEFAULT_REFRESH_INTERVAL));
        assert!(monitor_slot.set(Arc::downgrade(&monitor)).is_ok());
        let events = monitor.subscribe();
        let _watch = monitor.register([id("early")]);

        monitor.poll_once().await;
        assert_eq!(events.recv().await, Some(MonitorEvent::Completed(id("early"))));
        assert_eq!(monitor.registered_count(), 1);

        monitor.poll_once().await;
        assert_eq!(events.recv().await, Some(MonitorEvent::Completed(id("late"))));
    }

    #[tokio::test]
    async fn idle_monitor_does_not_query() {
        let drm = MockDrmAdapter::new();
        let monitor = JobMonitor::new(Arc::new(drm), DEFAULT_REFRESH_INTERVAL);
        monitor.poll_once().await;
    }

    #[test]
    fn dropping_a_watch_keeps_other_waiters() {
        let monitor = JobMonitor::new(FakeDrm::new(), DEFAULT_REFRESH_INTERVAL);
        let first = monitor.register([id("1"), id("2")]);
        let second = monitor.register([id("2")]);
        assert_eq!(monitor.registered_count(), 2);

        drop(first);
        assert_eq!(monitor.registered_count(), 1);
        drop(second);
        assert_eq!(monitor.registered_count(), 0);
    }

    #[tokio::test]
    async fn spawned_loop_stops_with_the_monitor() {
        let monitor = Arc::new(JobMonitor::new(FakeDrm::new(), Duration::from_millis(10)));
        let handle = monitor.spawn();
        drop(monitor);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
