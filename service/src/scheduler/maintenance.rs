use std::{
    future::Future,
    ops::ControlFlow,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use infrastructure::sync::timer;

use super::{lists::AccessLists, lock, params::SchedulerParams, SchedulerManager};
use crate::clock;

/// Runs `f` every `interval(params)` for as long as the scheduler lives.
fn every<I, F, Fut>(
    scheduler: &Arc<SchedulerManager>,
    interval: I,
    f: F,
) -> tokio::task::JoinHandle<()>
where
    I: Fn(&SchedulerParams) -> Duration + Send + 'static,
    F: Fn(Arc<SchedulerManager>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak: Weak<SchedulerManager> = Arc::downgrade(scheduler);
    let delay_of = weak.clone();
    tokio::spawn(timer::dynamic(
        move || match delay_of.upgrade() {
            Some(scheduler) => ControlFlow::Continue(interval(&scheduler.params.load())),
            None => ControlFlow::Break(()),
        },
        move || {
            let run = weak.upgrade().map(&f);
            async move {
                match run {
                    Some(run) => {
                        run.await;
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                }
            }
        },
    ))
}

/// Reads the configured list files, `None` when no file is configured.
fn read_lists(params: &SchedulerParams) -> Option<anyhow::Result<AccessLists>> {
    if params.local_list_path.is_none() && params.global_list_path.is_none() {
        return None;
    }
    Some(AccessLists::load(
        params.local_list_path.as_deref(),
        params.global_list_path.as_deref(),
    ))
}

impl SchedulerManager {
    pub(super) fn start_maintenance(self: &Arc<Self>) {
        let users = every(
            self,
            |params| params.user_polling_interval,
            |scheduler| async move {
                scheduler.prune_users();
            },
        );
        let lists = every(
            self,
            |params| params.list_polling_interval,
            |scheduler| async move { scheduler.reload_lists().await },
        );
        lock(&self.maintenance).extend([users, lists]);
    }

    /// Stops the background maintenance. Supervised jobs are not affected.
    pub fn shutdown(&self) {
        for task in lock(&self.maintenance).drain(..) {
            task.abort();
        }
        tracing::info!(scheduler = %self.name, "Scheduler maintenance stopped");
    }

    /// Forgets requesters inactive for longer than the user lifespan.
    pub fn prune_users(&self) -> usize {
        let lifespan = self.params.load().user_lifespan;
        let removed = lock(&self.admission).prune_users(Utc::now(), lifespan);
        for ip in &removed {
            tracing::info!(%ip, "Removed inactive user");
        }
        removed.len()
    }

    /// First load of the access lists, done while the scheduler is built.
    pub(super) fn load_lists(&self) {
        if let Some(loaded) = read_lists(&self.params.load()) {
            self.apply_lists(loaded);
        }
    }

    /// Rebuilds the access lists from the configured files. The current
    /// lists stay in place if a file cannot be read.
    pub async fn reload_lists(&self) {
        let params = self.params.load_full();
        let loaded = tokio::task::spawn_blocking(move || read_lists(&params)).await;
        match loaded {
            Ok(Some(loaded)) => self.apply_lists(loaded),
            Ok(None) => {}
            Err(e) => tracing::warn!(scheduler = %self.name, "Access list reload aborted: {e}"),
        }
    }

    fn apply_lists(&self, loaded: anyhow::Result<AccessLists>) {
        match loaded {
            Ok(lists) => self.set_lists(lists),
            Err(e) => {
                tracing::warn!(scheduler = %self.name, "Keeping previous access lists: {e:#}")
            }
        }
    }

    /// Reloads the input file when the last reload is older than the
    /// minimum update interval.
    pub(super) async fn refresh_params_if_stale(&self) {
        let Some(path) = self.input_file.clone() else {
            return;
        };
        {
            let mut last = lock(&self.last_input_update);
            let now = clock::now();
            let min_interval = self.params.load().minimum_input_update_interval;
            if now.saturating_duration_since(*last) <= min_interval {
                return;
            }
            *last = now;
        }
        let loaded = tokio::task::spawn_blocking(move || SchedulerParams::load(&path))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|loaded| loaded);
        match loaded {
            Ok(params) => {
                tracing::info!(scheduler = %self.name, "Scheduler parameters reloaded");
                self.params.store(Arc::new(params));
            }
            Err(e) => tracing::warn!(
                scheduler = %self.name,
                "Keeping previous scheduler parameters: {e:#}"
            ),
        }
    }
}
