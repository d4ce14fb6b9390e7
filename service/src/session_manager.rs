use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use domain::{
    error::{DrmaaError, DrmaaResult},
    model::vo::{DrmsInfo, Version},
    service::DrmAdapter,
};
use tokio::task::JoinHandle;

use crate::{
    job_monitor::{JobMonitor, DEFAULT_REFRESH_INTERVAL},
    session::Session,
};

/// Entry point to a DRM: owns the sessions and the job monitor they share.
pub struct SessionManager {
    drm: Arc<dyn DrmAdapter>,
    info: DrmsInfo,
    monitor: Arc<JobMonitor>,
    monitor_task: JoinHandle<()>,
    refresh_interval: Duration,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionManager {
    pub async fn new(drm: Arc<dyn DrmAdapter>) -> DrmaaResult<Self> {
        Self::with_refresh_interval(drm, DEFAULT_REFRESH_INTERVAL).await
    }

    /// Fails with [`DrmaaError::DrmsInit`] when the DRM does not answer.
    pub async fn with_refresh_interval(
        drm: Arc<dyn DrmAdapter>,
        refresh_interval: Duration,
    ) -> DrmaaResult<Self> {
        let info = drm.drms_info().await.map_err(|e| {
            tracing::error!("DRM is not available: {e:#}");
            DrmaaError::DrmsInit(format!("Could not initialize the DRM: {e}"))
        })?;
        tracing::info!(drms = %info.drms_name, version = %info.version, "Connected to DRM");

        let monitor = Arc::new(JobMonitor::new(drm.clone(), refresh_interval));
        let monitor_task = monitor.spawn();

        Ok(Self {
            drm,
            info,
            monitor,
            monitor_task,
            refresh_interval,
            sessions: DashMap::new(),
        })
    }

    pub fn drms_name(&self) -> &str {
        &self.info.drms_name
    }

    pub fn version(&self) -> &Version {
        &self.info.version
    }

    pub fn monitor(&self) -> &Arc<JobMonitor> {
        &self.monitor
    }

    pub fn create_session(&self, name: &str, contact: Option<String>) -> DrmaaResult<Arc<Session>> {
        if name.is_empty() {
            return Err(DrmaaError::invalid_argument(
                "Must provide a session name to create a session",
            ));
        }
        match self.sessions.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(DrmaaError::AlreadyActiveSession(format!(
                "A session named {name} already exists"
            ))),
            Entry::Vacant(entry) => {
                let session = Session::new(name, contact, self.drm.clone(), self.monitor.clone())
                    .with_refresh_interval(self.refresh_interval);
                tracing::info!(session = %name, "Session created");
                Ok(entry.insert(Arc::new(session)).clone())
            }
        }
    }

    pub fn get_session(&self, name: &str) -> DrmaaResult<Arc<Session>> {
        self.sessions
            .get(name)
            .map(|session| session.clone())
            .ok_or_else(|| DrmaaError::NoActiveSession(format!("No session named {name} found")))
    }

    pub fn close_session(&self, name: &str) -> DrmaaResult<()> {
        self.sessions
            .remove(name)
            .map(|_| tracing::info!(session = %name, "Session closed"))
            .ok_or_else(|| DrmaaError::NoActiveSession(format!("No session named {name} found")))
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.monitor_task.abort();
    }
}
