use std::{path::PathBuf, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use domain::error::{DrmaaError, DrmaaResult};

use crate::{scheduler::SchedulerManager, session::Session};

/// Registry of named scheduler managers.
#[derive(Default)]
pub struct SchedulerFactory {
    schedulers: DashMap<String, Arc<SchedulerManager>>,
}

impl SchedulerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called within a tokio runtime.
    pub fn create_scheduler_manager(
        &self,
        name: &str,
        input_file: Option<PathBuf>,
        session: Arc<Session>,
    ) -> DrmaaResult<Arc<SchedulerManager>> {
        if name.is_empty() {
            return Err(DrmaaError::invalid_argument(
                "Must provide a name to create a scheduler manager",
            ));
        }
        match self.schedulers.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(DrmaaError::invalid_argument(format!(
                "A scheduler manager named {name} already exists"
            ))),
            Entry::Vacant(entry) => {
                let scheduler = SchedulerManager::new(name, input_file, session);
                Ok(entry.insert(scheduler).clone())
            }
        }
    }

    pub fn get_scheduler_manager(&self, name: &str) -> DrmaaResult<Arc<SchedulerManager>> {
        self.schedulers
            .get(name)
            .map(|scheduler| scheduler.clone())
            .ok_or_else(|| {
                DrmaaError::invalid_argument(format!("No scheduler manager named {name} found"))
            })
    }

    /// Removes the manager and stops its maintenance. Jobs it still
    /// supervises run to completion.
    pub fn delete_scheduler_manager(&self, name: &str) -> DrmaaResult<()> {
        let (_, scheduler) = self.schedulers.remove(name).ok_or_else(|| {
            DrmaaError::invalid_argument(format!("No scheduler manager named {name} found"))
        })?;
        scheduler.shutdown();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }
}
