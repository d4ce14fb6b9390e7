use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

/// Tunables of a scheduler manager. Durations are given in seconds.
///
/// Zero values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerParams {
    pub max_requests_per_sec_user: usize,
    pub max_requests_per_sec_global: usize,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub user_lifespan: Duration,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub request_lifespan: Duration,
    pub max_concurrent_jobs: usize,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub max_job_running_time: Duration,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub max_job_queued_time: Duration,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub max_array_job_running_time: Duration,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub max_array_job_queued_time: Duration,
    /// JSON file whose lists replace the current ones.
    pub local_list_path: Option<PathBuf>,
    /// JSON file whose lists are merged into the local ones.
    pub global_list_path: Option<PathBuf>,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub minimum_input_update_interval: Duration,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub job_polling_interval: Duration,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub user_polling_interval: Duration,
    #[serde(deserialize_with = "seconds::deserialize")]
    pub list_polling_interval: Duration,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            max_requests_per_sec_user: 2,
            max_requests_per_sec_global: 4,
            user_lifespan: Duration::from_secs(10),
            request_lifespan: Duration::from_secs(5),
            max_concurrent_jobs: 1,
            max_job_running_time: Duration::from_secs(10),
            max_job_queued_time: Duration::from_secs(10),
            max_array_job_running_time: Duration::from_secs(10),
            max_array_job_queued_time: Duration::from_secs(10),
            local_list_path: None,
            global_list_path: None,
            minimum_input_update_interval: Duration::from_secs(5),
            job_polling_interval: Duration::from_secs(1),
            user_polling_interval: Duration::from_secs(1),
            list_polling_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerParams {
    /// Reads the parameters from `path` (format chosen by extension), then
    /// from `SCHEDULER_*` environment variables.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let params: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SCHEDULER"))
            .build()?
            .try_deserialize()?;
        Ok(params.sanitized())
    }

    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let count = |value: usize, default: usize| if value == 0 { default } else { value };
        let duration = |value: Duration, default: Duration| {
            if value.is_zero() {
                default
            } else {
                value
            }
        };
        let path = |value: Option<PathBuf>| value.filter(|p| !p.as_os_str().is_empty());

        Self {
            max_requests_per_sec_user: count(
                self.max_requests_per_sec_user,
                defaults.max_requests_per_sec_user,
            ),
            max_requests_per_sec_global: count(
                self.max_requests_per_sec_global,
                defaults.max_requests_per_sec_global,
            ),
            user_lifespan: duration(self.user_lifespan, defaults.user_lifespan),
            request_lifespan: duration(self.request_lifespan, defaults.request_lifespan),
            max_concurrent_jobs: count(self.max_concurrent_jobs, defaults.max_concurrent_jobs),
            max_job_running_time: duration(
                self.max_job_running_time,
                defaults.max_job_running_time,
            ),
            max_job_queued_time: duration(self.max_job_queued_time, defaults.max_job_queued_time),
            max_array_job_running_time: duration(
                self.max_array_job_running_time,
                defaults.max_array_job_running_time,
            ),
            max_array_job_queued_time: duration(
                self.max_array_job_queued_time,
                defaults.max_array_job_queued_time,
            ),
            local_list_path: path(self.local_list_path),
            global_list_path: path(self.global_list_path),
            minimum_input_update_interval: duration(
                self.minimum_input_update_interval,
                defaults.minimum_input_update_interval,
            ),
            job_polling_interval: duration(
                self.job_polling_interval,
                defaults.job_polling_interval,
            ),
            user_polling_interval: duration(
                self.user_polling_interval,
                defaults.user_polling_interval,
            ),
            list_polling_interval: duration(
                self.list_polling_interval,
                defaults.list_polling_interval,
            ),
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
