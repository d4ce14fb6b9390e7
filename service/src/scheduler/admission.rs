use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, Utc};
use domain::{error::DrmaaError, model::entity::UserRecord};

use super::{lists::AccessLists, params::SchedulerParams};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("User {ip} is blacklisted")]
    Blacklisted { ip: String },
    #[error("Maximum number ({max}) of concurrent jobs already reached. Cannot submit any more jobs at the moment.")]
    ConcurrencyLimit { max: usize },
    #[error("Cannot submit the job without exceeding the maximum number ({max}) of concurrent jobs.")]
    ConcurrencyRisk { max: usize },
    #[error("Server currently at capacity ({present} requests in the last window). Cannot service more requests.")]
    GlobalRateLimit { present: usize },
    #[error("User {ip} cannot submit more requests right now: {present} requests in the last window.")]
    UserRateLimit { ip: String, present: usize },
    #[error("Job submission failed: {0}")]
    Submission(#[from] DrmaaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Whitelisted,
    Accepted,
}

/// Request windows and in-flight submissions, guarded as one unit.
#[derive(Debug, Default)]
pub(crate) struct AdmissionState {
    users: HashMap<String, UserRecord>,
    global_requests: VecDeque<DateTime<Utc>>,
    pending: usize,
}

fn expired(now: DateTime<Utc>, time: DateTime<Utc>, lifespan: Duration) -> bool {
    (now - time).to_std().map_or(false, |age| age > lifespan)
}

/// Drops every request up to the last expired one.
fn prune(requests: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, lifespan: Duration) {
    if let Some(last) = requests.iter().rposition(|time| expired(now, *time, lifespan)) {
        requests.drain(..=last);
    }
}

impl AdmissionState {
    /// Slides the request windows to `time`, runs the admission checks and,
    /// when they pass, records the request and reserves a submission slot.
    ///
    /// Blacklisted requesters are always rejected and whitelisted ones skip
    /// the remaining checks.
    pub fn admit(
        &mut self,
        ip: &str,
        time: DateTime<Utc>,
        lists: &AccessLists,
        params: &SchedulerParams,
        history_len: usize,
    ) -> Result<Verdict, AdmissionError> {
        if lists.is_blacklisted(ip) {
            return Err(AdmissionError::Blacklisted { ip: ip.to_owned() });
        }

        prune(&mut self.global_requests, time, params.request_lifespan);
        if let Some(user) = self.users.get_mut(ip) {
            prune(&mut user.requests, time, params.request_lifespan);
        }

        let verdict = if lists.is_whitelisted(ip) {
            Verdict::Whitelisted
        } else {
            self.check_limits(ip, params, history_len)?;
            Verdict::Accepted
        };

        self.users
            .entry(ip.to_owned())
            .or_insert_with(|| UserRecord::new(ip))
            .requests
            .push_back(time);
        self.global_requests.push_back(time);
        self.pending += 1;
        Ok(verdict)
    }

    fn check_limits(
        &self,
        ip: &str,
        params: &SchedulerParams,
        history_len: usize,
    ) -> Result<(), AdmissionError> {
        let max = params.max_concurrent_jobs;
        if history_len >= max {
            return Err(AdmissionError::ConcurrencyLimit { max });
        }
        if self.pending + history_len >= max {
            return Err(AdmissionError::ConcurrencyRisk { max });
        }

        let present = self.global_requests.len();
        if present >= params.max_requests_per_sec_global {
            return Err(AdmissionError::GlobalRateLimit { present });
        }

        if let Some(user) = self.users.get(ip) {
            let present = user.request_count();
            if present >= params.max_requests_per_sec_user {
                return Err(AdmissionError::UserRateLimit {
                    ip: ip.to_owned(),
                    present,
                });
            }
        }
        Ok(())
    }

    pub fn release_pending(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Forgets requesters whose last request is older than `lifespan`.
    pub fn prune_users(&mut self, now: DateTime<Utc>, lifespan: Duration) -> Vec<String> {
        let mut removed = vec![];
        self.users.retain(|ip, user| {
            let stale = user
                .last_request()
                .map_or(true, |last| expired(now, last, lifespan));
            if stale {
                removed.push(ip.clone());
            }
            !stale
        });
        removed
    }
}
