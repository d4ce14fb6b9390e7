use std::sync::Arc;

use serde::Serialize;

use crate::error::DrmaaError;
use crate::model::vo::job::JobTemplate;

pub type JobId = Arc<str>;

/// Task indices of an array job: `start..=end` stepping by `increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayBounds {
    pub start: u32,
    pub end: u32,
    pub increment: u32,
}

impl ArrayBounds {
    pub fn new(start: u32, end: u32, increment: u32) -> Result<Self, DrmaaError> {
        if start == 0 {
            return Err(DrmaaError::invalid_argument(
                "Invalid start index: cannot be negative or zero.",
            ));
        }
        if end == 0 || end < start {
            return Err(DrmaaError::invalid_argument(format!(
                "Invalid end index {end} for start index {start}."
            )));
        }
        if increment == 0 {
            return Err(DrmaaError::invalid_argument(
                "Invalid increment index: cannot be negative or zero.",
            ));
        }
        Ok(Self {
            start,
            end,
            increment,
        })
    }

    pub fn task_ids(&self) -> impl Iterator<Item = u32> {
        (self.start..=self.end).step_by(self.increment as usize)
    }

    pub fn task_count(&self) -> usize {
        ((self.end - self.start) / self.increment + 1) as usize
    }
}

/// A job submitted through a session.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub session_name: String,
    pub template: JobTemplate,
    pub array: Option<ArrayBounds>,
}

impl Job {
    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }

    /// Number of accounting records expected once the job is finished.
    pub fn task_count(&self) -> usize {
        self.array.map_or(1, |bounds| bounds.task_count())
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.session_name == other.session_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids() {
        let bounds = ArrayBounds::new(1, 10, 3).unwrap();
        assert_eq!(bounds.task_ids().collect::<Vec<_>>(), vec![1, 4, 7, 10]);
        assert_eq!(bounds.task_count(), 4);
        assert_eq!(ArrayBounds::new(2, 9, 4).unwrap().task_count(), 2);
    }

    #[test]
    fn reject_invalid_bounds() {
        assert!(ArrayBounds::new(0, 10, 1).is_err());
        assert!(ArrayBounds::new(5, 4, 1).is_err());
        assert!(ArrayBounds::new(1, 4, 0).is_err());
    }
}
