use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use bc_common::JobId;
use crate::job::DispatchJob;
use crate::{BroadcastError, Result};

/// Jobs currently executing in one engine.
///
/// Membership is the at-most-once execution guarantee: a job id can only be
/// registered while no other job with that id is present.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<DispatchJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: Arc<DispatchJob>) -> Result<()> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(BroadcastError::AlreadyRegistered(job.id)),
            Entry::Vacant(slot) => {
                slot.insert(job);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: JobId) -> Option<Arc<DispatchJob>> {
        self.jobs.get(&id).map(|entry| entry.value().clone())
    }

    /// Remove a job. Removing an absent id is a no-op.
    pub fn unregister(&self, id: JobId) -> Option<Arc<DispatchJob>> {
        self.jobs.remove(&id).map(|(_, job)| job)
    }

    /// Point-in-time snapshot of executing jobs, ordered by id
    pub fn list_active(&self) -> Vec<Arc<DispatchJob>> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
