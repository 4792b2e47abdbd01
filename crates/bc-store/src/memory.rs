use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

use bc_common::{
    BroadcastStats, JobFilter, JobId, JobPage, JobRecord, JobUpdate, ListId, NewJob, Recipient,
    RecipientList,
};
use crate::{JobStore, RecipientDirectory, Result, StoreError};

/// Process-local store. Ids are assigned sequentially starting at 1.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: RwLock<BTreeMap<JobId, JobRecord>>,
    lists: RwLock<BTreeMap<ListId, RecipientList>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an active list holding `recipients` in the given order
    pub fn create_list(&self, name: impl Into<String>, recipients: Vec<Recipient>) -> ListId {
        let mut lists = self.lists.write();
        let id = ListId(lists.keys().next_back().map_or(1, |last| last.0 + 1));
        lists.insert(
            id,
            RecipientList {
                id,
                name: name.into(),
                is_active: true,
                recipients,
            },
        );
        id
    }

    pub fn add_recipients(&self, list_id: ListId, recipients: Vec<Recipient>) -> Result<()> {
        let mut lists = self.lists.write();
        let list = lists.get_mut(&list_id).ok_or(StoreError::ListNotFound(list_id))?;
        list.recipients.extend(recipients);
        Ok(())
    }

    pub fn set_list_active(&self, list_id: ListId, active: bool) -> Result<()> {
        let mut lists = self.lists.write();
        let list = lists.get_mut(&list_id).ok_or(StoreError::ListNotFound(list_id))?;
        list.is_active = active;
        Ok(())
    }

    /// Toggle every recipient of the list with the given address
    pub fn set_recipient_active(&self, list_id: ListId, address: &str, active: bool) -> Result<()> {
        let mut lists = self.lists.write();
        let list = lists.get_mut(&list_id).ok_or(StoreError::ListNotFound(list_id))?;
        list.recipients
            .iter_mut()
            .filter(|r| r.address == address)
            .for_each(|r| r.is_active = active);
        Ok(())
    }

    /// Remove every recipient of the list with the given address. Returns
    /// how many were removed.
    pub fn remove_recipient(&self, list_id: ListId, address: &str) -> Result<usize> {
        let mut lists = self.lists.write();
        let list = lists.get_mut(&list_id).ok_or(StoreError::ListNotFound(list_id))?;
        let before = list.recipients.len();
        list.recipients.retain(|r| r.address != address);
        Ok(before - list.recipients.len())
    }

    /// Delete a list together with its recipients. Jobs referencing it are kept.
    pub fn delete_list(&self, list_id: ListId) -> Result<()> {
        self.lists
            .write()
            .remove(&list_id)
            .map(|_| ())
            .ok_or(StoreError::ListNotFound(list_id))
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, job: NewJob) -> Result<JobId> {
        let mut jobs = self.jobs.write();
        let id = JobId(jobs.keys().next_back().map_or(1, |last| last.0 + 1));
        jobs.insert(id, JobRecord::from_new(id, job, Utc::now()));
        debug!(job_id = %id, "Broadcast job created");
        Ok(id)
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<()> {
        let mut jobs = self.jobs.write();
        let record = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        record.apply(&update, Utc::now());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<JobRecord> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage<JobRecord>> {
        let jobs = self.jobs.read();
        let mut records: Vec<JobRecord> = jobs.values().filter(|r| filter.matches(r)).cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = records.len() as u64;
        Ok(JobPage {
            items: records
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit)
                .collect(),
            total,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<BroadcastStats> {
        let jobs = self.jobs.read();
        let mut stats = BroadcastStats::default();
        jobs.values()
            .filter(|r| r.created_at >= from && r.created_at < to)
            .for_each(|r| stats.add(r));
        Ok(stats)
    }
}

#[async_trait]
impl RecipientDirectory for InMemoryStore {
    async fn get_list(&self, id: ListId) -> Result<RecipientList> {
        self.lists
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ListNotFound(id))
    }
}
