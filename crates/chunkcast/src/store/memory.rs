use super::{Job, JobState, JobStore, Transition, UpsertOutcome};
use crate::{Error, ProcessedResult, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};

/// A process-local [`JobStore`].
///
/// Each job sits behind its own mutex, so results for different jobs never
/// contend; the outer map lock is only held to look a job up.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    fn slot(&self, job_id: &str) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound {
                job_id: job_id.to_string(),
            })
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.job_id) {
            return Err(Error::JobAlreadyExists { job_id: job.job_id });
        }
        jobs.insert(job.job_id.clone(), Arc::new(Mutex::new(job)));
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Job> {
        Ok(self.slot(job_id)?.lock().clone())
    }

    async fn upsert_result(
        &self,
        job_id: &str,
        result: ProcessedResult,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let slot = self.slot(job_id)?;
        let mut job = slot.lock();
        Ok(job.apply(result, now))
    }

    async fn expire(&self, job_id: &str, now: DateTime<Utc>) -> Result<Transition> {
        let slot = self.slot(job_id)?;
        let mut job = slot.lock();
        let changed = job.expire(now);
        Ok(Transition {
            job: job.clone(),
            changed,
        })
    }

    async fn finish(&self, job_id: &str, state: JobState) -> Result<Transition> {
        let slot = self.slot(job_id)?;
        let mut job = slot.lock();
        let changed = job.finish(state);
        Ok(Transition {
            job: job.clone(),
            changed,
        })
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<Vec<String>> {
        let mut purged = Vec::new();
        self.jobs.write().retain(|id, slot| {
            let job = slot.lock();
            let keep = !job.state.is_terminal() || job.created_at >= before;
            if !keep {
                purged.push(id.clone());
            }
            keep
        });
        Ok(purged)
    }
}
