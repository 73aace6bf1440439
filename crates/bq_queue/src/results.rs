//! Accumulates the accepted results of every job.

use std::{collections::HashMap, sync::Arc};

use bq_utils::net_protocol::{
    results::TestEntryResult,
    workers::{BucketId, JobId},
};
use parking_lot::{Mutex, RwLock};

#[derive(Default, Debug)]
struct JobResults {
    results: Vec<TestEntryResult>,
    buckets: Vec<BucketId>,
}

/// Results of every job, indexed by job.
///
/// The outer lock is held only long enough to find or create a job's slot; recording into
/// different jobs never contends.
#[derive(Default, Debug)]
pub struct ResultsCollector {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobResults>>>>,
}

impl ResultsCollector {
    pub fn record(&self, job_id: &JobId, bucket_id: &BucketId, results: Vec<TestEntryResult>) {
        let slot = self.slot(job_id);
        let mut slot = slot.lock();
        slot.results.extend(results);
        slot.buckets.push(bucket_id.clone());
    }

    /// Everything recorded for a job, in the order it was recorded.
    pub fn collected_results(&self, job_id: &JobId) -> Vec<TestEntryResult> {
        let slot = match self.jobs.read().get(job_id) {
            Some(slot) => slot.clone(),
            None => return vec![],
        };
        let results = slot.lock().results.clone();
        results
    }

    /// Buckets whose results have been recorded for a job.
    pub fn recorded_buckets(&self, job_id: &JobId) -> Vec<BucketId> {
        let slot = match self.jobs.read().get(job_id) {
            Some(slot) => slot.clone(),
            None => return vec![],
        };
        let buckets = slot.lock().buckets.clone();
        buckets
    }

    pub fn remove(&self, job_id: &JobId) -> Vec<TestEntryResult> {
        let slot = match self.jobs.write().remove(job_id) {
            Some(slot) => slot,
            None => return vec![],
        };
        let results = std::mem::take(&mut slot.lock().results);
        results
    }

    fn slot(&self, job_id: &JobId) -> Arc<Mutex<JobResults>> {
        if let Some(slot) = self.jobs.read().get(job_id) {
            return slot.clone();
        }
        self.jobs.write().entry(job_id.clone()).or_default().clone()
    }
}
