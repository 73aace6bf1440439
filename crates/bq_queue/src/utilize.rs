//! Which workers each job should preferably run on.
//!
//! The mapping only steers the choice of job for a worker; a worker never goes idle because no
//! job names it.

use std::collections::HashMap;

use bq_utils::net_protocol::{entity::WorkerId, workers::JobId};

pub type WorkersPerJob = HashMap<JobId, Vec<WorkerId>>;

pub trait WorkersToUtilizeService: Send + Sync {
    /// Computes the preferred workers of every job in `job_ids`, out of `initial_workers`.
    fn workers_to_utilize(&self, initial_workers: &[WorkerId], job_ids: &[JobId])
        -> WorkersPerJob;
}

/// A fixed mapping, e.g. from configuration. Jobs the mapping does not name, or whose named
/// workers are all unknown, prefer no worker; they still get any worker nothing else claims.
#[derive(Debug, Default, Clone)]
pub struct StaticWorkersToUtilize {
    mapping: WorkersPerJob,
}

impl StaticWorkersToUtilize {
    pub fn new(mapping: WorkersPerJob) -> Self {
        Self { mapping }
    }
}

impl WorkersToUtilizeService for StaticWorkersToUtilize {
    fn workers_to_utilize(
        &self,
        initial_workers: &[WorkerId],
        job_ids: &[JobId],
    ) -> WorkersPerJob {
        job_ids
            .iter()
            .map(|job_id| {
                let named: Vec<WorkerId> = self
                    .mapping
                    .get(job_id)
                    .map(|workers| {
                        workers
                            .iter()
                            .filter(|w| initial_workers.contains(w))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                (job_id.clone(), named)
            })
            .collect()
    }
}

/// Spreads workers over jobs round-robin, in job order, so concurrent jobs prefer disjoint
/// workers. With fewer workers than jobs, workers are shared.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpreadWorkersToUtilize;

impl WorkersToUtilizeService for SpreadWorkersToUtilize {
    fn workers_to_utilize(
        &self,
        initial_workers: &[WorkerId],
        job_ids: &[JobId],
    ) -> WorkersPerJob {
        let mut mapping: WorkersPerJob = job_ids
            .iter()
            .map(|job_id| (job_id.clone(), vec![]))
            .collect();
        if job_ids.is_empty() || initial_workers.is_empty() {
            return mapping;
        }

        let mut jobs: Vec<&JobId> = job_ids.iter().collect();
        jobs.sort();
        let slots = std::cmp::max(jobs.len(), initial_workers.len());
        for i in 0..slots {
            let job_id = jobs[i % jobs.len()];
            let worker = &initial_workers[i % initial_workers.len()];
            if let Some(workers) = mapping.get_mut(job_id) {
                if !workers.contains(worker) {
                    workers.push(worker.clone());
                }
            }
        }
        mapping
    }
}
