//! Balances workers across the bucket queues of concurrently running jobs.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{atomic::AtomicU64, Arc},
    time::{Duration, Instant},
};

use bq_utils::{
    atomic,
    net_protocol::{
        entity::WorkerId,
        queue::{JobState, RejectionReason, WorkerAliveness},
        results::TestingResult,
        workers::{Bucket, BucketId, JobId, JobPriority},
    },
};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::{
    aliveness::WorkerAlivenessTracker,
    bucket_queue::{
        AcceptanceOutcome, BucketQueue, BucketQueueConfig, DequeuedBucket, EnqueueError,
    },
    events::{QueueEvent, QueueEventBus},
    prioritize::{order_candidates, JobCandidate, JobPrioritizer, PriorityThenFairness},
    results::ResultsCollector,
    utilize::{WorkersPerJob, WorkersToUtilizeService},
};

#[derive(Debug, Clone, Copy)]
pub struct BalancingConfig {
    pub bucket_queue: BucketQueueConfig,
    /// How many buckets one worker may hold at once, across all jobs.
    pub max_buckets_per_worker: NonZeroUsize,
    /// What workers are told to wait before asking again when there is nothing for them.
    pub check_again_after: Duration,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            bucket_queue: Default::default(),
            max_buckets_per_worker: NonZeroUsize::MIN,
            check_again_after: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub enum DequeueResult {
    Dequeued(DequeuedBucket),
    /// Nothing for this worker right now, but work may show up: jobs have buckets in flight
    /// that could be retried or reclaimed, or the worker is at its in-flight limit.
    CheckAgainLater(Duration),
    /// No job has any work left.
    QueueIsEmpty(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DequeueError {
    #[error("worker {0} is blocked")]
    WorkerBlocked(WorkerId),
    #[error("worker {0} is not registered")]
    WorkerNotRegistered(WorkerId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeleteJobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {job_id} still has {enqueued_count} enqueued and {dequeued_count} dequeued buckets")]
    BucketsStillInFlight {
        job_id: JobId,
        enqueued_count: usize,
        dequeued_count: usize,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelJobError {
    #[error("job {0} not found")]
    NotFound(JobId),
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcceptResult {
    Accepted {
        job_id: JobId,
        retry_bucket: Option<BucketId>,
    },
    Rejected(RejectionReason),
}

#[derive(Debug)]
struct Job {
    job_id: JobId,
    priority: JobPriority,
    sequence: u64,
    queue: Mutex<BucketQueue>,
}

/// Every job's bucket queue, the worker aliveness tracker and the results collector, and the
/// policy deciding which job a worker's next bucket comes from.
///
/// Locks are always taken in the order job map, then job queue, then any of results,
/// aliveness or bucket owners. The job map's read lock is only held to clone job handles.
pub struct BalancingBucketQueue {
    config: BalancingConfig,
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    /// The job each bucket id belongs to, for every bucket of every live job.
    bucket_owners: Mutex<HashMap<BucketId, JobId>>,
    aliveness: Arc<WorkerAlivenessTracker>,
    results: ResultsCollector,
    prioritizer: Box<dyn JobPrioritizer>,
    workers_to_utilize: RwLock<WorkersPerJob>,
    next_sequence: AtomicU64,
    events: QueueEventBus,
}

static_assertions::assert_impl_all!(BalancingBucketQueue: Send, Sync);

impl BalancingBucketQueue {
    pub fn new(
        config: BalancingConfig,
        aliveness: Arc<WorkerAlivenessTracker>,
        events: QueueEventBus,
    ) -> Self {
        Self {
            config,
            jobs: Default::default(),
            bucket_owners: Default::default(),
            aliveness,
            results: Default::default(),
            prioritizer: Box::new(PriorityThenFairness),
            workers_to_utilize: Default::default(),
            next_sequence: AtomicU64::new(0),
            events,
        }
    }

    pub fn with_prioritizer(mut self, prioritizer: Box<dyn JobPrioritizer>) -> Self {
        self.prioritizer = prioritizer;
        self
    }

    pub fn aliveness(&self) -> &WorkerAlivenessTracker {
        &self.aliveness
    }

    pub fn events(&self) -> &QueueEventBus {
        &self.events
    }

    pub fn register_worker(&self, worker_id: &WorkerId) -> WorkerAliveness {
        self.aliveness.register(worker_id)
    }

    pub fn block_worker(&self, worker_id: &WorkerId, reason: impl Into<String>) {
        self.aliveness.block(worker_id);
        self.events.post(QueueEvent::WorkerBlocked {
            worker_id: worker_id.clone(),
            reason: reason.into(),
        });
    }

    pub fn heartbeat(&self, worker_id: &WorkerId) -> WorkerAliveness {
        self.aliveness.set_alive(worker_id)
    }

    /// Adds buckets to a job, creating the job if it is new. Either every bucket is enqueued, or,
    /// if any bucket id is already held by any job, none is.
    ///
    /// A job keeps the priority it was created with; `priority` is ignored when adding buckets
    /// to a live job.
    pub fn enqueue(
        &self,
        job_id: &JobId,
        buckets: Vec<Bucket>,
        priority: JobPriority,
    ) -> Result<(), EnqueueError> {
        let bucket_ids: Vec<BucketId> = buckets.iter().map(|b| b.bucket_id.clone()).collect();
        {
            let mut owners = self.bucket_owners.lock();
            for (i, bucket_id) in bucket_ids.iter().enumerate() {
                if owners.contains_key(bucket_id) || bucket_ids[..i].contains(bucket_id) {
                    return Err(EnqueueError::DuplicateBucket(bucket_id.clone()));
                }
            }
            for bucket_id in &bucket_ids {
                owners.insert(bucket_id.clone(), job_id.clone());
            }
        }

        // Held until the buckets are in the job's queue; a delete or cancel must not orphan them.
        let mut jobs = self.jobs.write();
        let job = jobs.entry(job_id.clone()).or_insert_with(|| {
            Arc::new(Job {
                job_id: job_id.clone(),
                priority,
                sequence: self.next_sequence.fetch_add(1, atomic::ORDERING),
                queue: Mutex::new(BucketQueue::new(
                    job_id.clone(),
                    self.config.bucket_queue,
                    self.events.clone(),
                )),
            })
        });
        if job.priority != priority {
            tracing::debug!(
                %job_id,
                existing = ?job.priority,
                requested = ?priority,
                "job keeps its original priority"
            );
        }

        let number_of_buckets = buckets.len();
        let enqueued = job.queue.lock().enqueue(buckets);
        drop(jobs);
        if let Err(error) = enqueued {
            let mut owners = self.bucket_owners.lock();
            for bucket_id in &bucket_ids {
                owners.remove(bucket_id);
            }
            return Err(error);
        }

        self.events.post(QueueEvent::JobEnqueued {
            job_id: job_id.clone(),
            number_of_buckets,
        });
        Ok(())
    }

    /// Picks the next bucket for a worker, from the job the prioritizer ranks first among those
    /// with enqueued work.
    pub fn dequeue_bucket(&self, worker_id: &WorkerId) -> Result<DequeueResult, DequeueError> {
        self.dequeue_bucket_at(worker_id, Instant::now())
    }

    pub fn dequeue_bucket_at(
        &self,
        worker_id: &WorkerId,
        now: Instant,
    ) -> Result<DequeueResult, DequeueError> {
        match self.aliveness.aliveness(worker_id) {
            WorkerAliveness::Blocked => {
                return Err(DequeueError::WorkerBlocked(worker_id.clone()));
            }
            WorkerAliveness::NotRegistered | WorkerAliveness::Registering => {
                return Err(DequeueError::WorkerNotRegistered(worker_id.clone()));
            }
            WorkerAliveness::Silent { .. } => {
                // Asking for work is a sign of life.
                self.aliveness.set_alive(worker_id);
            }
            WorkerAliveness::Alive => {}
        }

        let check_again_after = self.config.check_again_after;
        if self.aliveness.number_of_buckets_in_flight(worker_id)
            >= self.config.max_buckets_per_worker.get()
        {
            return Ok(DequeueResult::CheckAgainLater(check_again_after));
        }

        let jobs: Vec<Arc<Job>> = self.jobs.read().values().cloned().collect();
        let preferred: Vec<JobId> = {
            let workers_to_utilize = self.workers_to_utilize.read();
            workers_to_utilize
                .iter()
                .filter(|(_, workers)| workers.contains(worker_id))
                .map(|(job_id, _)| job_id.clone())
                .collect()
        };

        let mut any_in_flight = false;
        let mut candidates = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let queue = job.queue.lock();
            let (enqueued_count, dequeued_count) = (queue.enqueued_count(), queue.dequeued_count());
            drop(queue);

            any_in_flight |= dequeued_count > 0;
            if enqueued_count > 0 {
                candidates.push(JobCandidate {
                    job_id: job.job_id.clone(),
                    priority: job.priority,
                    dequeued_count,
                    enqueued_count,
                    worker_is_preferred: preferred.contains(&job.job_id),
                    sequence: job.sequence,
                });
            }
        }

        if candidates.is_empty() {
            return Ok(if any_in_flight {
                DequeueResult::CheckAgainLater(check_again_after)
            } else {
                DequeueResult::QueueIsEmpty(check_again_after)
            });
        }

        order_candidates(self.prioritizer.as_ref(), &mut candidates);
        let jobs_by_id: HashMap<&JobId, &Arc<Job>> =
            jobs.iter().map(|job| (&job.job_id, job)).collect();

        for candidate in &candidates {
            let job = match jobs_by_id.get(&candidate.job_id) {
                Some(job) => job,
                None => continue,
            };
            let mut queue = job.queue.lock();
            if let Some(dequeued) = queue.dequeue_bucket(worker_id, now) {
                self.aliveness
                    .did_dequeue_bucket(worker_id, dequeued.bucket_id());
                drop(queue);

                self.events.post(QueueEvent::BucketDequeued {
                    job_id: job.job_id.clone(),
                    bucket_id: dequeued.bucket_id().clone(),
                    worker_id: worker_id.clone(),
                });
                return Ok(DequeueResult::Dequeued(dequeued));
            }
        }

        Ok(DequeueResult::CheckAgainLater(check_again_after))
    }

    /// Routes a worker's results to the job that owns the bucket.
    pub fn accept(
        &self,
        bucket_id: &BucketId,
        worker_id: &WorkerId,
        testing_result: TestingResult,
    ) -> AcceptResult {
        // The owners guard must be gone before the job map is read.
        let owner = self.bucket_owners.lock().get(bucket_id).cloned();
        let job = owner.and_then(|job_id| self.jobs.read().get(&job_id).cloned());
        let job = match job {
            Some(job) => job,
            None => return self.reject(bucket_id, worker_id, RejectionReason::BucketNotFound),
        };

        let mut queue = job.queue.lock();
        match queue.accept(bucket_id, worker_id, testing_result) {
            AcceptanceOutcome::Accepted(accepted) => {
                self.results.record(&job.job_id, bucket_id, accepted.results);
                self.aliveness.did_receive_result(worker_id, bucket_id);
                if let Some(retry_bucket) = &accepted.retry_bucket {
                    self.bucket_owners
                        .lock()
                        .insert(retry_bucket.clone(), job.job_id.clone());
                }
                drop(queue);

                self.events.post(QueueEvent::ResultAccepted {
                    job_id: job.job_id.clone(),
                    bucket_id: bucket_id.clone(),
                    worker_id: worker_id.clone(),
                    retry_bucket: accepted.retry_bucket.clone(),
                });
                AcceptResult::Accepted {
                    job_id: job.job_id.clone(),
                    retry_bucket: accepted.retry_bucket,
                }
            }
            AcceptanceOutcome::Rejected(reason) => {
                drop(queue);
                self.reject(bucket_id, worker_id, reason)
            }
        }
    }

    fn reject(
        &self,
        bucket_id: &BucketId,
        worker_id: &WorkerId,
        reason: RejectionReason,
    ) -> AcceptResult {
        // A rejected report still shows the worker is alive.
        self.aliveness.set_alive(worker_id);
        self.events.post(QueueEvent::ResultRejected {
            bucket_id: bucket_id.clone(),
            worker_id: worker_id.clone(),
            reason: reason.clone(),
        });
        AcceptResult::Rejected(reason)
    }

    /// Counts and results of a job, read under the job's queue lock so they agree with each
    /// other.
    pub fn job_state(&self, job_id: &JobId) -> Option<JobState> {
        let job = self.jobs.read().get(job_id).cloned()?;
        let queue = job.queue.lock();
        let results = self.results.collected_results(job_id);
        Some(JobState {
            job_id: job_id.clone(),
            enqueued_count: queue.enqueued_count(),
            dequeued_count: queue.dequeued_count(),
            results,
        })
    }

    /// Removes a job whose buckets have all been accepted, along with its results.
    pub fn delete_job(&self, job_id: &JobId) -> Result<(), DeleteJobError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| DeleteJobError::NotFound(job_id.clone()))?;
        let queue = job.queue.lock();
        if !queue.is_depleted() {
            return Err(DeleteJobError::BucketsStillInFlight {
                job_id: job_id.clone(),
                enqueued_count: queue.enqueued_count(),
                dequeued_count: queue.dequeued_count(),
            });
        }
        jobs.remove(job_id);
        self.forget_job(job_id, &queue);
        drop(queue);
        drop(jobs);

        self.events.post(QueueEvent::JobDeleted {
            job_id: job_id.clone(),
        });
        Ok(())
    }

    /// Removes a job no matter what. Buckets in flight are released from their workers, whose
    /// results for them will be rejected. Returns the buckets that were in flight.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<Vec<DequeuedBucket>, CancelJobError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .remove(job_id)
            .ok_or_else(|| CancelJobError::NotFound(job_id.clone()))?;
        let mut queue = job.queue.lock();
        let cancelled = queue.cancel();
        for dequeued in &cancelled {
            self.aliveness
                .release_bucket(&dequeued.worker_id, dequeued.bucket_id());
        }
        self.forget_job(job_id, &queue);
        drop(queue);
        drop(jobs);

        for dequeued in &cancelled {
            self.events.post(QueueEvent::BucketCancelled {
                job_id: job_id.clone(),
                bucket_id: dequeued.bucket_id().clone(),
                worker_id: dequeued.worker_id.clone(),
            });
        }
        self.events.post(QueueEvent::JobCancelled {
            job_id: job_id.clone(),
        });
        Ok(cancelled)
    }

    fn forget_job(&self, job_id: &JobId, queue: &BucketQueue) {
        {
            let mut owners = self.bucket_owners.lock();
            for bucket_id in queue.known_bucket_ids() {
                owners.remove(bucket_id);
            }
        }
        self.results.remove(job_id);
        self.workers_to_utilize.write().remove(job_id);
    }

    /// Marks quiet workers silent, then takes back stuck buckets from every job.
    pub fn reclaim_stuck_buckets(&self, now: Instant) -> Vec<BucketId> {
        for worker_id in self.aliveness.mark_silent_workers(now) {
            self.events.post(QueueEvent::WorkerSilent { worker_id });
        }

        let jobs: Vec<Arc<Job>> = self.jobs.read().values().cloned().collect();
        let mut reclaimed = vec![];
        for job in jobs {
            let mut queue = job.queue.lock();
            reclaimed.extend(
                queue
                    .reclaim_stuck_buckets(&self.aliveness, now)
                    .into_iter()
                    .map(|dequeued| dequeued.enqueued_bucket.bucket.bucket_id),
            );
        }
        reclaimed
    }

    /// Recomputes which workers each job prefers.
    pub fn rebalance(&self, service: &dyn WorkersToUtilizeService) {
        let workers = self.aliveness.usable_workers();
        let job_ids = self.job_ids();
        let mapping = service.workers_to_utilize(&workers, &job_ids);
        self.set_workers_to_utilize(mapping);
    }

    pub fn set_workers_to_utilize(&self, mapping: WorkersPerJob) {
        *self.workers_to_utilize.write() = mapping;
    }

    pub fn worker_aliveness(&self) -> std::collections::BTreeMap<WorkerId, WorkerAliveness> {
        self.aliveness.worker_aliveness()
    }

    /// Live jobs, oldest first.
    pub fn job_ids(&self) -> Vec<JobId> {
        let mut jobs: Vec<(u64, JobId)> = self
            .jobs
            .read()
            .values()
            .map(|job| (job.sequence, job.job_id.clone()))
            .collect();
        jobs.sort();
        jobs.into_iter().map(|(_, job_id)| job_id).collect()
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::{HashMap, HashSet},
        num::NonZeroUsize,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use bq_utils::net_protocol::{
        entity::WorkerId,
        queue::{RejectionReason, WorkerAliveness},
        workers::{BucketId, JobId, JobPriority},
    };

    use super::{
        AcceptResult, BalancingBucketQueue, BalancingConfig, CancelJobError, DeleteJobError,
        DequeueError, DequeueResult,
    };
    use ntest::timeout;

    use crate::{
        aliveness::WorkerAlivenessTracker,
        bucket_queue::{DequeuedBucket, EnqueueError},
        events::{QueueEvent, QueueEventBus},
        test_utils::{bucket, bucket_with_retries, outcome, passing, testing_result},
        utilize::StaticWorkersToUtilize,
    };

    fn balancing() -> BalancingBucketQueue {
        balancing_with(Default::default())
    }

    fn balancing_with(config: BalancingConfig) -> BalancingBucketQueue {
        BalancingBucketQueue::new(
            config,
            Arc::new(WorkerAlivenessTracker::new(Duration::from_secs(30))),
            QueueEventBus::default(),
        )
    }

    fn worker(queue: &BalancingBucketQueue, id: &str) -> WorkerId {
        let worker = WorkerId::from(id);
        queue.register_worker(&worker);
        worker
    }

    fn dequeued(result: Result<DequeueResult, DequeueError>) -> DequeuedBucket {
        match result.unwrap() {
            DequeueResult::Dequeued(dequeued) => dequeued,
            other => panic!("nothing dequeued: {other:?}"),
        }
    }

    fn job_of(queue: &BalancingBucketQueue, dequeued: &DequeuedBucket) -> JobId {
        queue.bucket_owners.lock()[dequeued.bucket_id()].clone()
    }

    #[test]
    fn unregistered_and_blocked_workers_get_errors() {
        let queue = balancing();
        queue
            .enqueue(&JobId::from("job"), vec![bucket("b1", &["a"])], JobPriority(0))
            .unwrap();

        let stranger = WorkerId::from("stranger");
        assert_eq!(
            queue.dequeue_bucket(&stranger).unwrap_err(),
            DequeueError::WorkerNotRegistered(stranger)
        );

        let blocked = worker(&queue, "blocked");
        queue.block_worker(&blocked, "version mismatch");
        assert_eq!(
            queue.dequeue_bucket(&blocked).unwrap_err(),
            DequeueError::WorkerBlocked(blocked)
        );
    }

    #[test]
    fn empty_queue_vs_work_in_flight() {
        let queue = balancing_with(BalancingConfig {
            max_buckets_per_worker: NonZeroUsize::new(5).unwrap(),
            ..Default::default()
        });
        let w1 = worker(&queue, "w1");
        assert!(matches!(
            queue.dequeue_bucket(&w1).unwrap(),
            DequeueResult::QueueIsEmpty(..)
        ));

        queue
            .enqueue(&JobId::from("job"), vec![bucket("b1", &["a"])], JobPriority(0))
            .unwrap();
        dequeued(queue.dequeue_bucket(&w1));

        // The only bucket is in flight; it may come back.
        assert!(matches!(
            queue.dequeue_bucket(&w1).unwrap(),
            DequeueResult::CheckAgainLater(..)
        ));
    }

    #[test]
    fn worker_in_flight_limit() {
        let queue = balancing_with(BalancingConfig {
            max_buckets_per_worker: NonZeroUsize::new(2).unwrap(),
            ..Default::default()
        });
        let w1 = worker(&queue, "w1");
        queue
            .enqueue(
                &JobId::from("job"),
                vec![
                    bucket("b1", &["a"]),
                    bucket("b2", &["b"]),
                    bucket("b3", &["c"]),
                ],
                JobPriority(0),
            )
            .unwrap();

        let first = dequeued(queue.dequeue_bucket(&w1));
        dequeued(queue.dequeue_bucket(&w1));
        assert!(matches!(
            queue.dequeue_bucket(&w1).unwrap(),
            DequeueResult::CheckAgainLater(..)
        ));

        queue.accept(first.bucket_id(), &w1, passing(first.bucket()));
        dequeued(queue.dequeue_bucket(&w1));
    }

    #[test]
    fn duplicate_bucket_across_jobs_is_rejected() {
        let queue = balancing();
        queue
            .enqueue(&JobId::from("job1"), vec![bucket("b1", &["a"])], JobPriority(0))
            .unwrap();

        let err = queue
            .enqueue(
                &JobId::from("job2"),
                vec![bucket("b2", &["b"]), bucket("b1", &["a"])],
                JobPriority(0),
            )
            .unwrap_err();
        assert_eq!(err, EnqueueError::DuplicateBucket(BucketId::from("b1")));

        // Nothing of the rejected batch was kept; b2 can still be enqueued.
        queue
            .enqueue(&JobId::from("job2"), vec![bucket("b2", &["b"])], JobPriority(0))
            .unwrap();
    }

    #[test]
    fn higher_priority_job_goes_first() {
        let queue = balancing();
        let w1 = worker(&queue, "w1");
        queue
            .enqueue(&JobId::from("low"), vec![bucket("l1", &["a"])], JobPriority(1))
            .unwrap();
        queue
            .enqueue(&JobId::from("high"), vec![bucket("h1", &["a"])], JobPriority(9))
            .unwrap();

        let first = dequeued(queue.dequeue_bucket(&w1));
        assert_eq!(job_of(&queue, &first), JobId::from("high"));
    }

    #[test]
    fn equal_priority_jobs_share_workers() {
        let queue = balancing();
        let jobs = [JobId::from("job1"), JobId::from("job2")];
        for job in &jobs {
            let buckets = (0..10)
                .map(|i| bucket(&format!("{job}-{i}"), &["a"]))
                .collect();
            queue.enqueue(job, buckets, JobPriority(0)).unwrap();
        }

        let mut order = vec![];
        let mut per_job: HashMap<JobId, usize> = HashMap::new();
        for i in 0..20 {
            let w = worker(&queue, &format!("w{i}"));
            let d = dequeued(queue.dequeue_bucket(&w));
            let job = job_of(&queue, &d);
            *per_job.entry(job.clone()).or_default() += 1;
            order.push(job);
        }
        assert_eq!(per_job[&jobs[0]], 10);
        assert_eq!(per_job[&jobs[1]], 10);
        // Interleaved, not one job after the other.
        assert_ne!(order[0], order[1]);
        assert_ne!(order[18], order[19]);
    }

    #[test]
    fn preferred_workers_pick_their_job() {
        let queue = balancing();
        let w1 = worker(&queue, "w1");
        let w2 = worker(&queue, "w2");
        queue
            .enqueue(&JobId::from("job1"), vec![bucket("a1", &["a"])], JobPriority(0))
            .unwrap();
        queue
            .enqueue(&JobId::from("job2"), vec![bucket("b1", &["a"])], JobPriority(0))
            .unwrap();

        queue.rebalance(&StaticWorkersToUtilize::new(HashMap::from([(
            JobId::from("job2"),
            vec![w2.clone()],
        )])));

        let d2 = dequeued(queue.dequeue_bucket(&w2));
        assert_eq!(job_of(&queue, &d2), JobId::from("job2"));
        let d1 = dequeued(queue.dequeue_bucket(&w1));
        assert_eq!(job_of(&queue, &d1), JobId::from("job1"));
    }

    #[test]
    fn unnamed_worker_still_gets_work() {
        let queue = balancing();
        let w1 = worker(&queue, "w1");
        let w2 = worker(&queue, "w2");
        queue
            .enqueue(&JobId::from("job"), vec![bucket("b1", &["a"])], JobPriority(0))
            .unwrap();
        queue.rebalance(&StaticWorkersToUtilize::new(HashMap::from([(
            JobId::from("job"),
            vec![w2],
        )])));

        let d = dequeued(queue.dequeue_bucket(&w1));
        assert_eq!(job_of(&queue, &d), JobId::from("job"));
    }

    #[test]
    fn job_keeps_its_first_priority() {
        let queue = balancing();
        let w1 = worker(&queue, "w1");
        queue
            .enqueue(&JobId::from("first"), vec![bucket("f1", &["a"])], JobPriority(5))
            .unwrap();
        queue
            .enqueue(&JobId::from("second"), vec![bucket("s1", &["a"])], JobPriority(3))
            .unwrap();
        queue
            .enqueue(&JobId::from("second"), vec![bucket("s2", &["b"])], JobPriority(9))
            .unwrap();

        let d = dequeued(queue.dequeue_bucket(&w1));
        assert_eq!(job_of(&queue, &d), JobId::from("first"));
    }

    #[test]
    fn results_route_to_owning_job() {
        let queue = balancing();
        let w1 = worker(&queue, "w1");
        queue
            .enqueue(&JobId::from("job1"), vec![bucket("a1", &["a"])], JobPriority(0))
            .unwrap();
        queue
            .enqueue(&JobId::from("job2"), vec![bucket("b1", &["b"])], JobPriority(0))
            .unwrap();

        for _ in 0..2 {
            let d = dequeued(queue.dequeue_bucket(&w1));
            let outcome = queue.accept(d.bucket_id(), &w1, passing(d.bucket()));
            assert!(matches!(outcome, AcceptResult::Accepted { .. }));
        }

        let job1 = queue.job_state(&JobId::from("job1")).unwrap();
        let job2 = queue.job_state(&JobId::from("job2")).unwrap();
        assert!(job1.is_depleted() && job2.is_depleted());
        assert_eq!(job1.results[0].test_entry.test_name.method_name, "a");
        assert_eq!(job2.results[0].test_entry.test_name.method_name, "b");
        assert!(queue.aliveness().buckets_in_flight(&w1).is_empty());
    }

    #[test]
    fn unknown_bucket_result_is_rejected() {
        let queue = balancing();
        let w1 = worker(&queue, "w1");
        let b = bucket("nope", &["a"]);
        assert_eq!(
            queue.accept(&b.bucket_id, &w1, passing(&b)),
            AcceptResult::Rejected(RejectionReason::BucketNotFound)
        );
    }

    #[test]
    fn retry_buckets_route_back_to_their_job() {
        let queue = balancing();
        let w1 = worker(&queue, "w1");
        let job = JobId::from("job");
        queue
            .enqueue(&job, vec![bucket_with_retries("b1", &["a"], 1)], JobPriority(0))
            .unwrap();

        let d = dequeued(queue.dequeue_bucket(&w1));
        let outcome = queue.accept(
            d.bucket_id(),
            &w1,
            testing_result(d.bucket(), vec![outcome("a", false)]),
        );
        let retry_bucket = match outcome {
            AcceptResult::Accepted {
                retry_bucket: Some(retry_bucket),
                ..
            } => retry_bucket,
            other => panic!("expected a retry: {other:?}"),
        };

        let retry = dequeued(queue.dequeue_bucket(&w1));
        assert_eq!(retry.bucket_id(), &retry_bucket);
        assert!(matches!(
            queue.accept(&retry_bucket, &w1, passing(retry.bucket())),
            AcceptResult::Accepted { .. }
        ));

        let state = queue.job_state(&job).unwrap();
        assert!(state.is_depleted());
        assert_eq!(state.results.len(), 1);
        assert!(state.results[0].succeeded());
    }

    #[test]
    fn delete_requires_depleted_job() {
        let queue = balancing();
        let w1 = worker(&queue, "w1");
        let job = JobId::from("job");
        queue
            .enqueue(&job, vec![bucket("b1", &["a"])], JobPriority(0))
            .unwrap();

        assert_eq!(
            queue.delete_job(&job),
            Err(DeleteJobError::BucketsStillInFlight {
                job_id: job.clone(),
                enqueued_count: 1,
                dequeued_count: 0
            })
        );

        let d = dequeued(queue.dequeue_bucket(&w1));
        assert_eq!(
            queue.delete_job(&job),
            Err(DeleteJobError::BucketsStillInFlight {
                job_id: job.clone(),
                enqueued_count: 0,
                dequeued_count: 1
            })
        );

        queue.accept(d.bucket_id(), &w1, passing(d.bucket()));
        queue.delete_job(&job).unwrap();
        assert!(queue.job_state(&job).is_none());
        assert_eq!(queue.delete_job(&job), Err(DeleteJobError::NotFound(job)));
    }

    #[test]
    fn cancel_releases_in_flight_buckets() {
        let events = QueueEventBus::default();
        let mut subscription = events.subscribe();
        let queue = BalancingBucketQueue::new(
            Default::default(),
            Arc::new(WorkerAlivenessTracker::new(Duration::from_secs(30))),
            events,
        );
        let w1 = worker(&queue, "w1");
        let job = JobId::from("job");
        queue
            .enqueue(
                &job,
                vec![bucket("b1", &["a"]), bucket("b2", &["b"])],
                JobPriority(0),
            )
            .unwrap();
        let d = dequeued(queue.dequeue_bucket(&w1));

        let cancelled = queue.cancel_job(&job).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert!(queue.aliveness().buckets_in_flight(&w1).is_empty());
        assert!(queue.job_state(&job).is_none());
        assert!(queue.job_ids().is_empty());

        // The worker's late result is a no-op.
        assert_eq!(
            queue.accept(d.bucket_id(), &w1, passing(d.bucket())),
            AcceptResult::Rejected(RejectionReason::BucketNotFound)
        );
        assert!(subscription
            .drain()
            .contains(&QueueEvent::BucketCancelled {
                job_id: job.clone(),
                bucket_id: BucketId::from("b1"),
                worker_id: w1,
            }));
        assert_eq!(queue.cancel_job(&job), Err(CancelJobError::NotFound(job)));
    }

    #[test]
    fn sweep_reclaims_from_silent_workers() {
        let queue = balancing();
        let slow = worker(&queue, "slow");
        let fast = worker(&queue, "fast");
        let job = JobId::from("job");
        queue
            .enqueue(&job, vec![bucket("b1", &["a"])], JobPriority(0))
            .unwrap();
        let d = dequeued(queue.dequeue_bucket(&slow));

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(queue.reclaim_stuck_buckets(later), [BucketId::from("b1")]);
        assert!(matches!(
            queue.aliveness().aliveness(&slow),
            WorkerAliveness::Silent { .. }
        ));

        let again = dequeued(queue.dequeue_bucket(&fast));
        assert_eq!(again.bucket_id(), d.bucket_id());

        // The slow worker's result comes too late.
        assert_eq!(
            queue.accept(d.bucket_id(), &slow, passing(d.bucket())),
            AcceptResult::Rejected(RejectionReason::WorkerDoesNotOwnBucket {
                owner: fast.clone()
            })
        );
        assert!(matches!(
            queue.accept(again.bucket_id(), &fast, passing(again.bucket())),
            AcceptResult::Accepted { .. }
        ));
        assert_eq!(queue.job_state(&job).unwrap().results.len(), 1);
    }

    #[test]
    fn job_ids_are_oldest_first() {
        let queue = balancing();
        for job in ["c", "a", "b"] {
            queue
                .enqueue(
                    &JobId::from(job),
                    vec![bucket(&format!("{job}1"), &["t"])],
                    JobPriority(0),
                )
                .unwrap();
        }
        assert_eq!(
            queue.job_ids(),
            [JobId::from("c"), JobId::from("a"), JobId::from("b")]
        );
    }

    #[test]
    fn concurrent_workers_drain_every_job_exactly_once() {
        let queue = Arc::new(balancing_with(BalancingConfig {
            max_buckets_per_worker: NonZeroUsize::new(1).unwrap(),
            check_again_after: Duration::ZERO,
            ..Default::default()
        }));
        let num_jobs = 4;
        let buckets_per_job = 250;
        let num_workers = 12;

        for j in 0..num_jobs {
            let job = JobId::new(format!("job{j}"));
            let buckets = (0..buckets_per_job)
                .map(|i| bucket(&format!("{job}-{i}"), &["a", "b"]))
                .collect();
            queue.enqueue(&job, buckets, JobPriority(0)).unwrap();
        }

        let threads: Vec<_> = (0..num_workers)
            .map(|n| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let w = WorkerId::new(format!("w{n}"));
                    queue.register_worker(&w);
                    let mut ran = vec![];
                    loop {
                        match queue.dequeue_bucket(&w).unwrap() {
                            DequeueResult::Dequeued(d) => {
                                let outcome = queue.accept(d.bucket_id(), &w, passing(d.bucket()));
                                assert!(matches!(outcome, AcceptResult::Accepted { .. }));
                                ran.push(d.bucket_id().clone());
                            }
                            DequeueResult::CheckAgainLater(_) => std::thread::yield_now(),
                            DequeueResult::QueueIsEmpty(_) => break,
                        }
                    }
                    ran
                })
            })
            .collect();

        let ran: Vec<BucketId> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        let unique: HashSet<_> = ran.iter().collect();
        assert_eq!(ran.len(), num_jobs * buckets_per_job);
        assert_eq!(unique.len(), ran.len());

        for j in 0..num_jobs {
            let state = queue.job_state(&JobId::new(format!("job{j}"))).unwrap();
            assert!(state.is_depleted());
            assert_eq!(state.results.len(), buckets_per_job * 2);
        }
    }

    #[test]
    #[timeout(20000)]
    fn results_and_deletes_run_concurrently() {
        let queue = Arc::new(balancing());
        let w1 = worker(&queue, "w1");
        let other = worker(&queue, "other");
        let live = JobId::from("live");
        queue
            .enqueue(&live, vec![bucket("kept", &["a"])], JobPriority(0))
            .unwrap();
        let kept = dequeued(queue.dequeue_bucket(&w1));

        let reporter = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for _ in 0..5_000 {
                    let outcome = queue.accept(kept.bucket_id(), &other, passing(kept.bucket()));
                    assert!(matches!(outcome, AcceptResult::Rejected(_)));
                }
            })
        };
        let deleter = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    let job = JobId::new(format!("job{i}"));
                    queue.enqueue(&job, vec![], JobPriority(0)).unwrap();
                    queue.delete_job(&job).unwrap();
                }
            })
        };

        reporter.join().unwrap();
        deleter.join().unwrap();
        assert_eq!(queue.job_ids(), [live]);
    }

    #[test]
    #[timeout(20000)]
    fn deleting_never_drops_buckets_being_enqueued() {
        let queue = Arc::new(balancing());
        let num_jobs = 500;
        let job_id = |i: usize| JobId::new(format!("job{i}"));
        let done = Arc::new(AtomicBool::new(false));

        let deleter = {
            let queue = queue.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    for i in 0..num_jobs {
                        // Only an empty job could be deleted, and none should ever be seen empty.
                        let _ = queue.delete_job(&job_id(i));
                    }
                }
            })
        };

        for i in 0..num_jobs {
            queue
                .enqueue(&job_id(i), vec![bucket(&format!("b{i}"), &["a"])], JobPriority(0))
                .unwrap();
        }
        done.store(true, Ordering::SeqCst);
        deleter.join().unwrap();

        for i in 0..num_jobs {
            let state = queue.job_state(&job_id(i)).unwrap();
            assert_eq!(state.enqueued_count, 1, "bucket of {} was lost", job_id(i));
        }
    }
}
