//! The queue of buckets for one job.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use bq_utils::{
    log_assert,
    net_protocol::{
        entity::WorkerId,
        queue::{RejectionReason, WorkerAliveness},
        results::{TestEntryResult, TestingResult},
        workers::{Bucket, BucketId, JobId, TestEntry},
    },
};
use thiserror::Error;

use crate::{
    aliveness::WorkerAlivenessTracker,
    events::{QueueEvent, QueueEventBus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedBucket {
    pub bucket: Bucket,
    pub enqueue_time: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBucket {
    pub enqueued_bucket: EnqueuedBucket,
    pub worker_id: WorkerId,
    pub dequeue_time: Instant,
}

impl DequeuedBucket {
    pub fn bucket(&self) -> &Bucket {
        &self.enqueued_bucket.bucket
    }

    pub fn bucket_id(&self) -> &BucketId {
        &self.enqueued_bucket.bucket.bucket_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningQueueState {
    pub enqueued_count: usize,
    pub dequeued_count: usize,
    pub enqueued_bucket_ids: Vec<BucketId>,
    pub dequeued_bucket_ids: Vec<BucketId>,
}

impl RunningQueueState {
    pub fn is_depleted(&self) -> bool {
        self.enqueued_count == 0 && self.dequeued_count == 0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("bucket {0} is already known to the queue")]
    DuplicateBucket(BucketId),
}

/// The outcome of an accepted bucket result.
#[derive(Debug)]
pub struct AcceptedResults {
    pub dequeued_bucket: DequeuedBucket,
    /// Final results to record. Covers every test of the bucket, except those that failed and
    /// were re-enqueued for another attempt.
    pub results: Vec<TestEntryResult>,
    /// The bucket re-running failed tests, if any were re-enqueued.
    pub retry_bucket: Option<BucketId>,
}

#[derive(Debug)]
pub enum AcceptanceOutcome {
    Accepted(AcceptedResults),
    Rejected(RejectionReason),
}

#[derive(Debug, Clone, Copy)]
pub struct BucketQueueConfig {
    /// How long a bucket may be in flight before it is taken back, regardless of what its worker
    /// is up to.
    pub maximum_time_since_dequeue: Duration,
}

impl Default for BucketQueueConfig {
    fn default() -> Self {
        Self {
            maximum_time_since_dequeue: Duration::from_secs(15 * 60),
        }
    }
}

/// Where a retry bucket came from.
#[derive(Debug, Clone)]
struct RetryLineage {
    root: BucketId,
    attempt: u32,
}

/// FIFO queue of a job's buckets, plus the map of buckets currently in flight.
///
/// A bucket id is in at most one of the two at any time. Buckets taken back from workers go to
/// the front of the queue.
#[derive(Debug)]
pub struct BucketQueue {
    job_id: JobId,
    config: BucketQueueConfig,
    enqueued: VecDeque<EnqueuedBucket>,
    dequeued: HashMap<BucketId, DequeuedBucket>,
    /// Every bucket id this queue has ever held.
    known: HashSet<BucketId>,
    retries: HashMap<BucketId, RetryLineage>,
    events: QueueEventBus,
}

impl BucketQueue {
    pub fn new(job_id: JobId, config: BucketQueueConfig, events: QueueEventBus) -> Self {
        Self {
            job_id,
            config,
            enqueued: Default::default(),
            dequeued: Default::default(),
            known: Default::default(),
            retries: Default::default(),
            events,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Appends buckets to the back of the queue. Either all are enqueued, or, if any id was
    /// ever seen by this queue or repeats within `buckets`, none are.
    pub fn enqueue(&mut self, buckets: Vec<Bucket>) -> Result<(), EnqueueError> {
        let mut batch = HashSet::with_capacity(buckets.len());
        for bucket in &buckets {
            if self.known.contains(&bucket.bucket_id) || !batch.insert(&bucket.bucket_id) {
                return Err(EnqueueError::DuplicateBucket(bucket.bucket_id.clone()));
            }
        }

        let enqueue_time = Instant::now();
        for bucket in buckets {
            self.known.insert(bucket.bucket_id.clone());
            self.enqueued.push_back(EnqueuedBucket {
                bucket,
                enqueue_time,
            });
        }
        Ok(())
    }

    /// Hands the bucket at the front of the queue to `worker_id`.
    pub fn dequeue_bucket(&mut self, worker_id: &WorkerId, now: Instant) -> Option<DequeuedBucket> {
        while let Some(enqueued_bucket) = self.enqueued.pop_front() {
            let bucket_id = enqueued_bucket.bucket.bucket_id.clone();
            if self.dequeued.contains_key(&bucket_id) {
                log_assert!(
                    false,
                    job_id = %self.job_id,
                    %bucket_id,
                    "bucket is both enqueued and dequeued; dropping the enqueued copy"
                );
                continue;
            }

            let dequeued_bucket = DequeuedBucket {
                enqueued_bucket,
                worker_id: worker_id.clone(),
                dequeue_time: now,
            };
            self.dequeued.insert(bucket_id, dequeued_bucket.clone());
            return Some(dequeued_bucket);
        }
        None
    }

    /// Validates and takes in a worker's results for a bucket it holds.
    ///
    /// Tests of the bucket missing from the results are recorded as failed runs. Failed tests of
    /// a bucket whose retry budget is not spent are re-enqueued at the front of the queue as a
    /// retry bucket, and are not part of the recorded results.
    pub fn accept(
        &mut self,
        bucket_id: &BucketId,
        worker_id: &WorkerId,
        testing_result: TestingResult,
    ) -> AcceptanceOutcome {
        let owner = match self.dequeued.get(bucket_id) {
            Some(dequeued) => &dequeued.worker_id,
            None => return AcceptanceOutcome::Rejected(RejectionReason::BucketNotFound),
        };
        if owner != worker_id {
            return AcceptanceOutcome::Rejected(RejectionReason::WorkerDoesNotOwnBucket {
                owner: owner.clone(),
            });
        }

        let dequeued_bucket = &self.dequeued[bucket_id];
        let requested: HashSet<&TestEntry> = dequeued_bucket.bucket().test_entries.iter().collect();
        let mut unexpected: Vec<TestEntry> = vec![];
        for result in &testing_result.unfiltered_results {
            if !requested.contains(&result.test_entry) && !unexpected.contains(&result.test_entry)
            {
                unexpected.push(result.test_entry.clone());
            }
        }
        if !unexpected.is_empty() {
            return AcceptanceOutcome::Rejected(RejectionReason::ResultsDoNotMatchRequest {
                unexpected,
            });
        }

        let dequeued_bucket = match self.dequeued.remove(bucket_id) {
            Some(dequeued_bucket) => dequeued_bucket,
            None => return AcceptanceOutcome::Rejected(RejectionReason::BucketNotFound),
        };

        let merged = merge_results(dequeued_bucket.bucket(), testing_result);
        let (results, retry_bucket) = self.split_off_retries(dequeued_bucket.bucket(), merged);

        AcceptanceOutcome::Accepted(AcceptedResults {
            dequeued_bucket,
            results,
            retry_bucket,
        })
    }

    /// Separates failed tests that still have attempts left into a retry bucket, enqueued at the
    /// front. Returns the results that are final, and the retry bucket's id.
    fn split_off_retries(
        &mut self,
        bucket: &Bucket,
        merged: Vec<TestEntryResult>,
    ) -> (Vec<TestEntryResult>, Option<BucketId>) {
        let lineage = self
            .retries
            .get(&bucket.bucket_id)
            .cloned()
            .unwrap_or_else(|| RetryLineage {
                root: bucket.bucket_id.clone(),
                attempt: 0,
            });
        if lineage.attempt >= bucket.number_of_retries() {
            return (merged, None);
        }

        let (final_results, failed): (Vec<_>, Vec<_>) =
            merged.into_iter().partition(TestEntryResult::succeeded);
        if failed.is_empty() {
            return (final_results, None);
        }

        let next_attempt = lineage.attempt + 1;
        let retry_id = BucketId::new(format!("{}-retry-{}", lineage.root, next_attempt));
        if self.known.contains(&retry_id) {
            log_assert!(
                false,
                job_id = %self.job_id,
                bucket_id = %retry_id,
                "retry bucket already exists; recording failures as final"
            );
            let mut all = final_results;
            all.extend(failed);
            return (all, None);
        }

        let retry_bucket = Bucket {
            bucket_id: retry_id.clone(),
            test_entries: failed.into_iter().map(|r| r.test_entry).collect(),
            configuration: bucket.configuration.clone(),
        };
        self.known.insert(retry_id.clone());
        self.retries.insert(
            retry_id.clone(),
            RetryLineage {
                root: lineage.root,
                attempt: next_attempt,
            },
        );
        self.enqueued.push_front(EnqueuedBucket {
            bucket: retry_bucket,
            enqueue_time: Instant::now(),
        });

        (final_results, Some(retry_id))
    }

    /// Takes back buckets whose worker is silent, blocked or unknown, or that have been in flight
    /// for longer than the configured maximum as of `now`. Taken-back buckets go to the front
    /// of the queue, earliest dequeued first.
    pub fn reclaim_stuck_buckets(
        &mut self,
        aliveness: &WorkerAlivenessTracker,
        now: Instant,
    ) -> Vec<DequeuedBucket> {
        let maximum = self.config.maximum_time_since_dequeue;
        let stuck_ids: Vec<BucketId> = self
            .dequeued
            .values()
            .filter(|dequeued| {
                let worker_gone = matches!(
                    aliveness.aliveness(&dequeued.worker_id),
                    WorkerAliveness::Silent { .. }
                        | WorkerAliveness::Blocked
                        | WorkerAliveness::NotRegistered
                );
                worker_gone || now.saturating_duration_since(dequeued.dequeue_time) > maximum
            })
            .map(|dequeued| dequeued.bucket_id().clone())
            .collect();

        let mut reclaimed: Vec<DequeuedBucket> = stuck_ids
            .iter()
            .filter_map(|bucket_id| self.dequeued.remove(bucket_id))
            .collect();
        reclaimed.sort_by(|a, b| {
            a.dequeue_time
                .cmp(&b.dequeue_time)
                .then_with(|| a.bucket_id().cmp(b.bucket_id()))
        });

        for dequeued in reclaimed.iter().rev() {
            aliveness.release_bucket(&dequeued.worker_id, dequeued.bucket_id());
            self.enqueued.push_front(dequeued.enqueued_bucket.clone());
        }
        for dequeued in &reclaimed {
            self.events.post(QueueEvent::BucketReclaimed {
                job_id: self.job_id.clone(),
                bucket_id: dequeued.bucket_id().clone(),
                worker_id: dequeued.worker_id.clone(),
            });
        }

        reclaimed
    }

    /// Drops all enqueued buckets and forgets all in-flight ones. Returns the in-flight buckets,
    /// so their workers can be released.
    pub fn cancel(&mut self) -> Vec<DequeuedBucket> {
        self.enqueued.clear();
        let mut in_flight: Vec<_> = self.dequeued.drain().map(|(_, d)| d).collect();
        in_flight.sort_by(|a, b| a.bucket_id().cmp(b.bucket_id()));
        in_flight
    }

    pub fn running_queue_state(&self) -> RunningQueueState {
        let mut dequeued_bucket_ids: Vec<_> = self.dequeued.keys().cloned().collect();
        dequeued_bucket_ids.sort();
        RunningQueueState {
            enqueued_count: self.enqueued.len(),
            dequeued_count: self.dequeued.len(),
            enqueued_bucket_ids: self
                .enqueued
                .iter()
                .map(|e| e.bucket.bucket_id.clone())
                .collect(),
            dequeued_bucket_ids,
        }
    }

    pub fn enqueued_count(&self) -> usize {
        self.enqueued.len()
    }

    pub fn dequeued_count(&self) -> usize {
        self.dequeued.len()
    }

    pub fn is_depleted(&self) -> bool {
        self.enqueued.is_empty() && self.dequeued.is_empty()
    }

    pub fn known_bucket_ids(&self) -> impl Iterator<Item = &BucketId> + '_ {
        self.known.iter()
    }

    pub fn in_flight(&self, bucket_id: &BucketId) -> Option<&DequeuedBucket> {
        self.dequeued.get(bucket_id)
    }
}

/// One result per test of the bucket, in bucket order: all reported runs of a test are merged,
/// and a test with no runs at all becomes a failed run.
fn merge_results(bucket: &Bucket, testing_result: TestingResult) -> Vec<TestEntryResult> {
    let mut by_entry: HashMap<TestEntry, Vec<_>> = HashMap::new();
    for result in testing_result.unfiltered_results {
        by_entry
            .entry(result.test_entry)
            .or_default()
            .extend(result.test_run_results);
    }

    bucket
        .test_entries
        .iter()
        .map(|entry| match by_entry.remove(entry) {
            Some(runs) if !runs.is_empty() => TestEntryResult {
                test_entry: entry.clone(),
                test_run_results: runs,
            },
            _ => TestEntryResult::did_not_run(entry.clone()),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use bq_utils::net_protocol::{
        entity::WorkerId,
        queue::RejectionReason,
        results::{TestEntryResult, DID_NOT_RUN_REASON},
        workers::{BucketId, JobId, TestEntry},
    };
    use parking_lot::Mutex;

    use super::{AcceptanceOutcome, BucketQueue, BucketQueueConfig, EnqueueError};
    use crate::{
        aliveness::WorkerAlivenessTracker,
        events::{QueueEvent, QueueEventBus},
        test_utils::{bucket, bucket_with_retries, outcome, passing, testing_result},
    };

    fn queue() -> BucketQueue {
        queue_with(Default::default())
    }

    fn queue_with(config: BucketQueueConfig) -> BucketQueue {
        BucketQueue::new(JobId::from("job"), config, QueueEventBus::default())
    }

    fn accepted(outcome: AcceptanceOutcome) -> super::AcceptedResults {
        match outcome {
            AcceptanceOutcome::Accepted(accepted) => accepted,
            AcceptanceOutcome::Rejected(reason) => panic!("rejected: {reason}"),
        }
    }

    fn rejected(outcome: AcceptanceOutcome) -> RejectionReason {
        match outcome {
            AcceptanceOutcome::Accepted(accepted) => panic!("accepted: {accepted:?}"),
            AcceptanceOutcome::Rejected(reason) => reason,
        }
    }

    #[test]
    fn dequeue_is_fifo() {
        let mut queue = queue();
        queue
            .enqueue(vec![bucket("b1", &["a"]), bucket("b2", &["b"])])
            .unwrap();

        let worker = WorkerId::from("w1");
        let now = Instant::now();
        assert_eq!(
            queue.dequeue_bucket(&worker, now).unwrap().bucket_id(),
            &BucketId::from("b1")
        );
        assert_eq!(
            queue.dequeue_bucket(&worker, now).unwrap().bucket_id(),
            &BucketId::from("b2")
        );
        assert!(queue.dequeue_bucket(&worker, now).is_none());

        let state = queue.running_queue_state();
        assert_eq!(state.enqueued_count, 0);
        assert_eq!(state.dequeued_count, 2);
        assert_eq!(
            state.dequeued_bucket_ids,
            [BucketId::from("b1"), BucketId::from("b2")]
        );
    }

    #[test]
    fn duplicate_enqueue_is_all_or_nothing() {
        let mut queue = queue();
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();

        let err = queue
            .enqueue(vec![bucket("b2", &["b"]), bucket("b1", &["a"])])
            .unwrap_err();
        assert_eq!(err, EnqueueError::DuplicateBucket(BucketId::from("b1")));
        assert_eq!(queue.enqueued_count(), 1);

        let err = queue
            .enqueue(vec![bucket("b3", &["c"]), bucket("b3", &["c"])])
            .unwrap_err();
        assert_eq!(err, EnqueueError::DuplicateBucket(BucketId::from("b3")));
        assert_eq!(queue.enqueued_count(), 1);
    }

    #[test]
    fn accepted_bucket_cannot_be_enqueued_again() {
        let mut queue = queue();
        let b1 = bucket("b1", &["a"]);
        queue.enqueue(vec![b1.clone()]).unwrap();
        let worker = WorkerId::from("w1");
        queue.dequeue_bucket(&worker, Instant::now()).unwrap();
        accepted(queue.accept(&b1.bucket_id, &worker, passing(&b1)));

        assert!(queue.is_depleted());
        assert_eq!(
            queue.enqueue(vec![b1]),
            Err(EnqueueError::DuplicateBucket(BucketId::from("b1")))
        );
    }

    #[test]
    fn accept_records_every_test() {
        let mut queue = queue();
        let b1 = bucket("b1", &["a", "b"]);
        queue.enqueue(vec![b1.clone()]).unwrap();
        let worker = WorkerId::from("w1");
        queue.dequeue_bucket(&worker, Instant::now()).unwrap();

        let accepted = accepted(queue.accept(&b1.bucket_id, &worker, passing(&b1)));
        assert_eq!(accepted.results.len(), 2);
        assert!(accepted.results.iter().all(TestEntryResult::succeeded));
        assert_eq!(accepted.retry_bucket, None);
        assert!(queue.is_depleted());
    }

    #[test]
    fn stale_result_is_rejected() {
        let mut queue = queue();
        let b1 = bucket("b1", &["a"]);
        queue.enqueue(vec![b1.clone()]).unwrap();
        let worker = WorkerId::from("w1");

        // Never dequeued.
        assert_eq!(
            rejected(queue.accept(&b1.bucket_id, &worker, passing(&b1))),
            RejectionReason::BucketNotFound
        );

        queue.dequeue_bucket(&worker, Instant::now()).unwrap();
        accepted(queue.accept(&b1.bucket_id, &worker, passing(&b1)));

        // Already accepted.
        assert_eq!(
            rejected(queue.accept(&b1.bucket_id, &worker, passing(&b1))),
            RejectionReason::BucketNotFound
        );
    }

    #[test]
    fn result_from_non_owner_is_rejected() {
        let mut queue = queue();
        let b1 = bucket("b1", &["a"]);
        queue.enqueue(vec![b1.clone()]).unwrap();
        queue
            .dequeue_bucket(&WorkerId::from("owner"), Instant::now())
            .unwrap();

        assert_eq!(
            rejected(queue.accept(&b1.bucket_id, &WorkerId::from("other"), passing(&b1))),
            RejectionReason::WorkerDoesNotOwnBucket {
                owner: WorkerId::from("owner")
            }
        );
        assert_eq!(queue.dequeued_count(), 1);
    }

    #[test]
    fn results_for_unrequested_tests_are_rejected() {
        let mut queue = queue();
        let b1 = bucket("b1", &["a"]);
        queue.enqueue(vec![b1.clone()]).unwrap();
        let worker = WorkerId::from("w1");
        queue.dequeue_bucket(&worker, Instant::now()).unwrap();

        let result = testing_result(&b1, vec![outcome("a", true), outcome("zzz", true)]);
        assert_eq!(
            rejected(queue.accept(&b1.bucket_id, &worker, result)),
            RejectionReason::ResultsDoNotMatchRequest {
                unexpected: vec![TestEntry::new("Class", "zzz")]
            }
        );
        // Still in flight; a correct report is accepted.
        accepted(queue.accept(&b1.bucket_id, &worker, passing(&b1)));
    }

    #[test]
    fn unreported_tests_are_recorded_as_not_run() {
        let mut queue = queue();
        let b1 = bucket("b1", &["a", "b"]);
        queue.enqueue(vec![b1.clone()]).unwrap();
        let worker = WorkerId::from("w1");
        queue.dequeue_bucket(&worker, Instant::now()).unwrap();

        let result = testing_result(&b1, vec![outcome("a", true)]);
        let accepted = accepted(queue.accept(&b1.bucket_id, &worker, result));

        assert_eq!(accepted.results.len(), 2);
        let b = &accepted.results[1];
        assert_eq!(b.test_entry, TestEntry::new("Class", "b"));
        assert!(!b.succeeded());
        assert_eq!(
            b.test_run_results[0].exceptions[0].reason,
            DID_NOT_RUN_REASON
        );
    }

    #[test]
    fn failed_tests_are_retried_through_the_queue() {
        let mut queue = queue();
        let b1 = bucket_with_retries("b1", &["a", "b", "c"], 1);
        queue
            .enqueue(vec![b1.clone(), bucket("b2", &["d"])])
            .unwrap();
        let worker = WorkerId::from("w1");
        queue.dequeue_bucket(&worker, Instant::now()).unwrap();

        let result = testing_result(
            &b1,
            vec![outcome("a", true), outcome("b", false), outcome("c", false)],
        );
        let first = accepted(queue.accept(&b1.bucket_id, &worker, result));
        assert_eq!(first.results.len(), 1);
        let retry_id = first.retry_bucket.unwrap();

        // The retry jumps ahead of b2.
        let retry = queue.dequeue_bucket(&worker, Instant::now()).unwrap();
        assert_eq!(retry.bucket_id(), &retry_id);
        assert_eq!(
            retry.bucket().test_entries,
            [TestEntry::new("Class", "b"), TestEntry::new("Class", "c")]
        );

        // Retry budget spent: failures are final.
        let result = testing_result(
            retry.bucket(),
            vec![outcome("b", true), outcome("c", false)],
        );
        let second = accepted(queue.accept(&retry_id, &worker, result));
        assert_eq!(second.results.len(), 2);
        assert_eq!(second.retry_bucket, None);
        assert_eq!(queue.enqueued_count(), 1);
    }

    #[test]
    fn reclaims_from_silent_blocked_and_unknown_workers() {
        let aliveness = WorkerAlivenessTracker::new(Duration::from_secs(30));
        let alive = WorkerId::from("alive");
        let silent = WorkerId::from("silent");
        let blocked = WorkerId::from("blocked");
        let unknown = WorkerId::from("unknown");
        for worker in [&alive, &silent, &blocked] {
            aliveness.register(worker);
        }

        let mut queue = queue();
        queue
            .enqueue(vec![
                bucket("b1", &["a"]),
                bucket("b2", &["b"]),
                bucket("b3", &["c"]),
                bucket("b4", &["d"]),
            ])
            .unwrap();
        let start = Instant::now();
        for (i, worker) in [&alive, &silent, &blocked, &unknown].into_iter().enumerate() {
            let dequeued = queue
                .dequeue_bucket(worker, start + Duration::from_millis(i as u64))
                .unwrap();
            if worker != &unknown {
                aliveness.did_dequeue_bucket(worker, dequeued.bucket_id());
            }
        }
        aliveness.mark_silent(&silent);
        aliveness.block(&blocked);

        let reclaimed = queue.reclaim_stuck_buckets(&aliveness, start);
        let ids: Vec<_> = reclaimed.iter().map(|d| d.bucket_id().clone()).collect();
        assert_eq!(
            ids,
            [
                BucketId::from("b2"),
                BucketId::from("b3"),
                BucketId::from("b4")
            ]
        );

        let state = queue.running_queue_state();
        assert_eq!(state.dequeued_bucket_ids, [BucketId::from("b1")]);
        assert_eq!(state.enqueued_bucket_ids, ids);
        assert!(aliveness.buckets_in_flight(&silent).is_empty());
        assert!(aliveness.buckets_in_flight(&blocked).is_empty());
    }

    #[test]
    fn reclaims_buckets_in_flight_too_long() {
        let aliveness = WorkerAlivenessTracker::new(Duration::from_secs(30));
        let worker = WorkerId::from("w1");
        aliveness.register(&worker);

        let mut queue = queue_with(BucketQueueConfig {
            maximum_time_since_dequeue: Duration::from_secs(60),
        });
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();
        let start = Instant::now();
        queue.dequeue_bucket(&worker, start).unwrap();

        assert!(queue
            .reclaim_stuck_buckets(&aliveness, start + Duration::from_secs(59))
            .is_empty());
        assert_eq!(
            queue
                .reclaim_stuck_buckets(&aliveness, start + Duration::from_secs(61))
                .len(),
            1
        );
        assert_eq!(queue.enqueued_count(), 1);
    }

    #[test]
    fn result_after_reclaim_is_rejected() {
        let aliveness = WorkerAlivenessTracker::new(Duration::from_secs(30));
        let slow = WorkerId::from("slow");
        let fast = WorkerId::from("fast");
        aliveness.register(&slow);
        aliveness.register(&fast);

        let mut queue = queue();
        let b1 = bucket("b1", &["a"]);
        queue.enqueue(vec![b1.clone()]).unwrap();
        queue.dequeue_bucket(&slow, Instant::now()).unwrap();
        aliveness.did_dequeue_bucket(&slow, &b1.bucket_id);
        aliveness.mark_silent(&slow);

        queue.reclaim_stuck_buckets(&aliveness, Instant::now());
        queue.dequeue_bucket(&fast, Instant::now()).unwrap();

        assert_eq!(
            rejected(queue.accept(&b1.bucket_id, &slow, passing(&b1))),
            RejectionReason::WorkerDoesNotOwnBucket {
                owner: fast.clone()
            }
        );
        accepted(queue.accept(&b1.bucket_id, &fast, passing(&b1)));
    }

    #[test]
    fn reclaim_posts_events() {
        let aliveness = WorkerAlivenessTracker::new(Duration::from_secs(30));
        let events = QueueEventBus::default();
        let mut subscription = events.subscribe();
        let mut queue = BucketQueue::new(JobId::from("job"), Default::default(), events);
        queue.enqueue(vec![bucket("b1", &["a"])]).unwrap();
        queue
            .dequeue_bucket(&WorkerId::from("ghost"), Instant::now())
            .unwrap();

        queue.reclaim_stuck_buckets(&aliveness, Instant::now());
        assert_eq!(
            subscription.drain(),
            [QueueEvent::BucketReclaimed {
                job_id: JobId::from("job"),
                bucket_id: BucketId::from("b1"),
                worker_id: WorkerId::from("ghost"),
            }]
        );
    }

    #[test]
    fn cancel_empties_queue() {
        let mut queue = queue();
        queue
            .enqueue(vec![bucket("b1", &["a"]), bucket("b2", &["b"])])
            .unwrap();
        queue
            .dequeue_bucket(&WorkerId::from("w1"), Instant::now())
            .unwrap();

        let in_flight = queue.cancel();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].bucket_id(), &BucketId::from("b1"));
        assert!(queue.is_depleted());
    }

    #[test]
    fn no_bucket_is_dequeued_twice_under_contention() {
        let num_buckets = 2_000;
        let num_threads = 16;

        let mut queue = queue();
        queue
            .enqueue(
                (0..num_buckets)
                    .map(|i| bucket(&format!("b{i}"), &["a"]))
                    .collect(),
            )
            .unwrap();
        let queue = Arc::new(Mutex::new(queue));

        let threads: Vec<_> = (0..num_threads)
            .map(|n| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let worker = WorkerId::new(format!("w{n}"));
                    let mut mine = vec![];
                    while let Some(d) = queue.lock().dequeue_bucket(&worker, Instant::now()) {
                        mine.push(d.bucket_id().clone());
                    }
                    for bucket_id in &mine {
                        let b = bucket(bucket_id.as_str(), &["a"]);
                        let outcome = queue.lock().accept(bucket_id, &worker, passing(&b));
                        assert!(matches!(outcome, AcceptanceOutcome::Accepted(..)));
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<BucketId> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();

        assert_eq!(total, num_buckets);
        assert_eq!(all.len(), num_buckets);
        assert!(queue.lock().is_depleted());
    }
}
