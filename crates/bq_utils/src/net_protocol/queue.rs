//! Messages exchanged with the queue server.
//!
//! Every connection to the queue carries exactly one [Request], answered by exactly one
//! response whose type is determined by the request's [Message].

use std::{collections::BTreeMap, fmt, time::Duration};

use serde_derive::{Deserialize, Serialize};

use super::{
    entity::{Entity, WorkerId},
    results::{TestEntryResult, TestingResult},
    workers::{Bucket, BucketId, ConfiguredTestEntry, JobId, JobPriority, TestEntry},
};

#[derive(Serialize, Deserialize, Debug)]
pub struct Request {
    pub entity: Entity,
    pub message: Message,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Message {
    HealthCheck,
    /// A worker announces itself, and the protocol version it speaks.
    RegisterWorker { worker_id: WorkerId, version: String },
    /// A worker asks for the next bucket to run.
    DequeueBucket { worker_id: WorkerId },
    /// A worker reports the results of a bucket it ran.
    BucketResult {
        worker_id: WorkerId,
        testing_result: TestingResult,
    },
    /// A worker is still alive, and still running the buckets it holds.
    Heartbeat { worker_id: WorkerId },
    /// A client submits a job.
    ScheduleTests(ScheduleTestsRequest),
    JobState(JobId),
    /// Removes a job whose work is fully drained.
    DeleteJob(JobId),
    /// Removes a job regardless of outstanding work.
    CancelJob(JobId),
    WorkerAliveness,
    ActiveJobs,
}

/// How a job's flat list of tests is split into buckets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "size", rename_all = "camelCase")]
pub enum ScheduleStrategyType {
    /// One bucket with every test.
    Unsplit,
    /// One bucket per test.
    Individual,
    /// One bucket per worker, tests assigned round-robin.
    EquallyDivided,
    /// Buckets of at most the given number of tests.
    FixedBucketSize(u32),
}

impl fmt::Display for ScheduleStrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleStrategyType::Unsplit => write!(f, "unsplit"),
            ScheduleStrategyType::Individual => write!(f, "individual"),
            ScheduleStrategyType::EquallyDivided => write!(f, "equally_divided"),
            ScheduleStrategyType::FixedBucketSize(n) => write!(f, "fixed_bucket_size:{n}"),
        }
    }
}

impl std::str::FromStr for ScheduleStrategyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsplit" => Ok(Self::Unsplit),
            "individual" => Ok(Self::Individual),
            "equally_divided" => Ok(Self::EquallyDivided),
            other => match other.strip_prefix("fixed_bucket_size:") {
                Some(size) => size
                    .parse()
                    .map(Self::FixedBucketSize)
                    .map_err(|e| format!("invalid bucket size {size:?}: {e}")),
                None => Err(format!("unknown schedule strategy: {other}")),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduleTestsRequest {
    pub job_id: JobId,
    pub priority: JobPriority,
    pub strategy: ScheduleStrategyType,
    pub tests: Vec<ConfiguredTestEntry>,
}

/// Liveness of a worker, as tracked by the queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerAliveness {
    NotRegistered,
    /// Registration was received, but the worker is not yet cleared to receive work.
    Registering,
    Alive,
    /// The worker holds buckets but has not been heard from in too long.
    Silent { bucket_ids: Vec<BucketId> },
    /// The worker will never be given work again, until explicitly unblocked.
    Blocked,
}

impl WorkerAliveness {
    pub fn is_blocked(&self) -> bool {
        matches!(self, WorkerAliveness::Blocked)
    }

    pub fn is_silent(&self) -> bool {
        matches!(self, WorkerAliveness::Silent { .. })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RegisterWorkerResponse {
    Registered,
    Blocked { reason: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DequeueBucketResponse {
    Bucket(Bucket),
    /// No bucket is available to this worker right now, but jobs with work are active.
    CheckAgainLater { after: Duration },
    /// No job has work to hand out.
    QueueIsEmpty { after: Duration },
    WorkerBlocked,
    WorkerNotRegistered,
}

/// Why a reported bucket result was not accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// The bucket is not in flight on this queue: it was never dequeued, was reclaimed and
    /// re-run elsewhere, or its result was already accepted.
    BucketNotFound,
    /// The bucket is in flight, but on another worker.
    WorkerDoesNotOwnBucket { owner: WorkerId },
    /// The results mention tests the bucket never asked for.
    ResultsDoNotMatchRequest { unexpected: Vec<TestEntry> },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::BucketNotFound => write!(f, "bucket not found"),
            RejectionReason::WorkerDoesNotOwnBucket { owner } => {
                write!(f, "bucket is owned by worker {owner}")
            }
            RejectionReason::ResultsDoNotMatchRequest { unexpected } => {
                write!(f, "results contain {} unrequested tests", unexpected.len())
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum BucketResultResponse {
    Accepted,
    Rejected(RejectionReason),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResponse {
    Acknowledged,
    WorkerBlocked,
    WorkerNotRegistered,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleTestsResponse {
    Scheduled { number_of_buckets: usize },
    Rejected { reason: String },
}

/// A consistent snapshot of a job: counts and results belong to the same queue revision.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub job_id: JobId,
    pub enqueued_count: usize,
    pub dequeued_count: usize,
    pub results: Vec<TestEntryResult>,
}

impl JobState {
    /// Whether every bucket of the job has had its results accepted.
    pub fn is_depleted(&self) -> bool {
        self.enqueued_count == 0 && self.dequeued_count == 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum JobStateResponse {
    State(JobState),
    NotFound,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DeleteJobResponse {
    Deleted,
    NotFound,
    BucketsStillInFlight {
        enqueued_count: usize,
        dequeued_count: usize,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CancelJobResponse {
    Cancelled { cancelled_in_flight: usize },
    NotFound,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerAlivenessResponse {
    pub aliveness: BTreeMap<WorkerId, WorkerAliveness>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActiveJobsResponse {
    pub job_ids: Vec<JobId>,
}
