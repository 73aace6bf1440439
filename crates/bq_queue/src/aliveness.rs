//! Tracks which workers are registered, which buckets each holds, and whether each has gone
//! quiet for too long.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::{Duration, Instant},
};

use bq_utils::net_protocol::{
    entity::WorkerId, queue::WorkerAliveness, workers::BucketId,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Registering,
    Alive,
    Silent,
    Blocked,
}

#[derive(Debug)]
struct WorkerState {
    status: Status,
    buckets_in_flight: BTreeSet<BucketId>,
    last_activity: Instant,
}

impl WorkerState {
    fn new(status: Status) -> Self {
        Self {
            status,
            buckets_in_flight: Default::default(),
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.status == Status::Silent {
            self.status = Status::Alive;
        }
    }

    fn aliveness(&self) -> WorkerAliveness {
        match self.status {
            Status::Registering => WorkerAliveness::Registering,
            Status::Alive => WorkerAliveness::Alive,
            Status::Silent => WorkerAliveness::Silent {
                bucket_ids: self.buckets_in_flight.iter().cloned().collect(),
            },
            Status::Blocked => WorkerAliveness::Blocked,
        }
    }
}

/// Liveness of every worker the queue has heard of.
///
/// All state sits behind one lock, so each operation on a worker is linearizable with every
/// other operation.
#[derive(Debug)]
pub struct WorkerAlivenessTracker {
    silence_threshold: Duration,
    workers: Mutex<HashMap<WorkerId, WorkerState>>,
}

impl WorkerAlivenessTracker {
    pub fn new(silence_threshold: Duration) -> Self {
        Self {
            silence_threshold,
            workers: Default::default(),
        }
    }

    pub fn silence_threshold(&self) -> Duration {
        self.silence_threshold
    }

    /// Marks the worker alive. Idempotent; a blocked worker stays blocked.
    pub fn register(&self, worker_id: &WorkerId) -> WorkerAliveness {
        let mut workers = self.workers.lock();
        let state = workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerState::new(Status::Alive));
        if state.status != Status::Blocked {
            state.status = Status::Alive;
            state.last_activity = Instant::now();
        }
        state.aliveness()
    }

    /// Records that a registration is underway, but the worker is not yet allowed work.
    pub fn begin_registration(&self, worker_id: &WorkerId) {
        let mut workers = self.workers.lock();
        let state = workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerState::new(Status::Registering));
        if state.status != Status::Blocked {
            state.status = Status::Registering;
        }
    }

    pub fn did_dequeue_bucket(&self, worker_id: &WorkerId, bucket_id: &BucketId) {
        let mut workers = self.workers.lock();
        match workers.get_mut(worker_id) {
            Some(state) => {
                state.buckets_in_flight.insert(bucket_id.clone());
                state.touch();
            }
            None => {
                bq_utils::illegal_state!(
                    "bucket dequeued by unknown worker",
                    %worker_id,
                    %bucket_id
                );
            }
        }
    }

    /// Records that the worker reported results for a bucket it held.
    pub fn did_receive_result(&self, worker_id: &WorkerId, bucket_id: &BucketId) {
        let mut workers = self.workers.lock();
        if let Some(state) = workers.get_mut(worker_id) {
            state.buckets_in_flight.remove(bucket_id);
            state.touch();
        }
    }

    /// Records a sign of life from the worker, such as a heartbeat.
    pub fn set_alive(&self, worker_id: &WorkerId) -> WorkerAliveness {
        let mut workers = self.workers.lock();
        match workers.get_mut(worker_id) {
            Some(state) => {
                state.touch();
                state.aliveness()
            }
            None => WorkerAliveness::NotRegistered,
        }
    }

    /// Blocks the worker from receiving any more work. Buckets it holds stay recorded until
    /// they are reclaimed.
    pub fn block(&self, worker_id: &WorkerId) {
        let mut workers = self.workers.lock();
        workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerState::new(Status::Blocked))
            .status = Status::Blocked;
    }

    pub fn unblock(&self, worker_id: &WorkerId) {
        let mut workers = self.workers.lock();
        if let Some(state) = workers.get_mut(worker_id) {
            if state.status == Status::Blocked {
                state.status = Status::Alive;
                state.last_activity = Instant::now();
            }
        }
    }

    pub fn mark_silent(&self, worker_id: &WorkerId) {
        let mut workers = self.workers.lock();
        if let Some(state) = workers.get_mut(worker_id) {
            if matches!(state.status, Status::Alive | Status::Registering) {
                state.status = Status::Silent;
            }
        }
    }

    /// Marks silent every alive worker that holds buckets and has not been heard from for longer
    /// than the silence threshold, as of `now`. Returns the workers that became silent.
    pub fn mark_silent_workers(&self, now: Instant) -> Vec<WorkerId> {
        let mut workers = self.workers.lock();
        let mut newly_silent = vec![];
        for (worker_id, state) in workers.iter_mut() {
            let quiet_for = now.saturating_duration_since(state.last_activity);
            if state.status == Status::Alive
                && !state.buckets_in_flight.is_empty()
                && quiet_for > self.silence_threshold
            {
                state.status = Status::Silent;
                newly_silent.push(worker_id.clone());
            }
        }
        newly_silent.sort();
        newly_silent
    }

    pub fn aliveness(&self, worker_id: &WorkerId) -> WorkerAliveness {
        self.workers
            .lock()
            .get(worker_id)
            .map(WorkerState::aliveness)
            .unwrap_or(WorkerAliveness::NotRegistered)
    }

    pub fn worker_aliveness(&self) -> BTreeMap<WorkerId, WorkerAliveness> {
        self.workers
            .lock()
            .iter()
            .map(|(worker_id, state)| (worker_id.clone(), state.aliveness()))
            .collect()
    }

    pub fn buckets_in_flight(&self, worker_id: &WorkerId) -> Vec<BucketId> {
        self.workers
            .lock()
            .get(worker_id)
            .map(|state| state.buckets_in_flight.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn number_of_buckets_in_flight(&self, worker_id: &WorkerId) -> usize {
        self.workers
            .lock()
            .get(worker_id)
            .map(|state| state.buckets_in_flight.len())
            .unwrap_or(0)
    }

    /// Forgets that the worker holds a bucket, without counting it as activity. Used when the
    /// queue takes the bucket back.
    pub fn release_bucket(&self, worker_id: &WorkerId, bucket_id: &BucketId) {
        if let Some(state) = self.workers.lock().get_mut(worker_id) {
            state.buckets_in_flight.remove(bucket_id);
        }
    }

    /// Workers that may be handed work: registered and not blocked.
    pub fn usable_workers(&self) -> Vec<WorkerId> {
        let mut usable: Vec<_> = self
            .workers
            .lock()
            .iter()
            .filter(|(_, state)| matches!(state.status, Status::Alive | Status::Silent))
            .map(|(worker_id, _)| worker_id.clone())
            .collect();
        usable.sort();
        usable
    }
}
