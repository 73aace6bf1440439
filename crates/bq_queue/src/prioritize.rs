//! Decides which job a worker's next bucket comes from.

use std::cmp::Ordering;

use bq_utils::net_protocol::workers::{JobId, JobPriority};

/// What the balancing queue knows about a job with work to hand out, from the point of view of
/// the worker asking for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCandidate {
    pub job_id: JobId,
    pub priority: JobPriority,
    pub dequeued_count: usize,
    pub enqueued_count: usize,
    /// Whether the job's workers-to-utilize list names the asking worker.
    pub worker_is_preferred: bool,
    /// Order in which the job was first enqueued on this queue.
    pub sequence: u64,
}

/// Orders candidate jobs; the job that sorts first is asked for a bucket first.
pub trait JobPrioritizer: Send + Sync {
    fn compare(&self, left: &JobCandidate, right: &JobCandidate) -> Ordering;
}

/// Higher priority first, then jobs that prefer the asking worker, then the job with the fewest
/// buckets in flight, then the oldest job.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityThenFairness;

impl JobPrioritizer for PriorityThenFairness {
    fn compare(&self, left: &JobCandidate, right: &JobCandidate) -> Ordering {
        right
            .priority
            .cmp(&left.priority)
            .then_with(|| right.worker_is_preferred.cmp(&left.worker_is_preferred))
            .then_with(|| left.dequeued_count.cmp(&right.dequeued_count))
            .then_with(|| left.sequence.cmp(&right.sequence))
    }
}

pub fn order_candidates(prioritizer: &dyn JobPrioritizer, candidates: &mut [JobCandidate]) {
    candidates.sort_by(|left, right| prioritizer.compare(left, right));
}

#[cfg(test)]
mod test {
    use bq_utils::net_protocol::workers::{JobId, JobPriority};

    use super::{order_candidates, JobCandidate, PriorityThenFairness};

    fn candidate(id: &str, priority: u32, dequeued: usize, sequence: u64) -> JobCandidate {
        JobCandidate {
            job_id: JobId::from(id),
            priority: JobPriority(priority),
            dequeued_count: dequeued,
            enqueued_count: 10,
            worker_is_preferred: false,
            sequence,
        }
    }

    fn ordered(mut candidates: Vec<JobCandidate>) -> Vec<String> {
        order_candidates(&PriorityThenFairness, &mut candidates);
        candidates
            .into_iter()
            .map(|c| c.job_id.to_string())
            .collect()
    }

    #[test]
    fn priority_wins() {
        let order = ordered(vec![
            candidate("low", 1, 0, 0),
            candidate("high", 5, 100, 1),
        ]);
        assert_eq!(order, ["high", "low"]);
    }

    #[test]
    fn fewest_in_flight_wins_at_equal_priority() {
        let order = ordered(vec![
            candidate("busy", 1, 4, 0),
            candidate("idle", 1, 1, 1),
        ]);
        assert_eq!(order, ["idle", "busy"]);
    }

    #[test]
    fn oldest_job_breaks_ties() {
        let order = ordered(vec![candidate("new", 1, 2, 7), candidate("old", 1, 2, 3)]);
        assert_eq!(order, ["old", "new"]);
    }

    #[test]
    fn preferred_worker_beats_fairness() {
        let mut preferred = candidate("preferred", 1, 9, 1);
        preferred.worker_is_preferred = true;
        let order = ordered(vec![candidate("other", 1, 0, 0), preferred]);
        assert_eq!(order, ["preferred", "other"]);
    }
}
