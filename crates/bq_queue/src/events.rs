//! What happens on the queue, for anyone who wants to watch.

use bq_utils::{
    event_bus::EventBus,
    net_protocol::{
        entity::WorkerId,
        queue::RejectionReason,
        workers::{BucketId, JobId},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    JobEnqueued {
        job_id: JobId,
        number_of_buckets: usize,
    },
    BucketDequeued {
        job_id: JobId,
        bucket_id: BucketId,
        worker_id: WorkerId,
    },
    ResultAccepted {
        job_id: JobId,
        bucket_id: BucketId,
        worker_id: WorkerId,
        retry_bucket: Option<BucketId>,
    },
    ResultRejected {
        bucket_id: BucketId,
        worker_id: WorkerId,
        reason: RejectionReason,
    },
    BucketReclaimed {
        job_id: JobId,
        bucket_id: BucketId,
        worker_id: WorkerId,
    },
    /// A job was cancelled while the bucket was in flight; its worker's result will be rejected.
    BucketCancelled {
        job_id: JobId,
        bucket_id: BucketId,
        worker_id: WorkerId,
    },
    WorkerSilent {
        worker_id: WorkerId,
    },
    WorkerBlocked {
        worker_id: WorkerId,
        reason: String,
    },
    JobDeleted {
        job_id: JobId,
    },
    JobCancelled {
        job_id: JobId,
    },
}

pub type QueueEventBus = EventBus<QueueEvent>;

pub fn log_queue_event(event: &QueueEvent) {
    match event {
        QueueEvent::JobEnqueued {
            job_id,
            number_of_buckets,
        } => tracing::info!(%job_id, number_of_buckets, "job enqueued"),
        QueueEvent::BucketDequeued {
            job_id,
            bucket_id,
            worker_id,
        } => tracing::debug!(%job_id, %bucket_id, %worker_id, "bucket dequeued"),
        QueueEvent::ResultAccepted {
            job_id,
            bucket_id,
            worker_id,
            retry_bucket,
        } => tracing::debug!(
            %job_id,
            %bucket_id,
            %worker_id,
            ?retry_bucket,
            "bucket result accepted"
        ),
        QueueEvent::ResultRejected {
            bucket_id,
            worker_id,
            reason,
        } => tracing::warn!(%bucket_id, %worker_id, %reason, "bucket result rejected"),
        QueueEvent::BucketReclaimed {
            job_id,
            bucket_id,
            worker_id,
        } => tracing::warn!(%job_id, %bucket_id, %worker_id, "bucket reclaimed"),
        QueueEvent::BucketCancelled {
            job_id,
            bucket_id,
            worker_id,
        } => tracing::info!(%job_id, %bucket_id, %worker_id, "in-flight bucket cancelled"),
        QueueEvent::WorkerSilent { worker_id } => {
            tracing::warn!(%worker_id, "worker went silent")
        }
        QueueEvent::WorkerBlocked { worker_id, reason } => {
            tracing::warn!(%worker_id, %reason, "worker blocked")
        }
        QueueEvent::JobDeleted { job_id } => tracing::info!(%job_id, "job deleted"),
        QueueEvent::JobCancelled { job_id } => tracing::info!(%job_id, "job cancelled"),
    }
}

/// Logs every event posted to `bus` until the bus goes away.
pub fn spawn_event_logger(bus: &QueueEventBus) -> tokio::task::JoinHandle<()> {
    bq_utils::event_bus::spawn_subscriber(bus, |event| log_queue_event(&event))
}
