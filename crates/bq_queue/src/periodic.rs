//! Background jobs the queue runs on a timer: taking back stuck buckets, and recomputing which
//! workers each job prefers.

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::{Duration, Instant},
};

use bq_utils::{atomic, server_shutdown::ShutdownReceiver};
use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;

use crate::{balancing::BalancingBucketQueue, utilize::WorkersToUtilizeService};

struct ConcurrencyControlledJobInner<F> {
    job_name: &'static str,
    is_active: AtomicBool,
    run: F,
}

/// A job that never runs concurrently with itself: a run that starts while another is active is
/// skipped.
pub struct ConcurrencyControlledJob<F>(Arc<ConcurrencyControlledJobInner<F>>);

impl<F> Clone for ConcurrencyControlledJob<F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<F> ConcurrencyControlledJob<F>
where
    F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    pub fn new(job_name: &'static str, job: F) -> Self {
        Self(Arc::new(ConcurrencyControlledJobInner {
            job_name,
            is_active: AtomicBool::new(false),
            run: job,
        }))
    }

    /// Runs the job, unless a run is already active. Returns whether it ran.
    pub async fn run(&self) -> bool {
        let me = &self.0;

        if me
            .is_active
            .compare_exchange(false, true, atomic::ORDERING, atomic::ORDERING)
            .is_err()
        {
            tracing::debug!(job = me.job_name, "skipping run; previous run still active");
            return false;
        }

        (me.run)().await;

        me.is_active.store(false, atomic::ORDERING);
        true
    }
}

/// Runs `job` every `period` until shutdown. Each tick spawns its run, so a slow run makes
/// later ticks skip rather than pile up.
pub fn spawn_periodic<F>(
    job: ConcurrencyControlledJob<F>,
    period: Duration,
    mut shutdown: ShutdownReceiver,
) -> JoinHandle<()>
where
    F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let job = job.clone();
                    tokio::spawn(async move {
                        job.run().await;
                    });
                }
                _ = shutdown.recv_shutdown_immediately() => {
                    tracing::debug!(job = job.0.job_name, "periodic job stopping");
                    break;
                }
            }
        }
    })
}

/// Marks quiet workers silent and takes back their buckets, and buckets held for too long.
pub fn sweep_job(
    queue: Arc<BalancingBucketQueue>,
) -> ConcurrencyControlledJob<impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static> {
    ConcurrencyControlledJob::new("sweep stuck buckets", move || {
        let queue = queue.clone();
        async move {
            let reclaimed = queue.reclaim_stuck_buckets(Instant::now());
            if !reclaimed.is_empty() {
                tracing::info!(count = reclaimed.len(), "reclaimed stuck buckets");
            }
        }
        .boxed()
    })
}

pub fn rebalance_job(
    queue: Arc<BalancingBucketQueue>,
    service: Arc<dyn WorkersToUtilizeService>,
) -> ConcurrencyControlledJob<impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static> {
    ConcurrencyControlledJob::new("rebalance workers", move || {
        let queue = queue.clone();
        let service = service.clone();
        async move {
            queue.rebalance(service.as_ref());
        }
        .boxed()
    })
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU8},
            Arc,
        },
        time::Duration,
    };

    use bq_utils::{
        atomic,
        net_protocol::{
            entity::WorkerId,
            queue::WorkerAliveness,
            workers::{JobId, JobPriority},
        },
        server_shutdown::ShutdownManager,
    };
    use futures::future::FutureExt;
    use ntest::timeout;

    use super::{spawn_periodic, sweep_job, ConcurrencyControlledJob};
    use crate::{
        aliveness::WorkerAlivenessTracker,
        balancing::{BalancingBucketQueue, DequeueResult},
        events::QueueEventBus,
        test_utils::bucket,
    };

    async fn wait_for_flag(flag: &AtomicBool) {
        while !flag.load(atomic::ORDERING) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn allows_sequential_runs() {
        let count: Arc<AtomicU8> = Default::default();
        let job = {
            let count = count.clone();
            ConcurrencyControlledJob::new("test", move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, atomic::ORDERING);
                }
                .boxed()
            })
        };

        for i in 0..5 {
            assert!(job.run().await);
            assert_eq!(count.load(atomic::ORDERING), i + 1);
        }
    }

    #[tokio::test]
    async fn skips_overlapping_runs() {
        let count: Arc<AtomicU8> = Default::default();
        let started: Arc<AtomicBool> = Default::default();
        let release: Arc<AtomicBool> = Default::default();

        let job = {
            let count = count.clone();
            let started = started.clone();
            let release = release.clone();
            ConcurrencyControlledJob::new("test", move || {
                let count = count.clone();
                let started = started.clone();
                let release = release.clone();
                async move {
                    started.store(true, atomic::ORDERING);
                    count.fetch_add(1, atomic::ORDERING);
                    wait_for_flag(&release).await;
                }
                .boxed()
            })
        };

        let first = {
            let job = job.clone();
            tokio::spawn(async move { job.run().await })
        };
        wait_for_flag(&started).await;

        assert!(!job.run().await);

        release.store(true, atomic::ORDERING);
        assert!(first.await.unwrap());
        assert_eq!(count.load(atomic::ORDERING), 1);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn periodic_sweep_reclaims_and_stops_on_shutdown() {
        let aliveness = Arc::new(WorkerAlivenessTracker::new(Duration::from_millis(20)));
        let queue = Arc::new(BalancingBucketQueue::new(
            Default::default(),
            aliveness,
            QueueEventBus::default(),
        ));
        let quiet = WorkerId::from("quiet");
        queue.register_worker(&quiet);
        queue
            .enqueue(&JobId::from("job"), vec![bucket("b1", &["a"])], JobPriority(0))
            .unwrap();
        assert!(matches!(
            queue.dequeue_bucket(&quiet).unwrap(),
            DequeueResult::Dequeued(..)
        ));

        let (mut shutdown, shutdown_rx) = ShutdownManager::new_pair();
        let handle = spawn_periodic(
            sweep_job(queue.clone()),
            Duration::from_millis(10),
            shutdown_rx,
        );

        while !matches!(
            queue.aliveness().aliveness(&quiet),
            WorkerAliveness::Silent { .. }
        ) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        while queue.job_state(&JobId::from("job")).unwrap().enqueued_count != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.shutdown_immediately().unwrap();
        handle.await.unwrap();
    }
}
