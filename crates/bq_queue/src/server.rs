//! The queue's TCP server, and the [Queue] handle that runs it.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use bq_utils::{
    error::{AnyError, EntityfulError, ErrorEntity, OpaqueResult, ResultLocation},
    here, log_entityful_error,
    net_async::tcp::ServerListener,
    net_protocol::{
        self,
        entity::{Entity, WorkerId},
        queue::{
            ActiveJobsResponse, BucketResultResponse, CancelJobResponse, DeleteJobResponse,
            DequeueBucketResponse, HeartbeatResponse, JobStateResponse, Message,
            RegisterWorkerResponse, Request, ScheduleTestsRequest, ScheduleTestsResponse,
            WorkerAliveness, WorkerAlivenessResponse,
        },
        results::TestingResult,
        workers::JobId,
    },
    server_shutdown::{ShutdownManager, ShutdownReceiver},
};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream, task::JoinHandle};
use tracing::instrument;

use crate::{
    aliveness::WorkerAlivenessTracker,
    balancing::{
        AcceptResult, BalancingBucketQueue, BalancingConfig, CancelJobError, DeleteJobError,
        DequeueError, DequeueResult,
    },
    events::{spawn_event_logger, QueueEventBus},
    periodic::{rebalance_job, spawn_periodic, sweep_job},
    split,
    utilize::WorkersToUtilizeService,
};

/// Configures a [Queue].
#[derive(Clone)]
pub struct QueueConfig {
    pub bind_addr: SocketAddr,
    /// Protocol version workers must report to be given work.
    pub version: String,
    pub balancing: BalancingConfig,
    /// How long a worker holding buckets may go unheard before it is considered silent.
    pub silence_threshold: Duration,
    pub sweep_interval: Duration,
    /// Worker count to split jobs for. When unset, the number of usable registered workers.
    pub number_of_workers_hint: Option<NonZeroUsize>,
    pub rebalance_interval: Duration,
    pub workers_to_utilize: Option<Arc<dyn WorkersToUtilizeService>>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            version: bq_utils::VERSION.to_string(),
            balancing: Default::default(),
            silence_threshold: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            number_of_workers_hint: None,
            rebalance_interval: Duration::from_secs(30),
            workers_to_utilize: None,
        }
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("bind_addr", &self.bind_addr)
            .field("version", &self.version)
            .field("balancing", &self.balancing)
            .field("silence_threshold", &self.silence_threshold)
            .field("sweep_interval", &self.sweep_interval)
            .field("number_of_workers_hint", &self.number_of_workers_hint)
            .field("rebalance_interval", &self.rebalance_interval)
            .field("workers_to_utilize", &self.workers_to_utilize.is_some())
            .finish()
    }
}

/// A running queue: the server and its periodic tasks.
pub struct Queue {
    shutdown_manager: ShutdownManager,

    queue: Arc<BalancingBucketQueue>,

    server_addr: SocketAddr,
    server_handle: Option<JoinHandle<Result<(), ServerError>>>,
    periodic_handles: Vec<JoinHandle<()>>,
    event_logger: JoinHandle<()>,

    active: bool,
}

impl Queue {
    pub async fn start(config: QueueConfig) -> Result<Self, ServerError> {
        let QueueConfig {
            bind_addr,
            version,
            balancing,
            silence_threshold,
            sweep_interval,
            number_of_workers_hint,
            rebalance_interval,
            workers_to_utilize,
        } = config;

        let events = QueueEventBus::default();
        let event_logger = spawn_event_logger(&events);
        let queue = Arc::new(BalancingBucketQueue::new(
            balancing,
            Arc::new(WorkerAlivenessTracker::new(silence_threshold)),
            events,
        ));

        let mut shutdown_manager = ShutdownManager::default();

        let listener = ServerListener::bind(bind_addr).await?;
        let server_addr = listener.local_addr()?;

        let server = QueueServer {
            queue: queue.clone(),
            version,
            number_of_workers_hint,
        };
        let server_handle = tokio::spawn(server.start(listener, shutdown_manager.add_receiver()));

        let mut periodic_handles = vec![spawn_periodic(
            sweep_job(queue.clone()),
            sweep_interval,
            shutdown_manager.add_receiver(),
        )];
        if let Some(service) = workers_to_utilize {
            periodic_handles.push(spawn_periodic(
                rebalance_job(queue.clone(), service),
                rebalance_interval,
                shutdown_manager.add_receiver(),
            ));
        }

        tracing::info!(%server_addr, "queue started");

        Ok(Self {
            shutdown_manager,
            queue,
            server_addr,
            server_handle: Some(server_handle),
            periodic_handles,
            event_logger,
            active: true,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn balancing_queue(&self) -> &Arc<BalancingBucketQueue> {
        &self.queue
    }

    /// A retired queue keeps serving the jobs it has, but refuses new ones.
    #[instrument(level = "trace", skip(self))]
    pub fn retire(&mut self) {
        self.shutdown_manager.retire()
    }

    pub fn is_retired(&self) -> bool {
        self.shutdown_manager.is_retired()
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn shutdown(&mut self) -> Result<(), ServerError> {
        debug_assert!(self.active);

        self.active = false;

        self.shutdown_manager.shutdown_immediately()?;

        for handle in self.periodic_handles.drain(..) {
            handle.await.map_err(AnyError::from)?;
        }
        if let Some(server_handle) = self.server_handle.take() {
            server_handle.await.map_err(AnyError::from)??;
        }
        self.event_logger.abort();

        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if self.active {
            // Never shut down explicitly; signal the tasks and let them wind down on their own.
            let _ = self.shutdown_manager.shutdown_immediately();
            self.event_logger.abort();
        }
    }
}

/// An error in running the queue server itself, as opposed to handling one of its requests.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(#[from] AnyError),
}

struct QueueServer {
    queue: Arc<BalancingBucketQueue>,
    version: String,
    number_of_workers_hint: Option<NonZeroUsize>,
}

#[derive(Clone)]
struct QueueServerCtx {
    queue: Arc<BalancingBucketQueue>,
    version: Arc<str>,
    number_of_workers_hint: Option<NonZeroUsize>,
    retired: bool,
}

impl QueueServer {
    async fn start(
        self,
        listener: ServerListener,
        mut shutdown: ShutdownReceiver,
    ) -> Result<(), ServerError> {
        let Self {
            queue,
            version,
            number_of_workers_hint,
        } = self;
        let version: Arc<str> = version.into();

        loop {
            let stream = tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::error!("error accepting connection to queue: {:?}", e);
                            continue;
                        }
                    }
                }
                _ = shutdown.recv_shutdown_immediately() => {
                    break;
                }
            };

            let ctx = QueueServerCtx {
                queue: queue.clone(),
                version: version.clone(),
                number_of_workers_hint,
                retired: shutdown.is_retired(),
            };
            tokio::spawn(async move {
                let result = Self::handle(ctx, stream).await;
                if let Err(error) = result {
                    log_entityful_error!(error, "error handling connection to queue: {}")
                }
            });
        }

        Ok(())
    }

    async fn handle(ctx: QueueServerCtx, mut stream: TcpStream) -> Result<(), EntityfulError> {
        let Request { entity, message } = net_protocol::async_read(&mut stream)
            .await
            .located(here!())
            .no_entity()?;

        let result: OpaqueResult<()> = match message {
            Message::HealthCheck => Self::handle_healthcheck(&entity, &mut stream).await,
            Message::RegisterWorker { worker_id, version } => {
                Self::handle_register_worker(&ctx, &entity, worker_id, version, &mut stream).await
            }
            Message::DequeueBucket { worker_id } => {
                Self::handle_dequeue_bucket(&ctx, &entity, worker_id, &mut stream).await
            }
            Message::BucketResult {
                worker_id,
                testing_result,
            } => {
                Self::handle_bucket_result(&ctx, &entity, worker_id, testing_result, &mut stream)
                    .await
            }
            Message::Heartbeat { worker_id } => {
                Self::handle_heartbeat(&ctx, &entity, worker_id, &mut stream).await
            }
            Message::ScheduleTests(request) => {
                Self::handle_schedule_tests(&ctx, &entity, request, &mut stream).await
            }
            Message::JobState(job_id) => {
                Self::handle_job_state(&ctx, &entity, job_id, &mut stream).await
            }
            Message::DeleteJob(job_id) => {
                Self::handle_delete_job(&ctx, &entity, job_id, &mut stream).await
            }
            Message::CancelJob(job_id) => {
                Self::handle_cancel_job(&ctx, &entity, job_id, &mut stream).await
            }
            Message::WorkerAliveness => {
                Self::handle_worker_aliveness(&ctx, &entity, &mut stream).await
            }
            Message::ActiveJobs => Self::handle_active_jobs(&ctx, &entity, &mut stream).await,
        };

        // The peer may hang up without a FIN ACK.
        let _shutdown = stream.shutdown().await;

        result.entity(&entity)
    }

    #[instrument(level = "trace", skip(stream))]
    async fn handle_healthcheck(entity: &Entity, stream: &mut TcpStream) -> OpaqueResult<()> {
        net_protocol::async_write(stream, &net_protocol::health::healthy())
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_register_worker(
        ctx: &QueueServerCtx,
        entity: &Entity,
        worker_id: WorkerId,
        version: String,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let aliveness = ctx.queue.aliveness();
        aliveness.begin_registration(&worker_id);

        let response = if version != *ctx.version {
            let reason = format!(
                "worker version {} does not match queue version {}",
                version, ctx.version
            );
            ctx.queue.block_worker(&worker_id, reason.clone());
            RegisterWorkerResponse::Blocked { reason }
        } else {
            match ctx.queue.register_worker(&worker_id) {
                WorkerAliveness::Blocked => RegisterWorkerResponse::Blocked {
                    reason: "worker is blocked".to_string(),
                },
                _ => {
                    tracing::info!(%worker_id, "worker registered");
                    RegisterWorkerResponse::Registered
                }
            }
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_dequeue_bucket(
        ctx: &QueueServerCtx,
        entity: &Entity,
        worker_id: WorkerId,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let response = match ctx.queue.dequeue_bucket(&worker_id) {
            Ok(DequeueResult::Dequeued(dequeued)) => {
                DequeueBucketResponse::Bucket(dequeued.enqueued_bucket.bucket)
            }
            Ok(DequeueResult::CheckAgainLater(after)) => {
                DequeueBucketResponse::CheckAgainLater { after }
            }
            Ok(DequeueResult::QueueIsEmpty(after)) => DequeueBucketResponse::QueueIsEmpty { after },
            Err(DequeueError::WorkerBlocked(_)) => DequeueBucketResponse::WorkerBlocked,
            Err(DequeueError::WorkerNotRegistered(_)) => DequeueBucketResponse::WorkerNotRegistered,
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, testing_result, stream), fields(bucket_id = %testing_result.bucket_id))]
    async fn handle_bucket_result(
        ctx: &QueueServerCtx,
        entity: &Entity,
        worker_id: WorkerId,
        testing_result: TestingResult,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let bucket_id = testing_result.bucket_id.clone();
        let response = match ctx.queue.accept(&bucket_id, &worker_id, testing_result) {
            AcceptResult::Accepted { .. } => BucketResultResponse::Accepted,
            AcceptResult::Rejected(reason) => BucketResultResponse::Rejected(reason),
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_heartbeat(
        ctx: &QueueServerCtx,
        entity: &Entity,
        worker_id: WorkerId,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let response = match ctx.queue.heartbeat(&worker_id) {
            WorkerAliveness::Blocked => HeartbeatResponse::WorkerBlocked,
            WorkerAliveness::NotRegistered => HeartbeatResponse::WorkerNotRegistered,
            _ => HeartbeatResponse::Acknowledged,
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, request, stream), fields(job_id = %request.job_id))]
    async fn handle_schedule_tests(
        ctx: &QueueServerCtx,
        entity: &Entity,
        request: ScheduleTestsRequest,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let response = Self::schedule_tests(ctx, request);

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    fn schedule_tests(ctx: &QueueServerCtx, request: ScheduleTestsRequest) -> ScheduleTestsResponse {
        let ScheduleTestsRequest {
            job_id,
            priority,
            strategy,
            tests,
        } = request;

        if ctx.retired {
            return ScheduleTestsResponse::Rejected {
                reason: "queue is retired and accepts no new jobs".to_string(),
            };
        }

        let number_of_workers = match ctx.number_of_workers_hint {
            Some(hint) => hint.get(),
            None => ctx.queue.aliveness().usable_workers().len().max(1),
        };

        let buckets = match split::split(&job_id, &tests, strategy, number_of_workers) {
            Ok(buckets) => buckets,
            Err(e) => {
                return ScheduleTestsResponse::Rejected {
                    reason: e.to_string(),
                }
            }
        };
        let number_of_buckets = buckets.len();

        match ctx.queue.enqueue(&job_id, buckets, priority) {
            Ok(()) => {
                tracing::info!(
                    %job_id,
                    %strategy,
                    number_of_tests = tests.len(),
                    number_of_buckets,
                    number_of_workers,
                    "scheduled tests"
                );
                ScheduleTestsResponse::Scheduled { number_of_buckets }
            }
            Err(e) => ScheduleTestsResponse::Rejected {
                reason: e.to_string(),
            },
        }
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_job_state(
        ctx: &QueueServerCtx,
        entity: &Entity,
        job_id: JobId,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let response = match ctx.queue.job_state(&job_id) {
            Some(state) => JobStateResponse::State(state),
            None => JobStateResponse::NotFound,
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_delete_job(
        ctx: &QueueServerCtx,
        entity: &Entity,
        job_id: JobId,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let response = match ctx.queue.delete_job(&job_id) {
            Ok(()) => DeleteJobResponse::Deleted,
            Err(DeleteJobError::NotFound(_)) => DeleteJobResponse::NotFound,
            Err(DeleteJobError::BucketsStillInFlight {
                enqueued_count,
                dequeued_count,
                ..
            }) => DeleteJobResponse::BucketsStillInFlight {
                enqueued_count,
                dequeued_count,
            },
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_cancel_job(
        ctx: &QueueServerCtx,
        entity: &Entity,
        job_id: JobId,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let response = match ctx.queue.cancel_job(&job_id) {
            Ok(cancelled) => CancelJobResponse::Cancelled {
                cancelled_in_flight: cancelled.len(),
            },
            Err(CancelJobError::NotFound(_)) => CancelJobResponse::NotFound,
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_worker_aliveness(
        ctx: &QueueServerCtx,
        entity: &Entity,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let response = WorkerAlivenessResponse {
            aliveness: ctx.queue.worker_aliveness(),
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_active_jobs(
        ctx: &QueueServerCtx,
        entity: &Entity,
        stream: &mut TcpStream,
    ) -> OpaqueResult<()> {
        let response = ActiveJobsResponse {
            job_ids: ctx.queue.job_ids(),
        };

        net_protocol::async_write(stream, &response)
            .await
            .located(here!())
    }
}
