//! A worker that pulls buckets from a queue until there is nothing left, or it is told to stop.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use bq_queue::client::{ClientError, QueueClient};
use bq_utils::{
    decay::ExpDecay,
    net_protocol::{
        entity::WorkerId,
        queue::{BucketResultResponse, DequeueBucketResponse, HeartbeatResponse, RegisterWorkerResponse},
        results::TestingResult,
        workers::Bucket,
    },
    retry::async_retry_n,
    server_shutdown::ShutdownReceiver,
};
use thiserror::Error;
use tracing::instrument;

use crate::runner::{Runner, RunnerEventBus, TestContext, TestRunner};

#[derive(Debug, Clone)]
pub struct DistWorkerConfig {
    pub queue_addr: SocketAddr,
    pub worker_id: WorkerId,
    /// Protocol version reported on registration.
    pub version: String,
    pub host_name: String,
    /// How often the queue hears from this worker while a bucket runs.
    pub heartbeat_interval: Duration,
    /// Stop once the queue reports it has no work at all, rather than polling for more.
    pub exit_when_queue_empty: bool,
    /// Waits between polls while the queue has nothing for this worker. Capped by the wait the
    /// queue asks for.
    pub check_again_decay: ExpDecay,
    pub network_retry_attempts: usize,
    pub network_retry_decay: ExpDecay,
}

impl DistWorkerConfig {
    pub fn new(queue_addr: SocketAddr, worker_id: WorkerId) -> Self {
        Self {
            queue_addr,
            worker_id,
            version: bq_utils::VERSION.to_string(),
            host_name: "localhost".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            exit_when_queue_empty: false,
            check_again_decay: ExpDecay::quadratic(
                Duration::from_millis(100),
                Duration::from_secs(10),
            ),
            network_retry_attempts: 3,
            network_retry_decay: ExpDecay::quadratic(
                Duration::from_millis(200),
                Duration::from_secs(2),
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum DistWorkerError {
    #[error("worker was blocked by the queue: {reason}")]
    Blocked { reason: String },

    #[error("{0}")]
    Client(#[from] ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistWorkerExit {
    QueueEmpty,
    Shutdown,
}

pub struct DistWorker {
    config: DistWorkerConfig,
    client: QueueClient,
    runner: Runner,
    events: RunnerEventBus,
}

impl DistWorker {
    pub fn new(config: DistWorkerConfig, test_runner: Arc<dyn TestRunner>) -> Self {
        let client = QueueClient::for_worker(config.queue_addr, config.worker_id.clone());
        let events = RunnerEventBus::default();
        Self {
            config,
            client,
            runner: Runner::new(test_runner, events.clone()),
            events,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn events(&self) -> &RunnerEventBus {
        &self.events
    }

    #[instrument(level = "debug", skip_all, fields(worker_id = %self.config.worker_id))]
    pub async fn run(&self, mut shutdown: ShutdownReceiver) -> Result<DistWorkerExit, DistWorkerError> {
        tokio::select! {
            result = self.work_loop() => result,
            _ = shutdown.recv_shutdown_immediately() => {
                tracing::info!("worker shutting down");
                Ok(DistWorkerExit::Shutdown)
            }
        }
    }

    async fn work_loop(&self) -> Result<DistWorkerExit, DistWorkerError> {
        self.register().await?;

        let worker_id = &self.config.worker_id;
        let mut backoff = self.config.check_again_decay;
        loop {
            let response = self
                .with_retries(|| self.client.dequeue_bucket(worker_id))
                .await?;

            match response {
                DequeueBucketResponse::Bucket(bucket) => {
                    backoff.reset();
                    self.run_bucket(bucket).await?;
                }
                DequeueBucketResponse::CheckAgainLater { after } => {
                    tokio::time::sleep(backoff.next_duration().min(after)).await;
                }
                DequeueBucketResponse::QueueIsEmpty { after } => {
                    if self.config.exit_when_queue_empty {
                        tracing::info!("queue is empty; exiting");
                        return Ok(DistWorkerExit::QueueEmpty);
                    }
                    tokio::time::sleep(backoff.next_duration().min(after)).await;
                }
                DequeueBucketResponse::WorkerBlocked => {
                    return Err(DistWorkerError::Blocked {
                        reason: "blocked while dequeueing".to_string(),
                    });
                }
                DequeueBucketResponse::WorkerNotRegistered => {
                    tracing::warn!("queue does not know this worker; registering again");
                    self.register().await?;
                }
            }
        }
    }

    async fn register(&self) -> Result<(), DistWorkerError> {
        let response = self
            .with_retries(|| {
                self.client
                    .register_worker(&self.config.worker_id, &self.config.version)
            })
            .await?;

        match response {
            RegisterWorkerResponse::Registered => {
                tracing::info!(queue_addr = %self.config.queue_addr, "registered with queue");
                Ok(())
            }
            RegisterWorkerResponse::Blocked { reason } => Err(DistWorkerError::Blocked { reason }),
        }
    }

    #[instrument(level = "debug", skip_all, fields(bucket_id = %bucket.bucket_id))]
    async fn run_bucket(&self, bucket: Bucket) -> Result<(), DistWorkerError> {
        let context = TestContext {
            environment: bucket
                .configuration
                .test_execution_behavior
                .environment
                .clone(),
            test_destination: bucket.configuration.test_destination.clone(),
            host_name: self.config.host_name.clone(),
            simulator_id: self.config.worker_id.to_string(),
        };

        let run = self.runner.run(&bucket.test_entries, &context);
        tokio::pin!(run);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        // The first tick completes immediately.
        heartbeat.tick().await;

        let run_result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = heartbeat.tick() => self.heartbeat().await?,
            }
        };

        let testing_result = TestingResult {
            bucket_id: bucket.bucket_id.clone(),
            test_destination: bucket.configuration.test_destination.clone(),
            unfiltered_results: run_result.test_entry_results,
        };
        let response = self
            .with_retries(|| {
                self.client
                    .send_bucket_result(&self.config.worker_id, testing_result.clone())
            })
            .await?;

        match response {
            BucketResultResponse::Accepted => {
                tracing::debug!("bucket result accepted");
            }
            BucketResultResponse::Rejected(reason) => {
                tracing::warn!(?reason, "queue rejected bucket result");
            }
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), DistWorkerError> {
        match self.client.heartbeat(&self.config.worker_id).await {
            Ok(HeartbeatResponse::Acknowledged) => Ok(()),
            Ok(HeartbeatResponse::WorkerBlocked) => Err(DistWorkerError::Blocked {
                reason: "blocked while running a bucket".to_string(),
            }),
            Ok(HeartbeatResponse::WorkerNotRegistered) => {
                tracing::warn!("heartbeat from unregistered worker");
                Ok(())
            }
            // A missed heartbeat is not fatal; the next one may get through.
            Err(error) => {
                tracing::warn!(%error, "failed to send heartbeat");
                Ok(())
            }
        }
    }

    async fn with_retries<T, F, Fut>(&self, request: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        async_retry_n(
            self.config.network_retry_attempts,
            self.config.network_retry_decay,
            |_attempt| request(),
        )
        .await
    }
}
