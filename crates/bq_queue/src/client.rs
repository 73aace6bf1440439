//! Talks to a queue server: one connection per request.

use std::{collections::BTreeMap, io, net::SocketAddr, time::Duration};

use bq_utils::{
    decay::ExpDecay,
    net_async::tcp::ConfiguredClient,
    net_protocol::{
        self,
        entity::{Entity, WorkerId},
        health::Health,
        queue::{
            ActiveJobsResponse, BucketResultResponse, CancelJobResponse, DeleteJobResponse,
            DequeueBucketResponse, HeartbeatResponse, JobState, JobStateResponse, Message,
            RegisterWorkerResponse, Request, ScheduleTestsRequest, ScheduleTestsResponse,
            WorkerAliveness, WorkerAlivenessResponse,
        },
        results::TestingResult,
        workers::JobId,
    },
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::Instant;

/// Polling backoff of [QueueClient::wait_for_job].
pub const DEFAULT_WAIT_DECAY: ExpDecay =
    ExpDecay::quadratic(Duration::from_millis(50), Duration::from_secs(2));

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("timed out waiting for job {0}")]
    Timeout(JobId),
}

#[derive(Debug, Clone)]
pub struct QueueClient {
    client: ConfiguredClient,
    entity: Entity,
}

impl QueueClient {
    pub fn new(queue_addr: SocketAddr, entity: Entity) -> Self {
        Self {
            client: ConfiguredClient::new(queue_addr),
            entity,
        }
    }

    pub fn for_worker(queue_addr: SocketAddr, worker_id: WorkerId) -> Self {
        Self::new(queue_addr, Entity::Worker(worker_id))
    }

    pub fn for_client(queue_addr: SocketAddr) -> Self {
        Self::new(queue_addr, Entity::client())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.with_connect_timeout(timeout);
        self
    }

    pub fn queue_addr(&self) -> SocketAddr {
        self.client.addr()
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    async fn request<T: DeserializeOwned>(&self, message: Message) -> Result<T, ClientError> {
        let mut conn = self.client.connect().await?;
        let request = Request {
            entity: self.entity.clone(),
            message,
        };
        net_protocol::async_write(&mut conn, &request).await?;
        let response = net_protocol::async_read(&mut conn).await?;
        Ok(response)
    }

    pub async fn health_check(&self) -> Result<Health, ClientError> {
        self.request(Message::HealthCheck).await
    }

    pub async fn register_worker(
        &self,
        worker_id: &WorkerId,
        version: &str,
    ) -> Result<RegisterWorkerResponse, ClientError> {
        self.request(Message::RegisterWorker {
            worker_id: worker_id.clone(),
            version: version.to_string(),
        })
        .await
    }

    pub async fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
    ) -> Result<DequeueBucketResponse, ClientError> {
        self.request(Message::DequeueBucket {
            worker_id: worker_id.clone(),
        })
        .await
    }

    pub async fn send_bucket_result(
        &self,
        worker_id: &WorkerId,
        testing_result: TestingResult,
    ) -> Result<BucketResultResponse, ClientError> {
        self.request(Message::BucketResult {
            worker_id: worker_id.clone(),
            testing_result,
        })
        .await
    }

    pub async fn heartbeat(&self, worker_id: &WorkerId) -> Result<HeartbeatResponse, ClientError> {
        self.request(Message::Heartbeat {
            worker_id: worker_id.clone(),
        })
        .await
    }

    pub async fn schedule_tests(
        &self,
        request: ScheduleTestsRequest,
    ) -> Result<ScheduleTestsResponse, ClientError> {
        self.request(Message::ScheduleTests(request)).await
    }

    pub async fn job_state(&self, job_id: &JobId) -> Result<JobStateResponse, ClientError> {
        self.request(Message::JobState(job_id.clone())).await
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<DeleteJobResponse, ClientError> {
        self.request(Message::DeleteJob(job_id.clone())).await
    }

    pub async fn cancel_job(&self, job_id: &JobId) -> Result<CancelJobResponse, ClientError> {
        self.request(Message::CancelJob(job_id.clone())).await
    }

    pub async fn worker_aliveness(
        &self,
    ) -> Result<BTreeMap<WorkerId, WorkerAliveness>, ClientError> {
        let WorkerAlivenessResponse { aliveness } =
            self.request(Message::WorkerAliveness).await?;
        Ok(aliveness)
    }

    pub async fn active_jobs(&self) -> Result<Vec<JobId>, ClientError> {
        let ActiveJobsResponse { job_ids } = self.request(Message::ActiveJobs).await?;
        Ok(job_ids)
    }

    /// Polls the job's state until every bucket's results are in, or `timeout` passes.
    pub async fn wait_for_job(
        &self,
        job_id: &JobId,
        mut decay: ExpDecay,
        timeout: Option<Duration>,
    ) -> Result<JobState, ClientError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let state = match self.job_state(job_id).await? {
                JobStateResponse::State(state) => state,
                JobStateResponse::NotFound => return Err(ClientError::JobNotFound(job_id.clone())),
            };
            if state.is_depleted() {
                return Ok(state);
            }

            let wait = decay.next_duration();
            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    return Err(ClientError::Timeout(job_id.clone()));
                }
            }
            tracing::trace!(
                %job_id,
                enqueued_count = state.enqueued_count,
                dequeued_count = state.dequeued_count,
                "job not done yet"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
