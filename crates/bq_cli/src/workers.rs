use std::{net::SocketAddr, num::NonZeroUsize, sync::Arc};

use bq_utils::{
    exit::ExitCode, net_protocol::entity::WorkerId, server_shutdown::ShutdownManager,
};
use bq_workers::{
    command_runner::CommandRunner,
    dist_worker::{DistWorker, DistWorkerExit},
    runner::{spawn_event_logger, TestRunner},
    test_like_runner::EchoRunner,
};

use crate::{config::WorkerConfig, instance::wait_for_termination};

pub struct WorkOptions {
    pub queue_addr: SocketAddr,
    pub worker_id: Option<String>,
    pub num_workers: NonZeroUsize,
    pub exit_when_queue_empty: bool,
    pub runner_command: Vec<String>,
}

pub fn worker_ids(base: &WorkerId, num_workers: NonZeroUsize) -> Vec<WorkerId> {
    if num_workers.get() == 1 {
        return vec![base.clone()];
    }
    (0..num_workers.get())
        .map(|i| WorkerId::new(format!("{base}-{i}")))
        .collect()
}

/// Runs workers until they all exit, or a termination signal arrives.
pub async fn start_workers(options: WorkOptions, config: &WorkerConfig) -> anyhow::Result<ExitCode> {
    let runner: Arc<dyn TestRunner> = match CommandRunner::from_command_line(&options.runner_command) {
        Some(runner) => Arc::new(runner),
        None => {
            tracing::warn!("no runner command given; every test will pass");
            Arc::new(EchoRunner)
        }
    };

    let base_id = options
        .worker_id
        .or_else(|| config.worker_id.clone())
        .map(WorkerId::new)
        .unwrap_or_else(WorkerId::unique);

    let (mut shutdown, _) = ShutdownManager::new_pair();
    let mut handles = vec![];
    for worker_id in worker_ids(&base_id, options.num_workers) {
        let mut worker_config = config.to_dist_worker_config(options.queue_addr, worker_id);
        worker_config.exit_when_queue_empty |= options.exit_when_queue_empty;

        let worker = DistWorker::new(worker_config, runner.clone());
        let event_logger = spawn_event_logger(worker.events());
        let shutdown_rx = shutdown.add_receiver();
        handles.push(tokio::spawn(async move {
            let result = worker.run(shutdown_rx).await;
            event_logger.abort();
            result
        }));
    }
    tracing::info!(count = handles.len(), queue_addr = %options.queue_addr, "workers started");

    let all_workers = futures::future::join_all(handles);
    tokio::pin!(all_workers);

    let results = tokio::select! {
        results = &mut all_workers => results,
        signal = wait_for_termination() => {
            signal?;
            if let Err(error) = shutdown.shutdown_immediately() {
                tracing::debug!(%error, "workers already stopped");
            }
            all_workers.await
        }
    };

    let mut exit_code = ExitCode::SUCCESS;
    for result in results {
        match result {
            Ok(Ok(DistWorkerExit::QueueEmpty | DistWorkerExit::Shutdown)) => {}
            Ok(Err(error)) => {
                tracing::error!(%error, "worker failed");
                exit_code = ExitCode::BQ_ERROR;
            }
            Err(error) => {
                tracing::error!(%error, "worker task panicked");
                exit_code = ExitCode::BQ_ERROR;
            }
        }
    }
    Ok(exit_code)
}

#[cfg(test)]
mod test {
    use std::num::NonZeroUsize;

    use bq_utils::net_protocol::entity::WorkerId;

    use super::worker_ids;

    #[test]
    fn single_worker_keeps_its_id() {
        assert_eq!(
            worker_ids(&WorkerId::from("mac"), NonZeroUsize::MIN),
            [WorkerId::from("mac")]
        );
    }

    #[test]
    fn many_workers_are_numbered() {
        assert_eq!(
            worker_ids(&WorkerId::from("mac"), NonZeroUsize::new(3).unwrap()),
            [
                WorkerId::from("mac-0"),
                WorkerId::from("mac-1"),
                WorkerId::from("mac-2")
            ]
        );
    }
}
