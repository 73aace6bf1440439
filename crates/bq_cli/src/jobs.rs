use std::{fs, net::SocketAddr, path::Path};

use anyhow::{bail, Context};
use bq_queue::client::{QueueClient, DEFAULT_WAIT_DECAY};
use bq_utils::{
    exit::ExitCode,
    net_protocol::{
        queue::{
            DeleteJobResponse, JobState, JobStateResponse, ScheduleStrategyType,
            ScheduleTestsRequest, ScheduleTestsResponse,
        },
        results::TestEntryResult,
        workers::{ConfiguredTestEntry, JobId, JobPriority},
    },
};

pub struct SubmitOptions<'a> {
    pub queue_addr: SocketAddr,
    pub job_id: JobId,
    pub priority: JobPriority,
    pub strategy: ScheduleStrategyType,
    pub tests: &'a Path,
    pub wait: bool,
}

pub fn read_tests(path: &Path) -> anyhow::Result<Vec<ConfiguredTestEntry>> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("could not read tests from {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("invalid tests in {}", path.display()))
}

pub async fn submit(options: SubmitOptions<'_>) -> anyhow::Result<ExitCode> {
    let tests = read_tests(options.tests)?;
    let job_id = options.job_id;
    let client = QueueClient::for_client(options.queue_addr);

    let request = ScheduleTestsRequest {
        job_id: job_id.clone(),
        priority: options.priority,
        strategy: options.strategy,
        tests,
    };
    match client.schedule_tests(request).await? {
        ScheduleTestsResponse::Scheduled { number_of_buckets } => {
            println!("Scheduled job {job_id} as {number_of_buckets} buckets");
        }
        ScheduleTestsResponse::Rejected { reason } => {
            bail!("queue rejected job {job_id}: {reason}")
        }
    }

    if !options.wait {
        return Ok(ExitCode::SUCCESS);
    }

    let state = client.wait_for_job(&job_id, DEFAULT_WAIT_DECAY, None).await?;
    for result in &state.results {
        println!("{}", format_result(result));
    }
    println!("{}", summary_line(&state));

    match client.delete_job(&job_id).await? {
        DeleteJobResponse::Deleted => {}
        other => tracing::warn!(?other, %job_id, "could not delete finished job"),
    }

    Ok(exit_code(&state))
}

pub async fn status(queue_addr: SocketAddr, job_id: JobId) -> anyhow::Result<ExitCode> {
    let client = QueueClient::for_client(queue_addr);
    match client.job_state(&job_id).await? {
        JobStateResponse::State(state) => {
            println!("{}", summary_line(&state));
            Ok(ExitCode::SUCCESS)
        }
        JobStateResponse::NotFound => bail!("job {job_id} not found"),
    }
}

pub async fn aliveness(queue_addr: SocketAddr) -> anyhow::Result<ExitCode> {
    let client = QueueClient::for_client(queue_addr);
    for (worker_id, aliveness) in client.worker_aliveness().await? {
        println!("{worker_id}\t{}", serde_json::to_string(&aliveness)?);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn format_result(result: &TestEntryResult) -> String {
    let status = if result.succeeded() { "PASS" } else { "FAIL" };
    let mut line = format!("{status} {}", result.test_entry);
    if result.test_run_results.len() > 1 {
        line.push_str(&format!(" ({} runs)", result.test_run_results.len()));
    }
    if !result.succeeded() {
        let reason = result
            .test_run_results
            .last()
            .and_then(|run| run.exceptions.first())
            .map(|exception| exception.reason.as_str());
        if let Some(reason) = reason {
            line.push_str(&format!(": {reason}"));
        }
    }
    line
}

pub fn summary_line(state: &JobState) -> String {
    let failed = state.results.iter().filter(|r| !r.succeeded()).count();
    format!(
        "job {}: {} results ({} failed), {} buckets enqueued, {} in flight",
        state.job_id,
        state.results.len(),
        failed,
        state.enqueued_count,
        state.dequeued_count
    )
}

fn exit_code(state: &JobState) -> ExitCode {
    if state.results.iter().all(TestEntryResult::succeeded) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
