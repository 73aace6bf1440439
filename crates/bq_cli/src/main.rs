mod args;
mod config;
mod instance;
mod jobs;
mod logging;
mod workers;

use std::net::SocketAddr;

use anyhow::anyhow;
use bq_utils::{
    exit::ExitCode,
    net_protocol::workers::{JobId, JobPriority},
};
use clap::Parser;

use args::{Cli, Command};
use config::BqConfig;

fn main() {
    let cli = Cli::parse();

    let exit_code = match run(cli) {
        Ok(exit_code) => exit_code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::BQ_ERROR
        }
    };
    std::process::exit(exit_code.get());
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let _logging = logging::init(cli.log_format, cli.log_file.as_deref())?;
    let config = config::load(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(dispatch(cli.command, config));
    if let Err(error) = &result {
        tracing::error!("{error:#}");
    }
    result
}

async fn dispatch(command: Command, config: BqConfig) -> anyhow::Result<ExitCode> {
    match command {
        Command::Start {
            bind,
            number_of_workers,
            max_buckets_per_worker,
        } => {
            let mut queue_config = config.queue;
            if let Some(bind) = bind {
                queue_config.bind = bind;
            }
            if number_of_workers.is_some() {
                queue_config.number_of_workers_hint = number_of_workers;
            }
            if let Some(max) = max_buckets_per_worker {
                queue_config.max_buckets_per_worker = max;
            }
            instance::start_queue_forever(queue_config.to_queue_config()).await
        }
        Command::Work {
            queue_addr,
            worker_id,
            num,
            exit_when_queue_empty,
            runner_command,
        } => {
            let options = workers::WorkOptions {
                queue_addr: resolve_queue_addr(queue_addr, &config)?,
                worker_id,
                num_workers: num.get(),
                exit_when_queue_empty,
                runner_command,
            };
            workers::start_workers(options, &config.worker).await
        }
        Command::Submit {
            queue_addr,
            job_id,
            priority,
            strategy,
            tests,
            wait,
        } => {
            let options = jobs::SubmitOptions {
                queue_addr: resolve_queue_addr(queue_addr, &config)?,
                job_id: job_id.map(JobId::new).unwrap_or_else(JobId::unique),
                priority: JobPriority(priority),
                strategy,
                tests: &tests,
                wait,
            };
            jobs::submit(options).await
        }
        Command::Status { queue_addr, job_id } => {
            jobs::status(resolve_queue_addr(queue_addr, &config)?, JobId::new(job_id)).await
        }
        Command::Aliveness { queue_addr } => {
            jobs::aliveness(resolve_queue_addr(queue_addr, &config)?).await
        }
    }
}

fn resolve_queue_addr(flag: Option<SocketAddr>, config: &BqConfig) -> anyhow::Result<SocketAddr> {
    flag.or(config.worker.queue_addr).ok_or_else(|| {
        anyhow!("no queue address; pass --queue-addr or set worker.queue_addr in the config file")
    })
}
