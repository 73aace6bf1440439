use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
};

use bq_utils::net_protocol::queue::ScheduleStrategyType;
use clap::{Parser, Subcommand, ValueEnum};

pub(crate) fn unspecified_socket_addr() -> SocketAddr {
    // Can't be a constant due to https://github.com/rust-lang/rust/issues/67390
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Bucket queue
///
/// Distributes test buckets over a fleet of workers.
#[derive(Parser, Debug)]
#[clap(version)]
pub struct Cli {
    /// Configuration file. Defaults to `config.toml` in the user's bucketq config directory;
    /// missing default files are fine.
    #[clap(long, global = true, env = "BQ_CONFIG")]
    pub config: Option<PathBuf>,

    #[clap(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Write logs to this file, rotated daily, instead of stderr.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Starts a queue, serving until interrupted.
    Start {
        /// Host/port IP address to bind the queue to.
        /// When not specified, the configured address is used, or an arbitrary open port on
        /// 0.0.0.0.
        #[clap(long)]
        bind: Option<SocketAddr>,

        /// Split jobs for this many workers, rather than for the workers registered when the job
        /// arrives.
        #[clap(long)]
        number_of_workers: Option<NonZeroUsize>,

        /// How many buckets one worker may hold at once.
        #[clap(long)]
        max_buckets_per_worker: Option<NonZeroUsize>,
    },
    /// Starts workers that pull buckets from a queue.
    Work {
        #[clap(long, env = "BQ_QUEUE_ADDR")]
        queue_addr: Option<SocketAddr>,

        /// Id of the worker. With more than one worker, each gets this id with its index
        /// appended.
        #[clap(long)]
        worker_id: Option<String>,

        /// Number of workers to start; `cpu-cores` for one per core.
        #[clap(long, short = 'n', default_value = "1")]
        num: NumWorkers,

        /// Stop once the queue has no work left.
        #[clap(long)]
        exit_when_queue_empty: bool,

        /// Command run once per test, e.g. `-- ./run-test.sh`. Without it, every test passes.
        #[clap(last = true)]
        runner_command: Vec<String>,
    },
    /// Submits a job to a queue.
    Submit {
        #[clap(long, env = "BQ_QUEUE_ADDR")]
        queue_addr: Option<SocketAddr>,

        /// Id of the job. A fresh one is made up when not given.
        #[clap(long)]
        job_id: Option<String>,

        /// Jobs with higher priority are served first.
        #[clap(long, default_value_t = 0)]
        priority: u32,

        /// One of `unsplit`, `individual`, `equally_divided`, or `fixed_bucket_size:<n>`.
        #[clap(long, default_value = "individual")]
        strategy: ScheduleStrategyType,

        /// JSON file with the list of configured test entries to run.
        #[clap(long)]
        tests: PathBuf,

        /// Wait for the job to finish, print its results, and delete it. Exits non-zero if any
        /// test failed.
        #[clap(long)]
        wait: bool,
    },
    /// Prints the state of a job.
    Status {
        #[clap(long, env = "BQ_QUEUE_ADDR")]
        queue_addr: Option<SocketAddr>,

        job_id: String,
    },
    /// Prints the aliveness of every worker known to a queue.
    Aliveness {
        #[clap(long, env = "BQ_QUEUE_ADDR")]
        queue_addr: Option<SocketAddr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumWorkers {
    CpuCores,
    Fixed(NonZeroUsize),
}

impl NumWorkers {
    pub fn get(self) -> NonZeroUsize {
        match self {
            NumWorkers::CpuCores => NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN),
            NumWorkers::Fixed(n) => n,
        }
    }
}

impl FromStr for NumWorkers {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "cpu-cores" {
            return Ok(NumWorkers::CpuCores);
        }
        s.parse()
            .map(NumWorkers::Fixed)
            .map_err(|_| format!("expected a positive number or `cpu-cores`, got {s:?}"))
    }
}
