//! Runs each test as its own process.
//!
//! The test to run is passed through the environment: `BQ_TEST_CLASS` and `BQ_TEST_METHOD` name
//! it, `BQ_TEST_DESTINATION` and `BQ_SIMULATOR_ID` describe where it runs, and the bucket's
//! configured environment is applied on top. Exit status zero is a pass. A process killed by a
//! signal is not reported at all, so the test counts as lost and is run again.

use std::{process::Output, time::Instant};

use async_trait::async_trait;
use bq_utils::{
    net_protocol::{results::TestException, workers::TestEntry},
    time::EpochMillis,
};
use tokio::process::Command;

use crate::runner::{
    RunnerError, TestContext, TestRunner, TestRunnerStream, TestStoppedEvent, TestStoppedResult,
};

#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits `[program, args..]`. `None` if the command is empty.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    fn command(&self, entry: &TestEntry, context: &TestContext) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("BQ_TEST_CLASS", &entry.test_name.class_name)
            .env("BQ_TEST_METHOD", &entry.test_name.method_name)
            .env("BQ_TEST_DESTINATION", context.test_destination.to_string())
            .env("BQ_SIMULATOR_ID", &context.simulator_id)
            .envs(&context.environment)
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl TestRunner for CommandRunner {
    async fn run(
        &self,
        entries: &[TestEntry],
        context: &TestContext,
        stream: &mut dyn TestRunnerStream,
    ) -> Result<(), RunnerError> {
        for entry in entries {
            stream.test_started(&entry.test_name);
            let test_start_time = EpochMillis::now();
            let started = Instant::now();

            let output = self.command(entry, context).output().await?;

            let result = match output.status.code() {
                Some(0) => TestStoppedResult::Success,
                Some(_) => TestStoppedResult::Failure,
                None => {
                    tracing::warn!(%entry, status = %output.status, "test process was killed");
                    continue;
                }
            };
            let test_exceptions = match result {
                TestStoppedResult::Success => vec![],
                _ => vec![failure_exception(&self.program, &output)],
            };

            stream.test_stopped(TestStoppedEvent {
                test_name: entry.test_name.clone(),
                result,
                test_duration: started.elapsed(),
                test_exceptions,
                test_start_time,
            });
        }
        Ok(())
    }
}

fn failure_exception(program: &str, output: &Output) -> TestException {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let reason = match stderr.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(last_line) => format!("{program} {}: {}", output.status, last_line.trim()),
        None => format!("{program} {}", output.status),
    };
    TestException::new(reason, program, 0)
}
