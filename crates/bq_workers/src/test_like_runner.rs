//! Trivial runners only used for testing.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bq_utils::{
    net_protocol::{results::TestException, workers::TestEntry},
    time::EpochMillis,
};
use parking_lot::Mutex;

use crate::runner::{
    RunnerError, TestContext, TestRunner, TestRunnerStream, TestStoppedEvent, TestStoppedResult,
};

pub const ASSERTION_FAILED: &str = "assertion failed";

/// Passes every test it is given.
pub struct EchoRunner;

#[async_trait]
impl TestRunner for EchoRunner {
    async fn run(
        &self,
        entries: &[TestEntry],
        _context: &TestContext,
        stream: &mut dyn TestRunnerStream,
    ) -> Result<(), RunnerError> {
        for entry in entries {
            stream.test_started(&entry.test_name);
            stream.test_stopped(stopped(entry, TestStoppedResult::Success, vec![]));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    /// Starts the test but never reports it stopped.
    Silent,
    /// The whole run errors out at this test.
    Crash,
}

/// Plays back scripted outcomes per test method. Each run of a test consumes the next outcome in
/// its script; a test with nothing left to play passes.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Vec<Outcome>>>,
    runs: Mutex<Vec<Vec<TestEntry>>>,
    delay: Duration,
}

impl ScriptedRunner {
    pub fn script(self, method_name: &str, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        let mut outcomes: Vec<_> = outcomes.into_iter().collect();
        outcomes.reverse();
        self.scripts
            .lock()
            .insert(method_name.to_string(), outcomes);
        self
    }

    /// Sleeps this long in every test.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The entries of every run so far, in order.
    pub fn runs(&self) -> Vec<Vec<TestEntry>> {
        self.runs.lock().clone()
    }

    pub fn number_of_runs(&self) -> usize {
        self.runs.lock().len()
    }

    fn next_outcome(&self, entry: &TestEntry) -> Outcome {
        self.scripts
            .lock()
            .get_mut(&entry.test_name.method_name)
            .and_then(Vec::pop)
            .unwrap_or(Outcome::Pass)
    }
}

#[async_trait]
impl TestRunner for ScriptedRunner {
    async fn run(
        &self,
        entries: &[TestEntry],
        _context: &TestContext,
        stream: &mut dyn TestRunnerStream,
    ) -> Result<(), RunnerError> {
        self.runs.lock().push(entries.to_vec());

        for entry in entries {
            let outcome = self.next_outcome(entry);
            if outcome == Outcome::Crash {
                return Err(RunnerError::Crashed(format!("crashed at {entry}")));
            }

            stream.test_started(&entry.test_name);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match outcome {
                Outcome::Pass => {
                    stream.test_stopped(stopped(entry, TestStoppedResult::Success, vec![]))
                }
                Outcome::Fail => stream.test_stopped(stopped(
                    entry,
                    TestStoppedResult::Failure,
                    vec![TestException::new(ASSERTION_FAILED, "Tests.swift", 42)],
                )),
                Outcome::Silent | Outcome::Crash => {}
            }
        }
        Ok(())
    }
}

fn stopped(
    entry: &TestEntry,
    result: TestStoppedResult,
    test_exceptions: Vec<TestException>,
) -> TestStoppedEvent {
    TestStoppedEvent {
        test_name: entry.test_name.clone(),
        result,
        test_duration: Duration::from_millis(1),
        test_exceptions,
        test_start_time: EpochMillis::now(),
    }
}
