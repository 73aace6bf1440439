//! Runs the tests of a bucket through a [TestRunner], reviving the runner when it stops
//! reporting.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bq_utils::{
    event_bus::EventBus,
    net_protocol::{
        results::{TestEntryResult, TestException, TestRunResult, DID_NOT_RUN_REASON},
        workers::{TestDestination, TestEntry, TestName},
    },
    time::EpochMillis,
};
use thiserror::Error;

pub const FAILED_TO_START_TEST_RUNNER: &str = "failed to start test runner";

/// A runner that yields no results at all is restarted at most this many times in a row.
const NUMBER_OF_ATTEMPTS_TO_REVIVE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStoppedResult {
    Success,
    Failure,
    /// The test started but its outcome is unknown, e.g. the runner died under it.
    Lost,
}

/// A test runner's report that one test finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestStoppedEvent {
    pub test_name: TestName,
    pub result: TestStoppedResult,
    pub test_duration: Duration,
    pub test_exceptions: Vec<TestException>,
    pub test_start_time: EpochMillis,
}

impl TestStoppedEvent {
    pub fn succeeded(&self) -> bool {
        self.result == TestStoppedResult::Success
    }
}

/// Where and how one batch of tests runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestContext {
    pub environment: BTreeMap<String, String>,
    pub test_destination: TestDestination,
    pub host_name: String,
    pub simulator_id: String,
}

/// Receives a test runner's reports as tests start and stop.
pub trait TestRunnerStream: Send {
    fn test_started(&mut self, test_name: &TestName);
    fn test_stopped(&mut self, event: TestStoppedEvent);
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("test runner crashed: {0}")]
    Crashed(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Runs a list of test entries once, reporting on each through the stream.
///
/// A runner may report on only some of the entries; the rest are considered lost.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(
        &self,
        entries: &[TestEntry],
        context: &TestContext,
        stream: &mut dyn TestRunnerStream,
    ) -> Result<(), RunnerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    WillRun {
        test_entries: Vec<TestEntry>,
        simulator_id: String,
    },
    TestStarted {
        test_entry: TestEntry,
    },
    TestFinished {
        test_entry: TestEntry,
        succeeded: bool,
    },
    DidRun {
        results: Vec<TestEntryResult>,
    },
}

pub type RunnerEventBus = EventBus<RunnerEvent>;

pub fn log_runner_event(event: &RunnerEvent) {
    match event {
        RunnerEvent::WillRun {
            test_entries,
            simulator_id,
        } => tracing::debug!(count = test_entries.len(), %simulator_id, "will run tests"),
        RunnerEvent::TestStarted { test_entry } => {
            tracing::trace!(%test_entry, "test started")
        }
        RunnerEvent::TestFinished {
            test_entry,
            succeeded,
        } => tracing::debug!(%test_entry, succeeded, "test finished"),
        RunnerEvent::DidRun { results } => {
            let lost = results.iter().filter(|r| r.is_lost()).count();
            tracing::debug!(count = results.len(), lost, "did run tests")
        }
    }
}

pub fn spawn_event_logger(bus: &RunnerEventBus) -> tokio::task::JoinHandle<()> {
    bq_utils::event_bus::spawn_subscriber(bus, |event| log_runner_event(&event))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerRunResult {
    pub entries_to_run: Vec<TestEntry>,
    pub test_entry_results: Vec<TestEntryResult>,
}

/// Results collected across revives of a runner. A later non-lost result for an entry replaces
/// an earlier lost one.
#[derive(Default)]
struct CollectedResults {
    results: HashMap<TestEntry, TestEntryResult>,
}

impl CollectedResults {
    fn append(&mut self, results: Vec<TestEntryResult>) {
        for result in results {
            match self.results.get(&result.test_entry) {
                Some(existing) if !existing.is_lost() => {}
                _ => {
                    self.results.insert(result.test_entry.clone(), result);
                }
            }
        }
    }

    fn non_lost_count(&self) -> usize {
        self.results.values().filter(|r| !r.is_lost()).count()
    }

    fn has_result(&self, entry: &TestEntry) -> bool {
        self.results.get(entry).map_or(false, |r| !r.is_lost())
    }
}

pub struct Runner {
    test_runner: Arc<dyn TestRunner>,
    events: RunnerEventBus,
}

impl Runner {
    pub fn new(test_runner: Arc<dyn TestRunner>, events: RunnerEventBus) -> Self {
        Self {
            test_runner,
            events,
        }
    }

    /// Runs the entries, restarting the test runner while it makes progress on entries that have
    /// no result yet. Entries that still have no result at the end are reported as failed runs
    /// that did not happen.
    pub async fn run(&self, entries: &[TestEntry], context: &TestContext) -> RunnerRunResult {
        if entries.is_empty() {
            return RunnerRunResult {
                entries_to_run: vec![],
                test_entry_results: vec![],
            };
        }

        let mut collected = CollectedResults::default();
        let mut revive_attempt = 0;

        while collected.non_lost_count() < entries.len()
            && revive_attempt <= NUMBER_OF_ATTEMPTS_TO_REVIVE
        {
            let missing = missing_entries(entries, &collected);
            let results = self.run_once(&missing, context).await;

            let made_progress = results.iter().any(|r| !r.is_lost());
            collected.append(results);

            if made_progress {
                revive_attempt = 0;
            } else {
                revive_attempt += 1;
                tracing::warn!(
                    revive_attempt,
                    allowed = NUMBER_OF_ATTEMPTS_TO_REVIVE,
                    "got no results; reviving test runner"
                );
            }
        }

        let test_entry_results = entries
            .iter()
            .map(|entry| match collected.results.remove(entry) {
                Some(result) if !result.is_lost() => result,
                _ => did_not_run(entry.clone(), context),
            })
            .collect();

        RunnerRunResult {
            entries_to_run: entries.to_vec(),
            test_entry_results,
        }
    }

    /// Runs the entries once, without reviving. A runner error becomes a failed run of every
    /// entry.
    pub async fn run_once(&self, entries: &[TestEntry], context: &TestContext) -> Vec<TestEntryResult> {
        if entries.is_empty() {
            tracing::info!("nothing to run");
            return vec![];
        }

        self.events.post(RunnerEvent::WillRun {
            test_entries: entries.to_vec(),
            simulator_id: context.simulator_id.clone(),
        });

        let mut stream = CollectingStream {
            entries,
            events: &self.events,
            stopped: vec![],
        };
        if let Err(error) = self.test_runner.run(entries, context, &mut stream).await {
            tracing::warn!(%error, "test runner failed; failing its tests");
            for entry in entries {
                stream.test_started(&entry.test_name);
                stream.test_stopped(TestStoppedEvent {
                    test_name: entry.test_name.clone(),
                    result: TestStoppedResult::Lost,
                    test_duration: Duration::ZERO,
                    test_exceptions: vec![TestException::new(
                        format!("{FAILED_TO_START_TEST_RUNNER}: {error}"),
                        file!(),
                        line!(),
                    )],
                    test_start_time: EpochMillis::now(),
                });
            }
        }
        let stopped = stream.stopped;

        let results: Vec<TestEntryResult> = entries
            .iter()
            .map(|entry| prepare_result(entry, &stopped, context))
            .collect();

        self.events.post(RunnerEvent::DidRun {
            results: results.clone(),
        });
        results
    }
}

struct CollectingStream<'a> {
    entries: &'a [TestEntry],
    events: &'a RunnerEventBus,
    stopped: Vec<TestStoppedEvent>,
}

impl CollectingStream<'_> {
    fn entry(&self, test_name: &TestName) -> Option<&TestEntry> {
        self.entries.iter().find(|e| &e.test_name == test_name)
    }
}

impl TestRunnerStream for CollectingStream<'_> {
    fn test_started(&mut self, test_name: &TestName) {
        match self.entry(test_name) {
            Some(entry) => self.events.post(RunnerEvent::TestStarted {
                test_entry: entry.clone(),
            }),
            None => tracing::error!(%test_name, "can't find test entry for started test"),
        }
    }

    fn test_stopped(&mut self, event: TestStoppedEvent) {
        match self.entry(&event.test_name) {
            Some(entry) => {
                self.events.post(RunnerEvent::TestFinished {
                    test_entry: entry.clone(),
                    succeeded: event.succeeded(),
                });
                self.stopped.push(event);
            }
            None => {
                tracing::error!(test_name = %event.test_name, "can't find test entry for stopped test")
            }
        }
    }
}

fn missing_entries(entries: &[TestEntry], collected: &CollectedResults) -> Vec<TestEntry> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|entry| !collected.has_result(entry) && seen.insert(*entry))
        .cloned()
        .collect()
}

fn prepare_result(
    entry: &TestEntry,
    stopped: &[TestStoppedEvent],
    context: &TestContext,
) -> TestEntryResult {
    let test_run_results = stopped
        .iter()
        .filter(|event| event.test_name == entry.test_name)
        .map(|event| TestRunResult {
            succeeded: event.succeeded(),
            exceptions: event.test_exceptions.clone(),
            duration: event.test_duration,
            start_time: event.test_start_time,
            host_name: context.host_name.clone(),
            simulator_id: context.simulator_id.clone(),
        })
        .collect();
    TestEntryResult {
        test_entry: entry.clone(),
        test_run_results,
    }
}

fn did_not_run(entry: TestEntry, context: &TestContext) -> TestEntryResult {
    let mut run = TestRunResult::did_not_run(DID_NOT_RUN_REASON);
    run.host_name = context.host_name.clone();
    run.simulator_id = context.simulator_id.clone();
    TestEntryResult::with_result(entry, run)
}
