use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use super::workers::{BucketId, TestDestination, TestEntry};
use crate::time::EpochMillis;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestException {
    pub reason: String,
    pub file_path_in_project: String,
    pub line_number: u32,
}

impl TestException {
    pub fn new(reason: impl Into<String>, file: &str, line: u32) -> Self {
        Self {
            reason: reason.into(),
            file_path_in_project: file.to_string(),
            line_number: line,
        }
    }
}

/// One execution of one test.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestRunResult {
    pub succeeded: bool,
    pub exceptions: Vec<TestException>,
    pub duration: Duration,
    pub start_time: EpochMillis,
    pub host_name: String,
    pub simulator_id: String,
}

impl TestRunResult {
    /// A failed run standing in for a test that never reported, e.g. because its runner crashed.
    pub fn did_not_run(reason: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            exceptions: vec![TestException::new(reason, "", 0)],
            duration: Duration::ZERO,
            start_time: EpochMillis::now(),
            host_name: String::new(),
            simulator_id: String::new(),
        }
    }
}

pub const DID_NOT_RUN_REASON: &str = "test did not run";

/// All executions of one test entry within a bucket run.
/// An entry with no executions is lost: the runner never reported on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestEntryResult {
    pub test_entry: TestEntry,
    pub test_run_results: Vec<TestRunResult>,
}

impl TestEntryResult {
    pub fn lost(test_entry: TestEntry) -> Self {
        Self {
            test_entry,
            test_run_results: vec![],
        }
    }

    /// A single failed run marking that the entry was never reported on.
    pub fn did_not_run(test_entry: TestEntry) -> Self {
        Self::with_result(test_entry, TestRunResult::did_not_run(DID_NOT_RUN_REASON))
    }

    pub fn with_result(test_entry: TestEntry, result: TestRunResult) -> Self {
        Self {
            test_entry,
            test_run_results: vec![result],
        }
    }

    pub fn is_lost(&self) -> bool {
        self.test_run_results.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.test_run_results.iter().any(|r| r.succeeded)
    }
}

/// What a worker reports back for a bucket it ran.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestingResult {
    pub bucket_id: BucketId,
    pub test_destination: TestDestination,
    pub unfiltered_results: Vec<TestEntryResult>,
}
