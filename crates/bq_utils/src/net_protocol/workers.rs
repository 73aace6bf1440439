//! Units of work handed to workers, and what they are made of.

use std::{collections::BTreeMap, fmt};

use serde_derive::{Deserialize, Serialize};

use super::resources::TypedResourceLocation;

/// Identity of a job: one client-submitted run of tests, tracked by one bucket queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BucketId(String);

impl BucketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BucketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority of a job relative to other jobs on the queue. Higher runs first.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct JobPriority(pub u32);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestName {
    pub class_name: String,
    pub method_name: String,
}

impl TestName {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class_name, self.method_name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestEntry {
    pub test_name: TestName,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub case_id: Option<u64>,
}

impl TestEntry {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            test_name: TestName::new(class_name, method_name),
            tags: vec![],
            case_id: None,
        }
    }
}

impl fmt::Display for TestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.test_name.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildArtifacts {
    pub app_bundle: Option<TypedResourceLocation>,
    pub runner: Option<TypedResourceLocation>,
    pub xc_test_bundle: TypedResourceLocation,
    #[serde(default)]
    pub additional_application_bundles: Vec<TypedResourceLocation>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SimulatorSettings {
    /// Localization settings applied when the simulator starts.
    pub simulator_localization_settings: Option<TypedResourceLocation>,
    pub watchdog_settings: Option<TypedResourceLocation>,
    /// Applied after the simulator is created, before it boots.
    pub pre_boot_global_preference: Option<TypedResourceLocation>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestDestination {
    pub device_type: String,
    pub runtime: String,
}

impl fmt::Display for TestDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.device_type, self.runtime)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TestExecutionBehavior {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// How many times a failed test is re-enqueued before its failure is final.
    #[serde(default)]
    pub number_of_retries: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TestType {
    LogicTest,
    AppTest,
    UiTest,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolchainConfiguration {
    pub developer_dir: String,
}

/// Everything about how a test entry is run, except for the entry itself. Entries that share a
/// configuration may share a bucket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestEntryConfiguration {
    pub build_artifacts: BuildArtifacts,
    #[serde(default)]
    pub simulator_settings: SimulatorSettings,
    pub test_destination: TestDestination,
    #[serde(default)]
    pub test_execution_behavior: TestExecutionBehavior,
    pub test_type: TestType,
    pub toolchain_configuration: ToolchainConfiguration,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfiguredTestEntry {
    pub test_entry: TestEntry,
    pub configuration: TestEntryConfiguration,
}

/// An immutable unit of work: test entries that run together on one worker, and how to run
/// them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub bucket_id: BucketId,
    pub test_entries: Vec<TestEntry>,
    pub configuration: TestEntryConfiguration,
}

impl Bucket {
    pub fn number_of_retries(&self) -> u32 {
        self.configuration.test_execution_behavior.number_of_retries
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<bucket {} with {} tests>",
            self.bucket_id,
            self.test_entries.len()
        )
    }
}
