use std::time::Duration;

use bq_utils::{
    net_protocol::{
        resources::{ResourceKind, TypedResourceLocation},
        results::{TestEntryResult, TestRunResult, TestingResult},
        workers::{
            Bucket, BucketId, BuildArtifacts, ConfiguredTestEntry, TestDestination, TestEntry,
            TestEntryConfiguration, TestExecutionBehavior, TestType, ToolchainConfiguration,
        },
    },
    time::EpochMillis,
};

pub fn configuration(runtime: &str) -> TestEntryConfiguration {
    TestEntryConfiguration {
        build_artifacts: BuildArtifacts {
            app_bundle: None,
            runner: None,
            xc_test_bundle: TypedResourceLocation::local(
                ResourceKind::TestBundle,
                "/builds/Tests.xctest",
            ),
            additional_application_bundles: vec![],
        },
        simulator_settings: Default::default(),
        test_destination: TestDestination {
            device_type: "iPhone X".to_string(),
            runtime: runtime.to_string(),
        },
        test_execution_behavior: Default::default(),
        test_type: TestType::LogicTest,
        toolchain_configuration: ToolchainConfiguration {
            developer_dir: "/Applications/Xcode.app".to_string(),
        },
    }
}

pub fn configured_entries(methods: &[&str], runtime: &str) -> Vec<ConfiguredTestEntry> {
    methods
        .iter()
        .map(|m| ConfiguredTestEntry {
            test_entry: TestEntry::new("Class", *m),
            configuration: configuration(runtime),
        })
        .collect()
}

pub fn bucket(id: &str, methods: &[&str]) -> Bucket {
    Bucket {
        bucket_id: BucketId::from(id),
        test_entries: methods.iter().map(|m| TestEntry::new("Class", *m)).collect(),
        configuration: configuration("11.0"),
    }
}

pub fn bucket_with_retries(id: &str, methods: &[&str], number_of_retries: u32) -> Bucket {
    let mut bucket = bucket(id, methods);
    bucket.configuration.test_execution_behavior = TestExecutionBehavior {
        number_of_retries,
        ..Default::default()
    };
    bucket
}

pub fn run(succeeded: bool) -> TestRunResult {
    TestRunResult {
        succeeded,
        exceptions: vec![],
        duration: Duration::from_millis(10),
        start_time: EpochMillis::from_millis(1_000),
        host_name: "host".to_string(),
        simulator_id: "sim".to_string(),
    }
}

pub fn outcome(method: &str, succeeded: bool) -> TestEntryResult {
    TestEntryResult::with_result(TestEntry::new("Class", method), run(succeeded))
}

/// Every test of the bucket passes.
pub fn passing(bucket: &Bucket) -> TestingResult {
    testing_result(
        bucket,
        bucket
            .test_entries
            .iter()
            .map(|e| TestEntryResult::with_result(e.clone(), run(true)))
            .collect(),
    )
}

pub fn testing_result(bucket: &Bucket, results: Vec<TestEntryResult>) -> TestingResult {
    TestingResult {
        bucket_id: bucket.bucket_id.clone(),
        test_destination: bucket.configuration.test_destination.clone(),
        unfiltered_results: results,
    }
}
