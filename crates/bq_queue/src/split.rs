//! Splits a job's tests into buckets.

use std::collections::HashSet;

use bq_utils::net_protocol::{
    queue::ScheduleStrategyType,
    workers::{Bucket, BucketId, ConfiguredTestEntry, JobId, TestEntry, TestEntryConfiguration},
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("bucket size must be at least 1")]
    ZeroBucketSize,
}

/// Entries sharing one configuration, each entry at most once.
struct Group<'a> {
    configuration: &'a TestEntryConfiguration,
    entries: Vec<&'a TestEntry>,
    seen: HashSet<&'a TestEntry>,
}

/// Groups entries by configuration, in order of first appearance. An entry that repeats within
/// a configuration goes to a later group of that configuration, so no group runs a test twice.
fn group_by_configuration(entries: &[ConfiguredTestEntry]) -> Vec<Group<'_>> {
    let mut groups: Vec<Group<'_>> = vec![];
    for ConfiguredTestEntry {
        test_entry,
        configuration,
    } in entries
    {
        let existing = groups
            .iter_mut()
            .find(|g| g.configuration == configuration && !g.seen.contains(test_entry));
        match existing {
            Some(group) => {
                group.entries.push(test_entry);
                group.seen.insert(test_entry);
            }
            None => groups.push(Group {
                configuration,
                entries: vec![test_entry],
                seen: HashSet::from([test_entry]),
            }),
        }
    }
    groups
}

/// Derives a bucket id from what the bucket is: the same job, position and tests always yield
/// the same id.
fn bucket_id(job_id: &JobId, index: usize, entries: &[TestEntry]) -> BucketId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(job_id.as_str().as_bytes());
    hasher.update(&(index as u64).to_le_bytes());
    for entry in entries {
        hasher.update(entry.test_name.class_name.as_bytes());
        hasher.update(b"/");
        hasher.update(entry.test_name.method_name.as_bytes());
        hasher.update(b"\0");
    }
    let digest = hasher.finalize().to_hex();
    BucketId::new(format!("{}-{}", job_id, &digest.as_str()[..16]))
}

fn chunk<'a>(
    entries: &[&'a TestEntry],
    strategy: ScheduleStrategyType,
    number_of_workers: usize,
) -> Vec<Vec<&'a TestEntry>> {
    match strategy {
        ScheduleStrategyType::Unsplit => vec![entries.to_vec()],
        ScheduleStrategyType::Individual => entries.iter().map(|e| vec![*e]).collect(),
        ScheduleStrategyType::EquallyDivided => {
            let number_of_buckets = std::cmp::min(number_of_workers.max(1), entries.len());
            let mut chunks = vec![vec![]; number_of_buckets];
            for (i, entry) in entries.iter().enumerate() {
                chunks[i % number_of_buckets].push(*entry);
            }
            chunks
        }
        ScheduleStrategyType::FixedBucketSize(size) => entries
            .chunks(size as usize)
            .map(|chunk| chunk.to_vec())
            .collect(),
    }
}

/// Splits `entries` into buckets according to `strategy`.
///
/// Pure and deterministic: identical inputs always produce identical buckets, ids included.
/// Entries are first grouped by configuration, then each group is split on its own.
pub fn split(
    job_id: &JobId,
    entries: &[ConfiguredTestEntry],
    strategy: ScheduleStrategyType,
    number_of_workers: usize,
) -> Result<Vec<Bucket>, ScheduleError> {
    if strategy == ScheduleStrategyType::FixedBucketSize(0) {
        return Err(ScheduleError::ZeroBucketSize);
    }

    let mut buckets = vec![];
    for group in group_by_configuration(entries) {
        for chunk in chunk(&group.entries, strategy, number_of_workers) {
            let test_entries: Vec<TestEntry> = chunk.into_iter().cloned().collect();
            buckets.push(Bucket {
                bucket_id: bucket_id(job_id, buckets.len(), &test_entries),
                test_entries,
                configuration: group.configuration.clone(),
            });
        }
    }
    Ok(buckets)
}
