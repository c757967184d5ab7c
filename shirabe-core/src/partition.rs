//! Partition (tenant) scope of a search request.

use serde::{Deserialize, Serialize};

/// Partition scope a request is allowed to observe
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestPartitionId {
    /// Every partition; no partition predicate is generated
    AllPartitions,
    /// The unpartitioned (default) partition, stored as NULL
    Default,
    /// A single numbered partition
    Partition(i32),
}

impl RequestPartitionId {
    pub fn is_all_partitions(&self) -> bool {
        matches!(self, Self::AllPartitions)
    }

    /// Partition id to compare against, `None` meaning the default partition.
    /// Only meaningful when not [`RequestPartitionId::AllPartitions`].
    pub fn partition_id(&self) -> Option<i32> {
        match self {
            Self::Partition(id) => Some(*id),
            _ => None,
        }
    }
}

impl Default for RequestPartitionId {
    fn default() -> Self {
        Self::AllPartitions
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSettings {
    pub partitioning_enabled: bool,
    /// Hash identities include the partition id, which makes cross-partition
    /// searches impossible
    pub include_partition_in_search_hashes: bool,
}

impl PartitionSettings {
    /// Partition id to mix into hash identities, if any
    pub fn hash_partition(&self, scope: &RequestPartitionId) -> Option<i32> {
        if self.partitioning_enabled && self.include_partition_in_search_hashes {
            scope.partition_id()
        } else {
            None
        }
    }
}

/// Maps a request onto the partition scope it may search
pub trait PartitionResolver: Send + Sync {
    fn determine_read_partition_for_search(&self, resource_type: &str) -> RequestPartitionId;
}

/// Resolver that always answers with the same scope
#[derive(Debug, Clone, Default)]
pub struct FixedPartitionResolver {
    scope: RequestPartitionId,
}

impl FixedPartitionResolver {
    pub fn new(scope: RequestPartitionId) -> Self {
        Self { scope }
    }
}

impl PartitionResolver for FixedPartitionResolver {
    fn determine_read_partition_for_search(&self, _resource_type: &str) -> RequestPartitionId {
        self.scope.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_partition_only_when_enabled() {
        let scope = RequestPartitionId::Partition(3);
        let mut settings = PartitionSettings::default();
        assert_eq!(settings.hash_partition(&scope), None);

        settings.partitioning_enabled = true;
        assert_eq!(settings.hash_partition(&scope), None);

        settings.include_partition_in_search_hashes = true;
        assert_eq!(settings.hash_partition(&scope), Some(3));
        assert_eq!(settings.hash_partition(&RequestPartitionId::Default), None);
    }

    #[test]
    fn test_fixed_resolver() {
        let resolver = FixedPartitionResolver::new(RequestPartitionId::Partition(1));
        assert_eq!(
            resolver.determine_read_partition_for_search("Patient"),
            RequestPartitionId::Partition(1)
        );
    }
}
