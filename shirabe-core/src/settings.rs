use serde::{Deserialize, Serialize};

use crate::partition::PartitionSettings;

/// How much `meta.source` information is stored (and therefore searchable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMetaSource {
    None,
    SourceUri,
    SourceUriAndRequestId,
}

/// Search engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Upper bound for pid lists bound into a single `IN (...)` clause
    pub maximum_page_size: usize,
    /// Default number of rows to fetch for a primary query
    pub fetch_size_default_maximum: usize,
    /// Growth of the fetch size after a page made only of already-seen pids
    pub retry_fetch_increment: usize,
    /// Fetch size is never enlarged past this value
    pub maximum_fetch_size_ceiling: usize,
    pub unique_indexes_enabled: bool,
    pub filter_parameter_enabled: bool,
    pub store_meta_source_information: StoreMetaSource,
    pub token_text_indexing_enabled: bool,
    /// Absolute reference base URLs that are treated as local references
    pub treat_base_urls_as_local: Vec<String>,
    pub partitioning: PartitionSettings,
}

impl SearchSettings {
    pub const MAXIMUM_PAGE_SIZE: usize = 800;

    /// Strip a local base URL from an absolute reference
    pub fn localize_reference<'a>(&self, reference: &'a str) -> Option<&'a str> {
        self.treat_base_urls_as_local.iter().find_map(|base| {
            reference
                .strip_prefix(base.trim_end_matches('/'))
                .and_then(|rest| rest.strip_prefix('/'))
        })
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            maximum_page_size: Self::MAXIMUM_PAGE_SIZE,
            fetch_size_default_maximum: 10_000,
            retry_fetch_increment: 1000,
            maximum_fetch_size_ceiling: 100_000,
            unique_indexes_enabled: true,
            filter_parameter_enabled: false,
            store_meta_source_information: StoreMetaSource::SourceUriAndRequestId,
            token_text_indexing_enabled: false,
            treat_base_urls_as_local: Vec::new(),
            partitioning: PartitionSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SearchSettings::default();
        assert_eq!(settings.maximum_page_size, 800);
        assert_eq!(settings.retry_fetch_increment, 1000);
        assert!(!settings.filter_parameter_enabled);
        assert!(!settings.token_text_indexing_enabled);
        assert!(!settings.partitioning.partitioning_enabled);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings: SearchSettings =
            serde_json::from_str(r#"{"filter_parameter_enabled": true}"#).unwrap();
        assert!(settings.filter_parameter_enabled);
        assert_eq!(settings.maximum_page_size, 800);
    }

    #[test]
    fn test_localize_reference() {
        let settings = SearchSettings {
            treat_base_urls_as_local: vec!["http://example.org/fhir/".to_string()],
            ..Default::default()
        };
        assert_eq!(
            settings.localize_reference("http://example.org/fhir/Patient/1"),
            Some("Patient/1")
        );
        assert_eq!(settings.localize_reference("http://other.org/Patient/1"), None);
    }
}
