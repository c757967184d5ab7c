//! Observability hooks fired while a search runs.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use shirabe_core::ResourcePid;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sql::GeneratedSql;

/// Per-search bookkeeping handed to interceptor callbacks
#[derive(Debug, Clone)]
pub struct SearchRuntimeDetails {
    pub search_uuid: Uuid,
    pub resource_type: String,
    pub found_matches_count: usize,
    pub query_started: Instant,
}

impl SearchRuntimeDetails {
    pub fn new(resource_type: &str) -> Self {
        Self {
            search_uuid: Uuid::new_v4(),
            resource_type: resource_type.to_string(),
            found_matches_count: 0,
            query_started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.query_started.elapsed()
    }
}

/// Hooks called by the query stack, the search builder and the result iterator.
///
/// Every method has a no-op default so implementations override only what
/// they observe.
pub trait SearchInterceptor: Send + Sync {
    /// A search was built in a way known to be expensive
    fn perf_warning(&self, _message: &str) {}

    fn perf_info(&self, _message: &str) {}

    fn query_issued(&self, _details: &SearchRuntimeDetails) {}

    fn first_result_loaded(&self, _details: &SearchRuntimeDetails) {}

    fn search_complete(&self, _details: &SearchRuntimeDetails) {}

    /// Whether [`SearchInterceptor::raw_sql`] should be called at all
    fn wants_raw_sql(&self) -> bool {
        false
    }

    fn raw_sql(&self, _sql: &GeneratedSql) {}

    /// Access-control pre-filter applied to pids found through includes
    fn pre_access(&self, pids: Vec<ResourcePid>) -> Vec<ResourcePid> {
        pids
    }
}

/// Default interceptor: everything goes to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl SearchInterceptor for LoggingInterceptor {
    fn perf_warning(&self, message: &str) {
        warn!("{}", message);
    }

    fn perf_info(&self, message: &str) {
        info!("{}", message);
    }

    fn query_issued(&self, details: &SearchRuntimeDetails) {
        debug!(uuid = %details.search_uuid, resource_type = %details.resource_type, "Search query issued");
    }

    fn first_result_loaded(&self, details: &SearchRuntimeDetails) {
        debug!(
            uuid = %details.search_uuid,
            elapsed_ms = details.elapsed().as_millis() as u64,
            "First result loaded"
        );
    }

    fn search_complete(&self, details: &SearchRuntimeDetails) {
        debug!(
            uuid = %details.search_uuid,
            found = details.found_matches_count,
            elapsed_ms = details.elapsed().as_millis() as u64,
            "Search complete"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEvent {
    PerfWarning(String),
    PerfInfo(String),
    QueryIssued,
    FirstResultLoaded,
    SearchComplete { found: usize },
    RawSql(String),
}

/// Interceptor that keeps every event in memory; `deny` hides pids from includes
#[derive(Debug, Default)]
pub struct RecordingInterceptor {
    events: Mutex<Vec<SearchEvent>>,
    denied: Vec<ResourcePid>,
}

impl RecordingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, pids: impl IntoIterator<Item = ResourcePid>) -> Self {
        self.denied.extend(pids);
        self
    }

    pub fn events(&self) -> Vec<SearchEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn raw_sql_statements(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SearchEvent::RawSql(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: SearchEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl SearchInterceptor for RecordingInterceptor {
    fn perf_warning(&self, message: &str) {
        self.record(SearchEvent::PerfWarning(message.to_string()));
    }

    fn perf_info(&self, message: &str) {
        self.record(SearchEvent::PerfInfo(message.to_string()));
    }

    fn query_issued(&self, _details: &SearchRuntimeDetails) {
        self.record(SearchEvent::QueryIssued);
    }

    fn first_result_loaded(&self, _details: &SearchRuntimeDetails) {
        self.record(SearchEvent::FirstResultLoaded);
    }

    fn search_complete(&self, details: &SearchRuntimeDetails) {
        self.record(SearchEvent::SearchComplete {
            found: details.found_matches_count,
        });
    }

    fn wants_raw_sql(&self) -> bool {
        true
    }

    fn raw_sql(&self, sql: &GeneratedSql) {
        self.record(SearchEvent::RawSql(sql.sql.clone()));
    }

    fn pre_access(&self, pids: Vec<ResourcePid>) -> Vec<ResourcePid> {
        pids.into_iter().filter(|p| !self.denied.contains(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_interceptor() {
        let interceptor = RecordingInterceptor::new().deny([ResourcePid(2)]);
        interceptor.perf_warning("slow");
        interceptor.raw_sql(&GeneratedSql::new("SELECT 1", vec![]));
        assert_eq!(
            interceptor.events(),
            vec![
                SearchEvent::PerfWarning("slow".into()),
                SearchEvent::RawSql("SELECT 1".into())
            ]
        );
        assert_eq!(
            interceptor.pre_access(vec![ResourcePid(1), ResourcePid(2)]),
            vec![ResourcePid(1)]
        );
    }

    #[test]
    fn test_default_pre_access_keeps_everything() {
        let pids = vec![ResourcePid(1), ResourcePid(5)];
        assert_eq!(LoggingInterceptor.pre_access(pids.clone()), pids);
    }
}
