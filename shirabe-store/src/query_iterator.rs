//! Lazily executed, de-duplicated stream of the pids matching one search.
//!
//! Primary results come first (after any pre-queued `$everything` pids),
//! followed by the pids found through `_include` / `_revinclude`. Only one
//! cursor is open at any time.

use std::collections::{HashSet, VecDeque};

use shirabe_core::{Include, ResourcePid, SearchParameterMap};
use tracing::{debug, error, warn};

use crate::error::{Result, StoreError};
use crate::executor::RowCursor;
use crate::interceptor::SearchRuntimeDetails;
use crate::search_builder::SearchBuilder;
use crate::sql::GeneratedSql;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Uninitialized,
    FetchingPrimary,
    FetchingIncludes,
    Exhausted,
}

pub struct QueryIterator<'a> {
    builder: SearchBuilder<'a>,
    params: SearchParameterMap,
    details: SearchRuntimeDetails,
    state: IteratorState,
    max_results: usize,
    queries: VecDeque<GeneratedSql>,
    cursor: Option<Box<dyn RowCursor>>,
    also_include: VecDeque<ResourcePid>,
    seen: HashSet<ResourcePid>,
    primary: Vec<ResourcePid>,
    included: VecDeque<ResourcePid>,
    next: Option<ResourcePid>,
    skip_count: usize,
    non_skip_count: usize,
    pass_rows: usize,
    pass_novel: usize,
    first_result_loaded: bool,
    closed: bool,
}

impl<'a> QueryIterator<'a> {
    pub(crate) fn new(builder: SearchBuilder<'a>, params: SearchParameterMap) -> Self {
        let settings = &builder.context().settings;
        // `_count=0` never reaches the database, see `fetch_next`
        let max_results = params
            .count
            .unwrap_or(settings.fetch_size_default_maximum)
            .clamp(1, settings.maximum_fetch_size_ceiling.max(1));
        let seen = builder.previously_added_resource_pids().clone();
        let details = SearchRuntimeDetails::new(builder.resource_type());
        Self {
            builder,
            params,
            details,
            state: IteratorState::Uninitialized,
            max_results,
            queries: VecDeque::new(),
            cursor: None,
            also_include: VecDeque::new(),
            seen,
            primary: Vec::new(),
            included: VecDeque::new(),
            next: None,
            skip_count: 0,
            non_skip_count: 0,
            pass_rows: 0,
            pass_novel: 0,
            first_result_loaded: false,
            closed: false,
        }
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    pub fn details(&self) -> &SearchRuntimeDetails {
        &self.details
    }

    /// Rows dropped because their pid was already returned
    pub fn skipped_count(&self) -> usize {
        self.skip_count
    }

    /// Primary rows returned to the caller
    pub fn non_skipped_count(&self) -> usize {
        self.non_skip_count
    }

    /// Current fetch target; grows when a whole pass yields nothing new
    pub fn max_results(&self) -> usize {
        self.max_results
    }

    pub fn has_next(&mut self) -> Result<bool> {
        if self.next.is_none() && self.state != IteratorState::Exhausted {
            if let Err(e) = self.fetch_next() {
                if e.is_internal() {
                    error!("Failed during search loading: {}", e);
                }
                self.close();
                return Err(e);
            }
        }
        Ok(self.next.is_some())
    }

    pub fn next(&mut self) -> Result<ResourcePid> {
        self.has_next()?;
        self.next
            .take()
            .ok_or_else(|| StoreError::IllegalState("No more elements".to_string()))
    }

    /// Up to `size` pids; fewer only when the iterator is exhausted
    pub fn next_result_batch(&mut self, size: usize) -> Result<Vec<ResourcePid>> {
        let mut batch = Vec::with_capacity(size.min(self.max_results));
        while batch.len() < size && self.has_next()? {
            batch.push(self.next()?);
        }
        Ok(batch)
    }

    /// Release the open cursor. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
        self.queries.clear();
        self.state = IteratorState::Exhausted;
    }

    fn fetch_next(&mut self) -> Result<()> {
        loop {
            match self.state {
                IteratorState::Uninitialized => {
                    if self.params.count == Some(0) {
                        debug!("_count=0 requested for {}, nothing is fetched", self.details.resource_type);
                        self.finish();
                        continue;
                    }
                    self.initialize()?;
                    self.state = IteratorState::FetchingPrimary;
                }
                IteratorState::FetchingPrimary => {
                    if self.fetch_primary()? {
                        return Ok(());
                    }
                }
                IteratorState::FetchingIncludes => {
                    if let Some(pid) = self.included.pop_front() {
                        self.surface(pid);
                        return Ok(());
                    }
                    self.finish();
                }
                IteratorState::Exhausted => return Ok(()),
            }
        }
    }

    fn initialize(&mut self) -> Result<()> {
        self.queries = self
            .builder
            .create_query(&self.params, Some(self.max_results))?
            .into();
        self.also_include = self.builder.also_include_pids().iter().copied().collect();
        self.builder.context().interceptor.query_issued(&self.details);
        Ok(())
    }

    /// One step of the primary phase; true once a pid is ready
    fn fetch_primary(&mut self) -> Result<bool> {
        if let Some(pid) = self.also_include.pop_front() {
            return Ok(self.accept_primary(pid));
        }

        let Some(cursor) = self.cursor.as_mut() else {
            match self.queries.pop_front() {
                Some(sql) => self.open_cursor(&sql)?,
                None => self.end_of_pass()?,
            }
            return Ok(false);
        };

        match cursor.next_row()? {
            Some(row) => {
                self.pass_rows += 1;
                Ok(self.accept_primary(ResourcePid(row)))
            }
            None => {
                if let Some(mut cursor) = self.cursor.take() {
                    cursor.close();
                }
                Ok(false)
            }
        }
    }

    fn open_cursor(&mut self, sql: &GeneratedSql) -> Result<()> {
        if let Some(mut previous) = self.cursor.take() {
            previous.close();
        }
        if sql.match_nothing {
            return Ok(());
        }
        self.builder.capture_sql(sql);
        let cursor = self
            .builder
            .context()
            .executor
            .execute(sql, Some(self.max_results))?;
        self.cursor = Some(cursor);
        Ok(())
    }

    /// All queries of a pass are drained: retry with a larger target, or move on
    fn end_of_pass(&mut self) -> Result<()> {
        let settings = &self.builder.context().settings;
        let ceiling = settings.maximum_fetch_size_ceiling;
        if self.pass_novel == 0 && self.pass_rows >= self.max_results && self.max_results < ceiling {
            self.max_results = (self.max_results + settings.retry_fetch_increment.max(1)).min(ceiling);
            warn!(
                "Pass completed with no matching results. This indicates an inefficient query! Retrying with new max count of {}",
                self.max_results
            );
            self.pass_rows = 0;
            self.queries = self
                .builder
                .create_query(&self.params, Some(self.max_results))?
                .into();
            return Ok(());
        }

        self.state = IteratorState::FetchingIncludes;
        self.load_includes()
    }

    fn accept_primary(&mut self, pid: ResourcePid) -> bool {
        if !self.seen.insert(pid) {
            self.skip_count += 1;
            return false;
        }
        self.non_skip_count += 1;
        self.pass_novel += 1;
        self.primary.push(pid);
        self.surface(pid);
        true
    }

    fn surface(&mut self, pid: ResourcePid) {
        self.details.found_matches_count += 1;
        if !self.first_result_loaded {
            self.first_result_loaded = true;
            self.builder.context().interceptor.first_result_loaded(&self.details);
        }
        self.next = Some(pid);
    }

    fn load_includes(&mut self) -> Result<()> {
        let forward: Vec<Include> = if self.params.everything_mode.is_some() {
            vec![Include::wildcard(true)]
        } else {
            self.params.includes.clone()
        };

        let mut found = self.builder.load_includes(&self.primary, &forward, false, None)?;
        found.extend(self.builder.load_includes(
            &self.primary,
            &self.params.rev_includes,
            true,
            self.params.last_updated.as_ref(),
        )?);
        for pid in found {
            if self.seen.insert(pid) {
                self.included.push_back(pid);
            }
        }
        debug!(
            "Search for {} queued {} included resources",
            self.details.resource_type,
            self.included.len()
        );
        Ok(())
    }

    fn finish(&mut self) {
        self.state = IteratorState::Exhausted;
        self.builder.context().interceptor.search_complete(&self.details);
        self.close();
    }
}

impl Drop for QueryIterator<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RawRowExecutor;
    use crate::interceptor::{RecordingInterceptor, SearchEvent};
    use crate::search_builder::tests::test_context;
    use shirabe_core::RequestPartitionId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Serves fixed rows for every statement and counts open cursors
    struct FixedRows {
        rows: Vec<i64>,
        open: Arc<AtomicUsize>,
        limits: Mutex<Vec<Option<usize>>>,
    }

    struct FixedCursor {
        rows: VecDeque<i64>,
        open: Arc<AtomicUsize>,
        closed: bool,
    }

    impl RowCursor for FixedCursor {
        fn next_row(&mut self) -> Result<Option<i64>> {
            Ok(self.rows.pop_front())
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl RawRowExecutor for FixedRows {
        fn execute(&self, _sql: &GeneratedSql, max_rows: Option<usize>) -> Result<Box<dyn RowCursor>> {
            if let Ok(mut limits) = self.limits.lock() {
                limits.push(max_rows);
            }
            self.open.fetch_add(1, Ordering::SeqCst);
            let rows = self.rows.iter().copied().take(max_rows.unwrap_or(usize::MAX)).collect();
            Ok(Box::new(FixedCursor {
                rows,
                open: self.open.clone(),
                closed: false,
            }))
        }
    }

    fn fixed(rows: &[i64]) -> (Arc<FixedRows>, Arc<AtomicUsize>) {
        let open = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(FixedRows {
            rows: rows.to_vec(),
            open: open.clone(),
            limits: Mutex::new(Vec::new()),
        });
        (executor, open)
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let (executor, _) = fixed(&[1, 2, 2, 3, 1]);
        let mut ctx = test_context();
        ctx.executor = executor;
        let builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let mut iterator = builder.search(SearchParameterMap::new());
        let pids = iterator.next_result_batch(10).unwrap();
        assert_eq!(pids, vec![ResourcePid(1), ResourcePid(2), ResourcePid(3)]);
        assert_eq!(iterator.skipped_count(), 2);
        assert_eq!(iterator.non_skipped_count(), 3);
        assert_eq!(iterator.state(), IteratorState::Exhausted);
    }

    #[test]
    fn test_next_past_end_is_illegal_state() {
        let (executor, _) = fixed(&[]);
        let mut ctx = test_context();
        ctx.executor = executor;
        let builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let mut iterator = builder.search(SearchParameterMap::new());
        assert!(!iterator.has_next().unwrap());
        let err = iterator.next().unwrap_err();
        assert!(matches!(err, StoreError::IllegalState(ref m) if m == "No more elements"));
    }

    #[test]
    fn test_previously_added_pids_trigger_retry() {
        let (executor, _) = fixed(&[1, 2, 3]);
        let mut ctx = test_context();
        ctx.executor = executor.clone();
        ctx.settings.retry_fetch_increment = 5;
        ctx.settings.maximum_fetch_size_ceiling = 7;
        let mut builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        builder.set_previously_added_resource_pids([ResourcePid(1), ResourcePid(2)]);
        let mut params = SearchParameterMap::new();
        params.count = Some(2);
        let mut iterator = builder.search(params);
        let pids = iterator.next_result_batch(10).unwrap();
        assert_eq!(pids, vec![ResourcePid(3)]);
        assert_eq!(iterator.max_results(), 7);
        let limits = executor.limits.lock().unwrap().clone();
        assert_eq!(limits, vec![Some(2), Some(7)]);
    }

    #[test]
    fn test_zero_count_fetches_nothing() {
        let (executor, _) = fixed(&[1, 2]);
        let recorder = Arc::new(RecordingInterceptor::new());
        let mut ctx = test_context();
        ctx.executor = executor.clone();
        ctx.interceptor = recorder.clone();
        let builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let mut params = SearchParameterMap::new();
        params.count = Some(0);
        let mut iterator = builder.search(params);
        assert!(iterator.next_result_batch(10).unwrap().is_empty());
        assert_eq!(iterator.state(), IteratorState::Exhausted);
        assert!(executor.limits.lock().unwrap().is_empty());
        assert_eq!(recorder.events(), vec![SearchEvent::SearchComplete { found: 0 }]);
    }

    #[test]
    fn test_close_is_idempotent_and_releases_cursor() {
        let (executor, open) = fixed(&[1, 2, 3]);
        let mut ctx = test_context();
        ctx.executor = executor;
        let builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let mut iterator = builder.search(SearchParameterMap::new());
        assert_eq!(iterator.next().unwrap(), ResourcePid(1));
        assert_eq!(open.load(Ordering::SeqCst), 1);
        iterator.close();
        iterator.close();
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(!iterator.has_next().unwrap());
    }

    #[test]
    fn test_events_fire_in_order() {
        let (executor, _) = fixed(&[4]);
        let recorder = Arc::new(RecordingInterceptor::new());
        let mut ctx = test_context();
        ctx.executor = executor;
        ctx.interceptor = recorder.clone();
        let builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let mut iterator = builder.search(SearchParameterMap::new());
        assert_eq!(iterator.next_result_batch(5).unwrap(), vec![ResourcePid(4)]);
        let events: Vec<SearchEvent> = recorder
            .events()
            .into_iter()
            .filter(|e| !matches!(e, SearchEvent::RawSql(_)))
            .collect();
        assert_eq!(
            events,
            vec![
                SearchEvent::QueryIssued,
                SearchEvent::FirstResultLoaded,
                SearchEvent::SearchComplete { found: 1 },
            ]
        );
        assert_eq!(recorder.raw_sql_statements().len(), 1);
    }
}
