//! Query creation for one search: predicates, pid chunking, `$everything`
//! and `_include` / `_revinclude` expansion.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use shirabe_core::{
    DateRangeParam, EverythingMode, Include, ParamValue, RequestPartitionId, ResourcePid, SearchError,
    SearchParamRegistry, SearchParamType, SearchParameterMap, SearchSettings,
};
use tracing::{debug, info};

use crate::error::Result;
use crate::executor::RawRowExecutor;
use crate::fulltext::{requires_fulltext, FulltextSearchProvider, FULLTEXT_PARAMS};
use crate::index::{LINK_TABLE, RESOURCE_TABLE, RES_ID};
use crate::interceptor::{LoggingInterceptor, SearchInterceptor};
use crate::query_iterator::QueryIterator;
use crate::query_stack::{combo_unique_index_string, link_paths, QueryStack};
use crate::resolver::{is_not_found, IdentifierResolver};
use crate::sql::{BinaryOp, Condition, GeneratedSql, SearchQueryBuilder, TableRef};

/// Settings and collaborators shared by every search
pub struct SearchContext {
    pub settings: SearchSettings,
    pub registry: Arc<dyn SearchParamRegistry>,
    pub resolver: Arc<dyn IdentifierResolver>,
    pub executor: Arc<dyn RawRowExecutor>,
    pub interceptor: Arc<dyn SearchInterceptor>,
    pub fulltext: Option<Arc<dyn FulltextSearchProvider>>,
}

impl SearchContext {
    pub fn new(
        settings: SearchSettings,
        registry: Arc<dyn SearchParamRegistry>,
        resolver: Arc<dyn IdentifierResolver>,
        executor: Arc<dyn RawRowExecutor>,
    ) -> Self {
        Self {
            settings,
            registry,
            resolver,
            executor,
            interceptor: Arc::new(LoggingInterceptor),
            fulltext: None,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn SearchInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn with_fulltext(mut self, provider: Arc<dyn FulltextSearchProvider>) -> Self {
        self.fulltext = Some(provider);
        self
    }
}

/// Builds the SQL for one search over one resource type and partition scope
pub struct SearchBuilder<'a> {
    ctx: &'a SearchContext,
    resource_type: String,
    partition: RequestPartitionId,
    previously_added: HashSet<ResourcePid>,
    also_include_pids: Vec<ResourcePid>,
}

impl<'a> SearchBuilder<'a> {
    pub fn new(ctx: &'a SearchContext, resource_type: &str, partition: RequestPartitionId) -> Self {
        Self {
            ctx,
            resource_type: resource_type.to_string(),
            partition,
            previously_added: HashSet::new(),
            also_include_pids: Vec::new(),
        }
    }

    pub fn context(&self) -> &'a SearchContext {
        self.ctx
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn partition(&self) -> &RequestPartitionId {
        &self.partition
    }

    /// Pids already returned by an earlier page; the iterator skips them
    pub fn set_previously_added_resource_pids(&mut self, pids: impl IntoIterator<Item = ResourcePid>) {
        self.previously_added = pids.into_iter().collect();
    }

    pub fn previously_added_resource_pids(&self) -> &HashSet<ResourcePid> {
        &self.previously_added
    }

    /// Pids to return ahead of the query results (the `$everything` target itself)
    pub fn also_include_pids(&self) -> &[ResourcePid] {
        &self.also_include_pids
    }

    /// Lazily executed iterator over the matching pids
    pub fn search(self, params: SearchParameterMap) -> QueryIterator<'a> {
        QueryIterator::new(self, params)
    }

    /// One statement per pid chunk; a single statement unless full-text or
    /// `$everything` produced a pid list.
    pub fn create_query(&mut self, params: &SearchParameterMap, max_results: Option<usize>) -> Result<Vec<GeneratedSql>> {
        let stacks = self.build_stacks(params, true)?;
        Ok(stacks.into_iter().map(|stack| stack.generate(max_results)).collect())
    }

    pub fn create_count_query(&mut self, params: &SearchParameterMap) -> Result<Vec<GeneratedSql>> {
        if params.everything_mode.is_some() {
            return Err(SearchError::invalid("Counting is not supported for $everything").into());
        }
        let stacks = self.build_stacks(params, false)?;
        Ok(stacks.into_iter().map(QueryStack::generate_count).collect())
    }

    /// Number of distinct matching resources
    pub fn count(&mut self, params: &SearchParameterMap) -> Result<u64> {
        let mut total = 0u64;
        for sql in self.create_count_query(params)? {
            let rows = self.execute_rows(&sql, Some(1))?;
            total += rows.first().copied().unwrap_or_default().max(0) as u64;
        }
        Ok(total)
    }

    fn build_stacks(&mut self, params: &SearchParameterMap, with_sort: bool) -> Result<Vec<QueryStack<'a>>> {
        if !self.ctx.registry.is_resource_type(&self.resource_type) {
            return Err(SearchError::invalid(format!("Unknown resource type: {}", self.resource_type)).into());
        }
        self.also_include_pids.clear();

        if let Some(mode) = &params.everything_mode {
            return self.everything_stacks(params, mode);
        }

        if requires_fulltext(params) {
            let pids = self.fulltext_pids(params)?;
            if pids.is_empty() {
                return Ok(vec![self.match_nothing_stack()]);
            }
            let page = self.ctx.settings.maximum_page_size.max(1);
            return pids
                .chunks(page)
                .map(|chunk| self.search_stack(params, Some(chunk), with_sort))
                .collect();
        }

        Ok(vec![self.search_stack(params, None, with_sort)?])
    }

    fn fulltext_pids(&self, params: &SearchParameterMap) -> Result<Vec<ResourcePid>> {
        let Some(provider) = &self.ctx.fulltext else {
            let name = FULLTEXT_PARAMS
                .into_iter()
                .find(|p| params.contains_key(p))
                .unwrap_or("$lastn");
            return Err(SearchError::invalid(format!(
                "Fulltext search is not enabled on this service, can not process parameter: {name}"
            ))
            .into());
        };
        let pids = provider.search(&self.resource_type, params)?;
        debug!("Fulltext search for {} returned {} pids", self.resource_type, pids.len());
        Ok(pids)
    }

    fn match_nothing_stack(&self) -> QueryStack<'a> {
        let mut stack = QueryStack::new(self.ctx, &self.resource_type, self.partition.clone());
        stack.sql_mut().set_match_nothing();
        stack
    }

    fn search_stack(
        &self,
        params: &SearchParameterMap,
        pids: Option<&[ResourcePid]>,
        with_sort: bool,
    ) -> Result<QueryStack<'a>> {
        let mut stack = QueryStack::new(self.ctx, &self.resource_type, self.partition.clone());
        if let Some(pids) = pids {
            let sql = stack.sql_mut();
            let root = sql.resource_table(None);
            let placeholders = sql.bind_all(pids.iter().map(|p| p.id()));
            stack.add_predicate(Condition::equal_to_or_in(root.column(RES_ID), placeholders, false));
        }
        self.add_search_predicates(&mut stack, params)?;
        if with_sort && let Some(sort) = &params.sort {
            stack.add_sort(sort)?;
        }
        Ok(stack)
    }

    fn add_search_predicates(&self, stack: &mut QueryStack<'_>, params: &SearchParameterMap) -> Result<()> {
        if let Some(index_string) = self.combo_unique_index_string(params) {
            debug!("Search can be satisfied by unique index: {}", index_string);
            self.ctx
                .interceptor
                .perf_info(&format!("Using unique index for query for search: {index_string}"));
            stack.add_predicate_composite_unique(&index_string);
        } else {
            for (name, and_or) in params.iter() {
                if let Some(condition) = stack.search_for_ids_with_and_or(None, &self.resource_type, name, and_or)? {
                    stack.add_predicate(condition);
                }
            }
        }

        if let Some(range) = &params.last_updated
            && !range.is_empty()
        {
            let sql = stack.sql_mut();
            let table = sql.resource_table(None);
            if let Some(condition) = last_updated_predicate(sql, table, range) {
                sql.add_predicate(condition);
            }
        }
        Ok(())
    }

    /// Index string when every parameter is single-valued, unmodified and
    /// covered by one unique composite index
    fn combo_unique_index_string(&self, params: &SearchParameterMap) -> Option<String> {
        if !self.ctx.settings.unique_indexes_enabled
            || params.everything_mode.is_some()
            || params.is_empty()
            || !params.is_all_parameters_have_no_modifier()
        {
            return None;
        }
        let names: BTreeSet<String> = params.keys().map(str::to_string).collect();
        if names.iter().any(|n| n.starts_with('_')) {
            return None;
        }
        if self
            .ctx
            .registry
            .get_active_unique_search_params(&self.resource_type, &names)
            .is_empty()
        {
            return None;
        }

        let mut values = Vec::with_capacity(names.len());
        for (name, and_or) in params.iter() {
            let [or_list] = and_or.as_slice() else {
                return None;
            };
            let [value] = or_list.as_slice() else {
                return None;
            };
            values.push((name, combo_unique_value(value)?));
        }
        let pairs: Vec<(&str, &str)> = values.iter().map(|(n, v)| (*n, v.as_str())).collect();
        Some(combo_unique_index_string(&self.resource_type, &pairs))
    }

    fn everything_stacks(&mut self, params: &SearchParameterMap, mode: &EverythingMode) -> Result<Vec<QueryStack<'a>>> {
        let targets = match mode {
            EverythingMode::Instance(id) => {
                match self.ctx.resolver.resolve(&self.partition, &self.resource_type, id) {
                    Ok(pid) => vec![pid],
                    Err(e) if is_not_found(&e) => {
                        debug!("$everything target {}/{} not found", self.resource_type, id);
                        return Ok(vec![self.match_nothing_stack()]);
                    }
                    Err(e) => return Err(e),
                }
            }
            EverythingMode::Type => {
                let mut own = params.clone();
                own.everything_mode = None;
                own.sort = None;
                own.includes.clear();
                own.rev_includes.clear();
                let limit = self.ctx.settings.fetch_size_default_maximum;
                let mut seen = HashSet::new();
                let mut pids = Vec::new();
                for stack in self.build_stacks(&own, false)? {
                    for pid in self.execute_pids(&stack.generate(Some(limit)), None)? {
                        if seen.insert(pid) {
                            pids.push(pid);
                        }
                    }
                }
                pids
            }
        };
        if targets.is_empty() {
            return Ok(vec![self.match_nothing_stack()]);
        }

        let page = self.ctx.settings.maximum_page_size.max(1);
        let stacks: Vec<QueryStack<'a>> = targets
            .chunks(page)
            .map(|chunk| self.everything_stack(params, chunk))
            .collect();
        self.also_include_pids = targets;
        Ok(stacks)
    }

    /// Resources linking to `targets`, rooted on the link table
    fn everything_stack(&self, params: &SearchParameterMap, targets: &[ResourcePid]) -> QueryStack<'a> {
        let mut stack = QueryStack::new(self.ctx, &self.resource_type, self.partition.clone());
        let sql = stack.sql_mut();
        let link = sql.add_table(LINK_TABLE, "src_resource_id", None);
        let ids = sql.bind_all(targets.iter().map(|p| p.id()));
        let target_type = sql.bind(self.resource_type.as_str());
        let mut conditions = vec![
            Some(Condition::equal_to_or_in(link.column("target_resource_id"), ids, false)),
            Some(Condition::eq(link.column("target_resource_type"), target_type)),
            sql.partition_predicate(link),
        ];
        if let Some(range) = &params.last_updated
            && !range.is_empty()
        {
            let table = sql.resource_table(None);
            conditions.push(last_updated_predicate(sql, table, range));
        }
        if let Some(condition) = Condition::and(conditions) {
            sql.add_predicate(condition);
        }
        stack
    }

    /// Breadth-first `_include` / `_revinclude` expansion starting at `matches`.
    ///
    /// Returns the newly found pids in discovery order. Non-iterating
    /// includes take part in the first round only.
    pub fn load_includes(
        &self,
        matches: &[ResourcePid],
        includes: &[Include],
        reverse: bool,
        last_updated: Option<&DateRangeParam>,
    ) -> Result<Vec<ResourcePid>> {
        if matches.is_empty() || includes.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let page = self.ctx.settings.maximum_page_size.max(1);
        let mut seen: HashSet<ResourcePid> = matches.iter().copied().collect();
        let mut frontier = matches.to_vec();
        let mut remaining: Vec<&Include> = includes.iter().collect();
        let mut loaded = Vec::new();
        let mut rounds = 0;

        while !remaining.is_empty() && !frontier.is_empty() {
            rounds += 1;
            let mut found = Vec::new();
            for include in &remaining {
                for chunk in frontier.chunks(page) {
                    let sql = self.include_query(include, chunk, reverse, last_updated)?;
                    for pid in self.execute_pids(&sql, None)? {
                        if seen.insert(pid) {
                            found.push(pid);
                        }
                    }
                }
            }
            remaining.retain(|include| include.recurse);
            let found = self.ctx.interceptor.pre_access(found);
            loaded.extend(found.iter().copied());
            frontier = found;
        }

        let kind = if reverse { "_revincludes" } else { "_includes" };
        info!(
            "Loaded {} {} in {} rounds and {} ms",
            loaded.len(),
            kind,
            rounds,
            started.elapsed().as_millis()
        );
        Ok(loaded)
    }

    /// One hop of an include over the link table
    fn include_query(
        &self,
        include: &Include,
        pids: &[ResourcePid],
        reverse: bool,
        last_updated: Option<&DateRangeParam>,
    ) -> Result<GeneratedSql> {
        let (select_column, match_column) = if reverse {
            ("src_resource_id", "target_resource_id")
        } else {
            ("target_resource_id", "src_resource_id")
        };
        let mut sql = SearchQueryBuilder::new(
            &self.resource_type,
            self.partition.clone(),
            self.ctx.settings.partitioning.partitioning_enabled,
        );
        let link = sql.add_table(LINK_TABLE, select_column, None);
        let ids = sql.bind_all(pids.iter().map(|p| p.id()));
        let mut conditions = vec![Some(Condition::equal_to_or_in(link.column(match_column), ids, false))];

        let source_type = include.param_type().filter(|t| *t != "*");
        if let Some(source_type) = source_type {
            let value = sql.bind(source_type);
            conditions.push(Some(Condition::eq(link.column("source_resource_type"), value)));
        }
        if !include.is_wildcard() {
            let (Some(source_type), Some(name)) = (source_type, include.param_name()) else {
                return Err(SearchError::invalid(format!("Invalid _include parameter value: \"{}\"", include.value)).into());
            };
            let def = self
                .ctx
                .registry
                .get_active_search_param(source_type, name)
                .filter(|def| def.param_type == SearchParamType::Reference)
                .ok_or_else(|| {
                    SearchError::invalid(format!(
                        "Unknown reference search parameter \"{name}\" for resource type \"{source_type}\" in include \"{}\"",
                        include.value
                    ))
                })?;
            let paths = sql.bind_all(link_paths(source_type, &def));
            conditions.push(Some(Condition::equal_to_or_in(link.column("src_path"), paths, false)));
        }
        if let Some(target_type) = include.param_target_type() {
            let value = sql.bind(target_type);
            conditions.push(Some(Condition::eq(link.column("target_resource_type"), value)));
        }
        if !reverse {
            conditions.push(Some(Condition::IsNull {
                column: link.column("target_resource_id"),
                negate: true,
            }));
        }
        conditions.push(sql.partition_predicate(link));

        let resource = sql.add_table(RESOURCE_TABLE, RES_ID, None);
        conditions.push(Some(Condition::IsNull {
            column: resource.column("res_deleted_at"),
            negate: false,
        }));
        if reverse && let Some(range) = last_updated {
            conditions.push(last_updated_predicate(&mut sql, resource, range));
        }

        if let Some(condition) = Condition::and(conditions) {
            sql.add_predicate(condition);
        }
        Ok(sql.generate(None))
    }

    /// Run `sql` to completion and collect the pids
    pub(crate) fn execute_pids(&self, sql: &GeneratedSql, max_rows: Option<usize>) -> Result<Vec<ResourcePid>> {
        Ok(self.execute_rows(sql, max_rows)?.into_iter().map(ResourcePid).collect())
    }

    fn execute_rows(&self, sql: &GeneratedSql, max_rows: Option<usize>) -> Result<Vec<i64>> {
        if sql.match_nothing {
            return Ok(Vec::new());
        }
        self.capture_sql(sql);
        let mut cursor = self.ctx.executor.execute(sql, max_rows)?;
        let mut rows = Vec::new();
        let result = loop {
            match cursor.next_row() {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break Ok(rows),
                Err(e) => break Err(e),
            }
        };
        cursor.close();
        result
    }

    pub(crate) fn capture_sql(&self, sql: &GeneratedSql) {
        if self.ctx.interceptor.wants_raw_sql() {
            self.ctx.interceptor.raw_sql(sql);
        }
    }
}

/// Canonical value of a parameter eligible for the unique composite index
fn combo_unique_value(value: &ParamValue) -> Option<String> {
    match value {
        ParamValue::Token(token) if token.system.is_some() && token.value.is_some() => Some(value.value_as_query_token()),
        ParamValue::Reference(reference) if reference.chain.is_none() => match reference.target() {
            (Some(resource_type), id) => Some(format!("{resource_type}/{id}")),
            (None, _) => None,
        },
        ParamValue::Uri(uri) if uri.modifier.is_none() => Some(uri.value.clone()),
        _ => None,
    }
}

/// `res_updated` within the inclusive bounds of `range`
fn last_updated_predicate(sql: &mut SearchQueryBuilder, table: TableRef, range: &DateRangeParam) -> Option<Condition> {
    let column = table.column("res_updated");
    let low = range.low.map(|low| {
        let value = sql.bind(low);
        Condition::compare(column, BinaryOp::Ge, value)
    });
    let high = range.high.map(|high| {
        let value = sql.bind(high);
        Condition::compare(column, BinaryOp::Le, value)
    });
    Condition::and([low, high])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::SqliteRowExecutor;
    use crate::resolver::TypedId;
    use shirabe_core::search_param::{StringParam, TokenModifier, TokenParam};
    use shirabe_core::InMemorySearchParamRegistry;

    /// Resolver that knows no ids
    struct EmptyResolver;

    impl IdentifierResolver for EmptyResolver {
        fn resolve(&self, _scope: &RequestPartitionId, resource_type: &str, id: &str) -> Result<ResourcePid> {
            Err(SearchError::not_found(resource_type, id).into())
        }

        fn resolve_many(&self, _scope: &RequestPartitionId, _ids: &[TypedId]) -> Result<Vec<ResourcePid>> {
            Ok(Vec::new())
        }
    }

    struct FixedFulltext(Vec<ResourcePid>);

    impl FulltextSearchProvider for FixedFulltext {
        fn search(&self, _resource_type: &str, _params: &SearchParameterMap) -> Result<Vec<ResourcePid>> {
            Ok(self.0.clone())
        }
    }

    /// Context with the built-in registry and no database behind it
    pub fn test_context() -> SearchContext {
        SearchContext::new(
            SearchSettings::default(),
            Arc::new(InMemorySearchParamRegistry::new()),
            Arc::new(EmptyResolver),
            Arc::new(SqliteRowExecutor::new("shirabe-unit-tests.db")),
        )
    }

    fn token(system: &str, value: &str) -> ParamValue {
        ParamValue::Token(TokenParam::new(Some(system), Some(value)))
    }

    #[test]
    fn test_unconstrained_query() {
        let ctx = test_context();
        let mut builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let queries = builder.create_query(&SearchParameterMap::new(), Some(50)).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(
            queries[0].sql,
            "SELECT DISTINCT t0.res_id FROM hfj_resource t0 WHERE t0.res_type = ?1 AND t0.res_deleted_at IS NULL LIMIT 50"
        );
    }

    #[test]
    fn test_unknown_resource_type() {
        let ctx = test_context();
        let mut builder = SearchBuilder::new(&ctx, "Spaceship", RequestPartitionId::AllPartitions);
        let err = builder.create_query(&SearchParameterMap::new(), None).unwrap_err();
        assert_eq!(err.to_string(), "Unknown resource type: Spaceship");
    }

    #[test]
    fn test_last_updated_on_resource_table() {
        let ctx = test_context();
        let mut params = SearchParameterMap::new();
        params.last_updated = Some(DateRangeParam {
            low: Some(1000),
            high: None,
        });
        let mut builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let queries = builder.create_query(&params, None).unwrap();
        assert!(queries[0].sql.contains("t0.res_updated >= ?1"));
    }

    #[test]
    fn test_combo_unique_shortcut() {
        let mut registry = InMemorySearchParamRegistry::new();
        registry.register_unique_combo("Patient", &["gender", "identifier"]);
        let mut ctx = test_context();
        ctx.registry = Arc::new(registry);

        let params = SearchParameterMap::new()
            .and("identifier", token("urn:mrn", "7"))
            .and("gender", token("http://hl7.org/fhir/administrative-gender", "male"));
        let mut builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let queries = builder.create_query(&params, None).unwrap();
        assert_eq!(
            queries[0].sql,
            "SELECT DISTINCT t0.res_id FROM hfj_idx_cmp_string_uniq t0 WHERE t0.idx_string = ?1"
        );

        let mut negated = TokenParam::new(Some("urn:mrn"), Some("7"));
        negated.modifier = Some(TokenModifier::Not);
        let params = SearchParameterMap::new()
            .and("identifier", ParamValue::Token(negated))
            .and("gender", token("http://hl7.org/fhir/administrative-gender", "male"));
        let queries = builder.create_query(&params, None).unwrap();
        assert!(!queries[0].sql.contains("hfj_idx_cmp_string_uniq"));
    }

    #[test]
    fn test_combo_unique_skips_untyped_values() {
        let mut registry = InMemorySearchParamRegistry::new();
        registry.register_unique_combo("Patient", &["family", "gender"]);
        let mut ctx = test_context();
        ctx.registry = Arc::new(registry);
        let params = SearchParameterMap::new()
            .and("family", ParamValue::String(StringParam::new("smith")))
            .and("gender", token("http://hl7.org/fhir/administrative-gender", "male"));
        let mut builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let queries = builder.create_query(&params, None).unwrap();
        assert!(queries[0].sql.contains("hfj_spidx_string"));
    }

    #[test]
    fn test_fulltext_pids_are_chunked() {
        let mut ctx = test_context();
        ctx.settings.maximum_page_size = 2;
        let ctx = ctx.with_fulltext(Arc::new(FixedFulltext(vec![ResourcePid(1), ResourcePid(2), ResourcePid(3)])));
        let params = SearchParameterMap::new().and("_content", ParamValue::String(StringParam::new("fever")));
        let mut builder = SearchBuilder::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let queries = builder.create_query(&params, None).unwrap();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].sql.contains("t0.res_id IN (?1,?2)"));
        assert!(queries[1].sql.contains("t0.res_id = ?1"));
    }

    #[test]
    fn test_fulltext_empty_and_missing_provider() {
        let params = SearchParameterMap::new().and("_text", ParamValue::String(StringParam::new("fever")));

        let ctx = test_context();
        let mut builder = SearchBuilder::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let err = builder.create_query(&params, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Fulltext search is not enabled on this service, can not process parameter: _text"
        );

        let ctx = test_context().with_fulltext(Arc::new(FixedFulltext(Vec::new())));
        let mut builder = SearchBuilder::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let queries = builder.create_query(&params, None).unwrap();
        assert!(queries[0].match_nothing);
    }

    #[test]
    fn test_everything_unknown_instance_matches_nothing() {
        let ctx = test_context();
        let mut params = SearchParameterMap::new();
        params.everything_mode = Some(EverythingMode::Instance("404".to_string()));
        let mut builder = SearchBuilder::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let queries = builder.create_query(&params, None).unwrap();
        assert!(queries[0].match_nothing);
        assert!(builder.also_include_pids().is_empty());
        assert!(builder.create_count_query(&params).is_err());
    }

    #[test]
    fn test_include_query_shape() {
        let ctx = test_context();
        let builder = SearchBuilder::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let sql = builder
            .include_query(&Include::new("Observation:subject:Patient", false), &[ResourcePid(5)], false, None)
            .unwrap();
        assert!(sql.sql.starts_with("SELECT DISTINCT t0.target_resource_id FROM hfj_res_link t0"));
        assert!(sql.sql.contains("t0.src_path = ?3"));
        assert!(sql.sql.contains("t0.target_resource_type = ?4"));
        assert!(sql.sql.contains("t0.target_resource_id IS NOT NULL"));
        assert!(sql.sql.contains("t1.res_deleted_at IS NULL"));

        let err = builder
            .include_query(&Include::new("Observation:code", false), &[ResourcePid(5)], false, None)
            .unwrap_err();
        assert!(err.to_string().starts_with("Unknown reference search parameter \"code\""));
    }
}
