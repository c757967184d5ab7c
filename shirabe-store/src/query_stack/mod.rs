//! Lowering of parsed search parameters into SQL conditions.
//!
//! A [`QueryStack`] owns the statement being built plus a request-scoped
//! cache of joins keyed by (source column, builder type, parameter name).
//! Two AND-ed terms hitting the same key share one join, which makes them
//! constrain the same index row. Only date joins are shared by default;
//! stacks built for chains and `_has` share every type.

mod filter;
mod meta;
mod reference;
mod scalar;
mod sort;

pub(crate) use reference::link_paths;

use std::collections::{BTreeMap, HashMap};

use shirabe_core::search_param::ParamValue;
use shirabe_core::{CompareOp, RequestPartitionId, RuntimeSearchParam, SearchError, SearchParamType};
use tracing::trace;

use crate::error::Result;
use crate::fulltext::FULLTEXT_PARAMS;
use crate::hash::hash_presence;
use crate::index::coords::COORDS_TABLE;
use crate::index::date::DATE_TABLE;
use crate::index::number::{NUMBER_TABLE, QUANTITY_TABLE};
use crate::index::string::STRING_TABLE;
use crate::index::token::TOKEN_TABLE;
use crate::index::uri::URI_TABLE;
use crate::index::{
    missing_predicate, HashContext, COMBO_UNIQUE_TABLE, LINK_TABLE, PARAM_PRESENT_TABLE, RES_ID,
};
use crate::search_builder::SearchContext;
use crate::sql::{ColumnRef, Condition, GeneratedSql, SearchQueryBuilder, TableRef};

/// Predicate builders whose joins can be shared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredicateBuilderType {
    Coords,
    Date,
    Number,
    Quantity,
    Reference,
    String,
    Token,
    Uri,
}

impl PredicateBuilderType {
    fn table_name(self) -> &'static str {
        match self {
            Self::Coords => COORDS_TABLE,
            Self::Date => DATE_TABLE,
            Self::Number => NUMBER_TABLE,
            Self::Quantity => QUANTITY_TABLE,
            Self::Reference => LINK_TABLE,
            Self::String => STRING_TABLE,
            Self::Token => TOKEN_TABLE,
            Self::Uri => URI_TABLE,
        }
    }

    fn res_id_column(self) -> &'static str {
        match self {
            Self::Reference => "src_resource_id",
            _ => RES_ID,
        }
    }
}

/// Which builder types may be served from the join cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinReuse {
    DateOnly,
    Full,
}

impl JoinReuse {
    fn allows(self, kind: PredicateBuilderType) -> bool {
        match self {
            Self::DateOnly => kind == PredicateBuilderType::Date,
            Self::Full => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JoinKey {
    source: Option<ColumnRef>,
    kind: PredicateBuilderType,
    param_name: String,
}

pub struct QueryStack<'a> {
    ctx: &'a SearchContext,
    sql: SearchQueryBuilder,
    reuse: JoinReuse,
    joins: HashMap<JoinKey, TableRef>,
}

impl<'a> QueryStack<'a> {
    pub fn new(ctx: &'a SearchContext, resource_type: &str, partition: RequestPartitionId) -> Self {
        let sql = SearchQueryBuilder::new(
            resource_type,
            partition,
            ctx.settings.partitioning.partitioning_enabled,
        );
        Self {
            ctx,
            sql,
            reuse: JoinReuse::DateOnly,
            joins: HashMap::new(),
        }
    }

    pub fn with_reuse(mut self, reuse: JoinReuse) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn sql(&self) -> &SearchQueryBuilder {
        &self.sql
    }

    pub fn sql_mut(&mut self) -> &mut SearchQueryBuilder {
        &mut self.sql
    }

    pub fn add_predicate(&mut self, condition: Condition) {
        self.sql.add_predicate(condition);
    }

    pub fn generate(self, limit: Option<usize>) -> GeneratedSql {
        self.sql.generate(limit)
    }

    pub fn generate_count(self) -> GeneratedSql {
        self.sql.generate_count()
    }

    /// Stack for a subquery over `resource_type`; hand it back with [`QueryStack::finish_child`]
    fn child(&mut self, resource_type: &str) -> QueryStack<'a> {
        QueryStack {
            ctx: self.ctx,
            sql: self.sql.child(resource_type),
            reuse: JoinReuse::Full,
            joins: HashMap::new(),
        }
    }

    fn finish_child(&mut self, child: QueryStack<'a>) -> Option<String> {
        self.sql.finish_child(child.sql)
    }

    fn hash_context<'n>(&self, resource_type: &'n str, param_name: &'n str) -> HashContext<'n> {
        HashContext {
            partition: self.ctx.settings.partitioning.hash_partition(self.sql.partition()),
            resource_type,
            param_name,
        }
    }

    /// The join for `(source, kind, param_name)`; the flag is true on a cache hit
    fn join(&mut self, source: Option<ColumnRef>, kind: PredicateBuilderType, param_name: &str) -> (TableRef, bool) {
        let key = JoinKey {
            source,
            kind,
            param_name: param_name.to_string(),
        };
        let reusable = self.reuse.allows(kind);
        if reusable && let Some(table) = self.joins.get(&key) {
            trace!("Reusing {} join for {}", kind.table_name(), param_name);
            return (*table, true);
        }
        let table = self.sql.add_table(kind.table_name(), kind.res_id_column(), source);
        if reusable {
            self.joins.insert(key, table);
        }
        (table, false)
    }

    /// `source`, or the root pid (creating a resource-table root if needed)
    fn source_column(&mut self, source: Option<ColumnRef>) -> ColumnRef {
        match source {
            Some(column) => column,
            None => {
                let root = self.sql.ensure_root();
                self.sql.root_pid_column().unwrap_or_else(|| root.column(RES_ID))
            }
        }
    }

    fn check_partition_hash_support(&self) -> Result<()> {
        let partitioning = &self.ctx.settings.partitioning;
        if partitioning.partitioning_enabled
            && partitioning.include_partition_in_search_hashes
            && self.sql.partition().is_all_partitions()
        {
            return Err(SearchError::PreconditionFailed(
                "This server is not configured to support search against all partitions".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Condition for every AND-group of one parameter, `None` when it adds no constraint.
    ///
    /// `source` is the column the index tables are joined on; `None` means
    /// the root pid of this stack.
    pub fn search_for_ids_with_and_or(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        param_name: &str,
        and_or: &[Vec<ParamValue>],
    ) -> Result<Option<Condition>> {
        match param_name {
            "_id" => return self.resource_id_predicate(source, resource_type, and_or, None),
            "_language" => return self.language_predicate(source, and_or, None),
            "_has" => return self.has_predicate(source, resource_type, and_or),
            "_tag" | "_profile" | "_security" => return self.tag_predicate(source, resource_type, param_name, and_or),
            "_source" => return self.source_predicate(source, and_or),
            "_filter" => return self.filter_predicate(source, resource_type, and_or),
            _ => {}
        }

        if FULLTEXT_PARAMS.contains(&param_name) {
            if self.ctx.fulltext.is_none() {
                return Err(SearchError::invalid(format!(
                    "Fulltext search is not enabled on this service, can not process parameter: {param_name}"
                ))
                .into());
            }
            // answered by the fulltext provider before SQL is built
            return Ok(None);
        }

        let Some(def) = self
            .ctx
            .registry
            .get_active_search_param(resource_type, param_name)
        else {
            let valid: Vec<String> = self
                .ctx
                .registry
                .get_active_search_params(resource_type)
                .into_keys()
                .collect();
            return Err(SearchError::invalid(format!(
                "Unknown search parameter \"{param_name}\" for resource type \"{resource_type}\". Valid search parameters for this search are: [{}]",
                valid.join(", ")
            ))
            .into());
        };

        self.check_partition_hash_support()?;

        let mut conditions = Vec::with_capacity(and_or.len());
        for or_list in and_or {
            conditions.push(self.predicate_for_or_list(source, resource_type, &def, or_list, None)?);
        }
        Ok(Condition::and(conditions))
    }

    /// One OR-group of a registered parameter. `op` overrides the values'
    /// own prefixes (`_filter` operators).
    fn predicate_for_or_list(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[ParamValue],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let Some(first) = values.first() else {
            return Ok(None);
        };
        if let Some(missing) = first.missing() {
            return self.missing_value_predicate(source, resource_type, def, missing).map(Some);
        }

        match def.param_type {
            SearchParamType::String => {
                let values = values_of(def, values, |v| match v {
                    ParamValue::String(p) => Some(p),
                    _ => None,
                })?;
                self.string_predicate(source, resource_type, def, &values, op)
            }
            SearchParamType::Token => {
                let values = values_of(def, values, |v| match v {
                    ParamValue::Token(p) => Some(p),
                    _ => None,
                })?;
                self.token_predicate(source, resource_type, def, &values, op)
            }
            SearchParamType::Number => {
                let values = values_of(def, values, |v| match v {
                    ParamValue::Number(p) => Some(p),
                    _ => None,
                })?;
                self.number_predicate(source, resource_type, def, &values, op)
            }
            SearchParamType::Quantity => {
                let values = values_of(def, values, |v| match v {
                    ParamValue::Quantity(p) => Some(p),
                    _ => None,
                })?;
                self.quantity_predicate(source, resource_type, def, &values, op)
            }
            SearchParamType::Date => {
                let values = values_of(def, values, |v| match v {
                    ParamValue::Date(p) => Some(p),
                    _ => None,
                })?;
                self.date_predicate(source, resource_type, def, &values, op)
            }
            SearchParamType::Uri => {
                let values = values_of(def, values, |v| match v {
                    ParamValue::Uri(p) => Some(p),
                    _ => None,
                })?;
                self.uri_predicate(source, resource_type, def, &values, op)
            }
            SearchParamType::Reference => {
                if let Some(op) = op
                    && op != CompareOp::Eq
                {
                    return Err(unsupported_filter_operator(op));
                }
                let values = values_of(def, values, |v| match v {
                    ParamValue::Reference(p) => Some(p),
                    _ => None,
                })?;
                self.reference_predicate(source, resource_type, def, &values)
            }
            SearchParamType::Composite => {
                let values = values_of(def, values, |v| match v {
                    ParamValue::Composite(p) => Some(p),
                    _ => None,
                })?;
                self.composite_predicate(source, resource_type, def, &values)
            }
            SearchParamType::Special => {
                let values = values_of(def, values, |v| match v {
                    ParamValue::Special(p) => Some(p),
                    _ => None,
                })?;
                self.coords_predicate(source, resource_type, def, &values)
            }
        }
    }

    /// `:missing=true|false`
    fn missing_value_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        missing: bool,
    ) -> Result<Condition> {
        let table_name = match def.param_type {
            SearchParamType::String => STRING_TABLE,
            SearchParamType::Token => TOKEN_TABLE,
            SearchParamType::Number => NUMBER_TABLE,
            SearchParamType::Quantity => QUANTITY_TABLE,
            SearchParamType::Date => DATE_TABLE,
            SearchParamType::Uri => URI_TABLE,
            SearchParamType::Special => COORDS_TABLE,
            SearchParamType::Reference => {
                return Ok(self.reference_missing_predicate(source, resource_type, def, missing));
            }
            SearchParamType::Composite => {
                return Err(SearchError::invalid(format!(
                    "The :missing modifier is not supported for composite parameter \"{}\"",
                    def.name
                ))
                .into());
            }
        };
        let source = self.source_column(source);
        let ctx = self.hash_context(resource_type, &def.name);
        Ok(missing_predicate(&mut self.sql, table_name, source, &ctx, missing))
    }

    /// References record their presence in a dedicated table
    fn reference_missing_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        missing: bool,
    ) -> Condition {
        let source = self.source_column(source);
        let partition = self.hash_context(resource_type, &def.name).partition;
        let mut child = self.sql.child(resource_type);
        let table = child.add_table(PARAM_PRESENT_TABLE, RES_ID, None);
        let hash = child.bind(hash_presence(partition, resource_type, &def.name, true));
        let present = Condition::eq(table.column("hash_presence"), hash);
        let partition = child.partition_predicate(table);
        if let Some(condition) = Condition::and([Some(present), partition]) {
            child.add_predicate(condition);
        }
        match self.sql.finish_child(child) {
            Some(subquery) => Condition::in_subquery(source, subquery, missing),
            None => Condition::Never,
        }
    }

    /// Exact match against a composite unique index string
    pub fn add_predicate_composite_unique(&mut self, index_string: &str) {
        let table = self.sql.add_table(COMBO_UNIQUE_TABLE, RES_ID, None);
        let value = self.sql.bind(index_string);
        let matches = Condition::eq(table.column("idx_string"), value);
        let partition = self.sql.partition_predicate(table);
        if let Some(condition) = Condition::and([Some(matches), partition]) {
            self.sql.add_predicate(condition);
        }
    }
}

/// Canonical string stored in the composite unique index:
/// `Type?a=x&b=y` with parameter names sorted and values URL-escaped
pub fn combo_unique_index_string(resource_type: &str, values: &[(&str, &str)]) -> String {
    let sorted: BTreeMap<&str, &str> = values.iter().copied().collect();
    let query: Vec<String> = sorted
        .into_iter()
        .map(|(name, value)| format!("{name}={}", urlencoding::encode(value)))
        .collect();
    format!("{resource_type}?{}", query.join("&"))
}

fn values_of<'v, T>(
    def: &RuntimeSearchParam,
    values: &'v [ParamValue],
    pick: impl Fn(&'v ParamValue) -> Option<&'v T>,
) -> Result<Vec<&'v T>> {
    values
        .iter()
        .map(|value| {
            pick(value).ok_or_else(|| {
                SearchError::invalid(format!(
                    "Invalid {} for {} parameter \"{}\"",
                    value.kind(),
                    def.param_type.as_str().to_ascii_lowercase(),
                    def.name
                ))
                .into()
            })
        })
        .collect()
}

fn unsupported_filter_operator(op: CompareOp) -> crate::error::StoreError {
    SearchError::invalid(format!("Unsupported operator specified in _filter clause: {op}")).into()
}
