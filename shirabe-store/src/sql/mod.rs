//! SQL statement assembly.
//!
//! Tables are registered in the order predicates need them: the first becomes
//! the root (`FROM`), later ones are joined onto the root pid (or an explicit
//! source column). Placeholders are numbered (`?N`) and the Nth call to
//! [`SearchQueryBuilder::bind`] always corresponds to the Nth bind variable.

pub mod condition;

use std::fmt;
use std::mem;

use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;
use shirabe_core::{RequestPartitionId, SortOrder};

pub use condition::{BinaryOp, Condition};

use crate::index::{PARTITION_ID, RESOURCE_TABLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableRef {
    id: u32,
    name: &'static str,
}

impl TableRef {
    pub(crate) fn new(id: u32, name: &'static str) -> Self {
        Self { id, name }
    }

    pub fn name(self) -> &'static str {
        self.name
    }

    pub fn alias(self) -> String {
        format!("t{}", self.id)
    }

    pub fn column(self, column: &'static str) -> ColumnRef {
        ColumnRef {
            table: self,
            column,
        }
    }
}

/// A column of one joined table instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: TableRef,
    pub column: &'static str,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}.{}", self.table.id, self.column)
    }
}

/// Numbered placeholder `?N`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder(pub usize);

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Long(i64),
    Int(i32),
    Text(String),
    Double(f64),
}

impl From<i64> for BindValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<i32> for BindValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for BindValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<String> for BindValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for BindValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl ToSql for BindValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Long(v) => ToSqlOutput::from(*v),
            Self::Int(v) => ToSqlOutput::from(*v),
            Self::Text(v) => ToSqlOutput::from(v.as_str()),
            Self::Double(v) => ToSqlOutput::from(*v),
        })
    }
}

impl fmt::Display for BindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
            Self::Double(v) => write!(f, "{v}"),
        }
    }
}

/// Final statement plus its bind variables
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSql {
    pub sql: String,
    pub bind_variables: Vec<BindValue>,
    /// When set, the statement must not be executed: the result is empty
    pub match_nothing: bool,
}

impl GeneratedSql {
    pub fn match_nothing() -> Self {
        Self {
            sql: String::new(),
            bind_variables: Vec::new(),
            match_nothing: true,
        }
    }

    pub fn new(sql: impl Into<String>, bind_variables: Vec<BindValue>) -> Self {
        Self {
            sql: sql.into(),
            bind_variables,
            match_nothing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinType {
    Root,
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone)]
struct JoinedTable {
    table: TableRef,
    res_id_column: &'static str,
    join: JoinType,
    on: Vec<Condition>,
}

/// Accumulates tables, predicates and sort columns of one (sub)query
#[derive(Debug)]
pub struct SearchQueryBuilder {
    resource_type: String,
    partition: RequestPartitionId,
    partitioning_enabled: bool,
    tables: Vec<JoinedTable>,
    predicates: Vec<Condition>,
    order_by: Vec<(ColumnRef, SortOrder)>,
    binds: Vec<BindValue>,
    next_table_id: u32,
    match_nothing: bool,
    /// Bind count and next alias of the parent when this child was created
    parent_marks: (usize, u32),
}

impl SearchQueryBuilder {
    pub fn new(
        resource_type: &str,
        partition: RequestPartitionId,
        partitioning_enabled: bool,
    ) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            partition,
            partitioning_enabled,
            tables: Vec::new(),
            predicates: Vec::new(),
            order_by: Vec::new(),
            binds: Vec::new(),
            next_table_id: 0,
            match_nothing: false,
            parent_marks: (0, 0),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn partition(&self) -> &RequestPartitionId {
        &self.partition
    }

    /// Builder for a subquery; it shares bind numbering and table aliases
    /// with `self` until handed back through [`SearchQueryBuilder::finish_child`].
    pub fn child(&mut self, resource_type: &str) -> SearchQueryBuilder {
        SearchQueryBuilder {
            resource_type: resource_type.to_string(),
            partition: self.partition.clone(),
            partitioning_enabled: self.partitioning_enabled,
            tables: Vec::new(),
            predicates: Vec::new(),
            order_by: Vec::new(),
            parent_marks: (self.binds.len(), self.next_table_id),
            binds: mem::take(&mut self.binds),
            next_table_id: self.next_table_id,
            match_nothing: false,
        }
    }

    /// Take back a child's binds and return its `SELECT` text, or `None`
    /// when the child can match nothing. A dropped child leaves neither
    /// binds nor aliases behind.
    pub fn finish_child(&mut self, mut child: SearchQueryBuilder) -> Option<String> {
        if child.match_nothing {
            let (bind_count, table_id) = child.parent_marks;
            child.binds.truncate(bind_count);
            self.binds = mem::take(&mut child.binds);
            self.next_table_id = table_id;
            return None;
        }
        child.ensure_root();
        let sql = child.render(false, None);
        self.binds = mem::take(&mut child.binds);
        self.next_table_id = child.next_table_id;
        Some(sql)
    }

    fn register(&mut self, name: &'static str, res_id_column: &'static str, join: JoinType) -> TableRef {
        let table = TableRef::new(self.next_table_id, name);
        self.next_table_id += 1;
        self.tables.push(JoinedTable {
            table,
            res_id_column,
            join,
            on: Vec::new(),
        });
        table
    }

    /// Add a table; joined on `source` (default: the root pid) unless it is the first
    pub fn add_table(
        &mut self,
        name: &'static str,
        res_id_column: &'static str,
        source: Option<ColumnRef>,
    ) -> TableRef {
        let Some(target) = source.or_else(|| self.root_pid_column()) else {
            return self.register(name, res_id_column, JoinType::Root);
        };
        let table = self.register(name, res_id_column, JoinType::Inner);
        self.add_join_condition(table, Condition::ColumnsEqual(table.column(res_id_column), target));
        table
    }

    /// Left outer join used for sorting; never reused
    pub fn add_outer_join(&mut self, name: &'static str, res_id_column: &'static str) -> TableRef {
        let target = self.ensure_root().column(self.tables[0].res_id_column);
        let table = self.register(name, res_id_column, JoinType::LeftOuter);
        self.add_join_condition(table, Condition::ColumnsEqual(table.column(res_id_column), target));
        table
    }

    pub fn add_join_condition(&mut self, table: TableRef, condition: Condition) {
        if let Some(joined) = self.tables.iter_mut().find(|t| t.table == table) {
            joined.on.push(condition);
        }
    }

    pub fn root(&self) -> Option<TableRef> {
        self.tables.first().map(|t| t.table)
    }

    pub fn root_pid_column(&self) -> Option<ColumnRef> {
        self.tables.first().map(|t| t.table.column(t.res_id_column))
    }

    /// The root table, creating a resource-table root when nothing was added yet
    pub fn ensure_root(&mut self) -> TableRef {
        match self.root() {
            Some(root) => root,
            None => self.add_table(RESOURCE_TABLE, "res_id", None),
        }
    }

    /// Resource table joined at `source` (or the root), reusing the root when it already is one
    pub fn resource_table(&mut self, source: Option<ColumnRef>) -> TableRef {
        if let Some(root) = self.root()
            && root.name() == RESOURCE_TABLE
            && source.is_none_or(|s| s == root.column("res_id"))
        {
            return root;
        }
        self.add_table(RESOURCE_TABLE, "res_id", source)
    }

    /// Register a bind variable and return its placeholder
    pub fn bind(&mut self, value: impl Into<BindValue>) -> Placeholder {
        self.binds.push(value.into());
        Placeholder(self.binds.len())
    }

    pub fn bind_all<T: Into<BindValue>>(&mut self, values: impl IntoIterator<Item = T>) -> Vec<Placeholder> {
        values.into_iter().map(|v| self.bind(v)).collect()
    }

    pub fn add_predicate(&mut self, condition: Condition) {
        self.predicates.push(condition);
    }

    pub fn have_at_least_one_predicate(&self) -> bool {
        !self.predicates.is_empty()
    }

    pub fn add_order_by(&mut self, column: ColumnRef, order: SortOrder) {
        self.order_by.push((column, order));
    }

    pub fn set_match_nothing(&mut self) {
        self.match_nothing = true;
    }

    pub fn is_match_nothing(&self) -> bool {
        self.match_nothing
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Partition restriction for a table, `None` when it would be a no-op
    pub fn partition_predicate(&mut self, table: TableRef) -> Option<Condition> {
        if !self.partitioning_enabled {
            return None;
        }
        let column = table.column(PARTITION_ID);
        match self.partition.clone() {
            RequestPartitionId::AllPartitions => None,
            RequestPartitionId::Default => Some(Condition::IsNull {
                column,
                negate: false,
            }),
            RequestPartitionId::Partition(id) => {
                let value = self.bind(id);
                Some(Condition::eq(column, value))
            }
        }
    }

    fn root_predicates(&mut self) -> Vec<Condition> {
        let root = self.ensure_root();
        let mut extra = Vec::new();
        if root.name() == RESOURCE_TABLE {
            let resource_type = self.resource_type.clone();
            let value = self.bind(resource_type);
            extra.push(Condition::eq(root.column("res_type"), value));
            extra.push(Condition::IsNull {
                column: root.column("res_deleted_at"),
                negate: false,
            });
        }
        if (self.predicates.is_empty() || root.name() == RESOURCE_TABLE)
            && let Some(partition) = self.partition_predicate(root)
        {
            extra.push(partition);
        }
        extra
    }

    fn render(&mut self, with_sort_columns: bool, limit: Option<usize>) -> String {
        let mut where_clause = self.root_predicates();
        where_clause.extend(self.predicates.iter().cloned());
        let root_pid = self.root_pid_column().unwrap_or_else(|| self.ensure_root().column("res_id"));

        let mut sql = format!("SELECT DISTINCT {root_pid}");
        if with_sort_columns {
            for (column, _) in &self.order_by {
                sql.push_str(&format!(", {column}"));
            }
        }
        self.render_from(&mut sql, &where_clause);

        if with_sort_columns && !self.order_by.is_empty() {
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|(column, order)| match order {
                    SortOrder::Asc => format!("{column} ASC NULLS LAST"),
                    SortOrder::Desc => format!("{column} DESC NULLS FIRST"),
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    fn render_from(&self, sql: &mut String, where_clause: &[Condition]) {
        for joined in &self.tables {
            let keyword = match joined.join {
                JoinType::Root => " FROM",
                JoinType::Inner => " INNER JOIN",
                JoinType::LeftOuter => " LEFT OUTER JOIN",
            };
            sql.push_str(&format!(
                "{keyword} {} {}",
                joined.table.name(),
                joined.table.alias()
            ));
            if let Some(on) = Condition::and(joined.on.iter().cloned().map(Some)) {
                sql.push_str(&format!(" ON {on}"));
            }
        }
        if let Some(condition) = Condition::and(where_clause.iter().cloned().map(Some)) {
            let rendered = condition.to_string();
            let rendered = match condition {
                // top-level AND renders without the outer parentheses
                Condition::And(_) => rendered[1..rendered.len() - 1].to_string(),
                _ => rendered,
            };
            sql.push_str(" WHERE ");
            sql.push_str(&rendered);
        }
    }

    /// Final `SELECT DISTINCT pid [, sort columns] ... [ORDER BY] [LIMIT]`
    pub fn generate(mut self, limit: Option<usize>) -> GeneratedSql {
        if self.match_nothing {
            return GeneratedSql::match_nothing();
        }
        let sql = self.render(true, limit);
        GeneratedSql::new(sql, self.binds)
    }

    /// `SELECT COUNT(DISTINCT pid) ...`
    pub fn generate_count(mut self) -> GeneratedSql {
        if self.match_nothing {
            return GeneratedSql::match_nothing();
        }
        let mut where_clause = self.root_predicates();
        where_clause.extend(self.predicates.iter().cloned());
        let root_pid = self.root_pid_column().unwrap_or_else(|| self.ensure_root().column("res_id"));
        let mut sql = format!("SELECT COUNT(DISTINCT {root_pid})");
        self.render_from(&mut sql, &where_clause);
        GeneratedSql::new(sql, self.binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> SearchQueryBuilder {
        SearchQueryBuilder::new("Patient", RequestPartitionId::AllPartitions, false)
    }

    #[test]
    fn test_unconstrained_search_roots_on_resource_table() {
        let sql = builder().generate(None);
        assert_eq!(
            sql.sql,
            "SELECT DISTINCT t0.res_id FROM hfj_resource t0 WHERE t0.res_type = ?1 AND t0.res_deleted_at IS NULL"
        );
        assert_eq!(sql.bind_variables, vec![BindValue::Text("Patient".into())]);
    }

    #[test]
    fn test_joins_follow_root() {
        let mut sql = builder();
        let token = sql.add_table("hfj_spidx_token", "res_id", None);
        let date = sql.add_table("hfj_spidx_date", "res_id", None);
        let a = sql.bind(1i64);
        let b = sql.bind(2i64);
        sql.add_predicate(Condition::eq(token.column("hash_value"), a));
        sql.add_predicate(Condition::compare(date.column("sp_value_low"), BinaryOp::Ge, b));
        let generated = sql.generate(Some(10));
        assert_eq!(
            generated.sql,
            "SELECT DISTINCT t0.res_id FROM hfj_spidx_token t0 INNER JOIN hfj_spidx_date t1 ON t1.res_id = t0.res_id WHERE t0.hash_value = ?1 AND t1.sp_value_low >= ?2 LIMIT 10"
        );
        assert_eq!(generated.bind_variables.len(), 2);
    }

    #[test]
    fn test_partition_injected_without_predicates() {
        let mut sql = SearchQueryBuilder::new("Patient", RequestPartitionId::Partition(7), true);
        sql.add_table("hfj_spidx_token", "res_id", None);
        let generated = sql.generate(None);
        assert!(generated.sql.ends_with("WHERE t0.partition_id = ?1"));
        assert_eq!(generated.bind_variables, vec![BindValue::Int(7)]);

        let generated = SearchQueryBuilder::new("Patient", RequestPartitionId::Default, true).generate(None);
        assert!(generated.sql.contains("t0.partition_id IS NULL"));
    }

    #[test]
    fn test_child_shares_numbering() {
        let mut sql = builder();
        let root = sql.resource_table(None);
        let first = sql.bind(10i64);
        let mut child = sql.child("Observation");
        let link = child.add_table("hfj_res_link", "target_resource_id", None);
        let value = child.bind("Observation.subject");
        child.add_predicate(Condition::eq(link.column("src_path"), value));
        let sub = sql.finish_child(child).unwrap();
        assert_eq!(
            sub,
            "SELECT DISTINCT t1.target_resource_id FROM hfj_res_link t1 WHERE t1.src_path = ?2"
        );
        sql.add_predicate(Condition::in_subquery(root.column("res_id"), sub, false));
        let second = sql.bind(20i64);
        assert_eq!(first, Placeholder(1));
        assert_eq!(second, Placeholder(3));
        let generated = sql.generate(None);
        assert_eq!(generated.bind_variables.len(), 4);
        assert_eq!(generated.bind_variables[1], BindValue::Text("Observation.subject".into()));
    }

    #[test]
    fn test_dropped_child_releases_binds_and_aliases() {
        let mut sql = builder();
        let root = sql.resource_table(None);
        let first = sql.bind(10i64);
        let mut child = sql.child("Observation");
        child.add_table("hfj_res_link", "target_resource_id", None);
        child.bind("Observation.subject");
        child.set_match_nothing();
        assert_eq!(sql.finish_child(child), None);

        let token = sql.add_table("hfj_spidx_token", "res_id", None);
        let second = sql.bind(20i64);
        sql.add_predicate(Condition::eq(root.column("res_id"), first));
        sql.add_predicate(Condition::eq(token.column("hash_value"), second));
        assert_eq!(second, Placeholder(2));
        assert_eq!(token.alias(), "t1");
        let generated = sql.generate(None);
        assert_eq!(
            generated.bind_variables,
            vec![BindValue::Long(10), BindValue::Long(20), BindValue::Text("Patient".into())]
        );
        assert!(generated.sql.contains("t1.hash_value = ?2"));
    }

    #[test]
    fn test_match_nothing_skips_sql() {
        let mut sql = builder();
        sql.set_match_nothing();
        let generated = sql.generate(None);
        assert!(generated.match_nothing);
        assert!(generated.sql.is_empty());
    }

    #[test]
    fn test_sort_columns_selected_and_ordered() {
        let mut sql = builder();
        sql.resource_table(None);
        let sort = sql.add_outer_join("hfj_spidx_string", "res_id");
        sql.add_order_by(sort.column("sp_value_normalized"), SortOrder::Desc);
        let generated = sql.generate(None);
        assert!(generated.sql.starts_with("SELECT DISTINCT t0.res_id, t1.sp_value_normalized FROM"));
        assert!(generated.sql.contains("LEFT OUTER JOIN hfj_spidx_string t1 ON t1.res_id = t0.res_id"));
        assert!(generated.sql.ends_with("ORDER BY t1.sp_value_normalized DESC NULLS FIRST"));
    }

    #[test]
    fn test_count_query() {
        let generated = builder().generate_count();
        assert!(generated.sql.starts_with("SELECT COUNT(DISTINCT t0.res_id) FROM hfj_resource t0"));
    }
}
