//! Index table descriptors.
//!
//! Each indexed value kind lives in its own table. A descriptor wraps one
//! joined instance of such a table and knows how to express "value matches"
//! and "hash identity matches" over its columns.

pub mod coords;
pub mod date;
pub mod number;
pub mod string;
pub mod token;
pub mod uri;

use crate::hash;
use crate::sql::{ColumnRef, Condition, SearchQueryBuilder, TableRef};

pub const RESOURCE_TABLE: &str = "hfj_resource";
pub const LINK_TABLE: &str = "hfj_res_link";
pub const TAG_TABLE: &str = "hfj_res_tag";
pub const SOURCE_TABLE: &str = "hfj_res_ver_prov";
pub const PARAM_PRESENT_TABLE: &str = "hfj_res_param_present";
pub const COMBO_UNIQUE_TABLE: &str = "hfj_idx_cmp_string_uniq";

pub const PARTITION_ID: &str = "partition_id";
pub const RES_ID: &str = "res_id";
pub const HASH_IDENTITY: &str = "hash_identity";

/// Names needed to compute hash identities for one parameter
#[derive(Debug, Clone, Copy)]
pub struct HashContext<'a> {
    pub partition: Option<i32>,
    pub resource_type: &'a str,
    pub param_name: &'a str,
}

impl HashContext<'_> {
    pub fn identity(&self) -> i64 {
        hash::hash_identity(self.partition, self.resource_type, self.param_name)
    }

    pub fn hash(&self, values: &[&str]) -> i64 {
        hash::hash_search_param(self.partition, self.resource_type, self.param_name, values)
    }
}

/// A per-value-kind index table carrying `res_id`, `partition_id` and `hash_identity`
pub trait IndexTable {
    const TABLE_NAME: &'static str;

    fn table(&self) -> TableRef;

    fn res_id(&self) -> ColumnRef {
        self.table().column(RES_ID)
    }

    fn hash_identity_predicate(&self, sql: &mut SearchQueryBuilder, ctx: &HashContext<'_>) -> Condition {
        let value = sql.bind(ctx.identity());
        Condition::eq(self.table().column(HASH_IDENTITY), value)
    }

    /// AND a partition restriction onto `condition`; no-op without partitioning
    /// or when every partition may be searched
    fn combine_with_partition(
        &self,
        sql: &mut SearchQueryBuilder,
        condition: Option<Condition>,
    ) -> Option<Condition> {
        let partition = sql.partition_predicate(self.table());
        Condition::and([partition, condition])
    }

    fn combine_with_hash_identity(
        &self,
        sql: &mut SearchQueryBuilder,
        ctx: &HashContext<'_>,
        condition: Option<Condition>,
    ) -> Option<Condition> {
        let identity = self.hash_identity_predicate(sql, ctx);
        self.combine_with_partition(sql, Condition::and([Some(identity), condition]))
    }
}

/// `source IN / NOT IN (SELECT res_id FROM <table> WHERE hash_identity = ?)`.
///
/// `missing = true` keeps resources without any row for the parameter.
pub fn missing_predicate(
    sql: &mut SearchQueryBuilder,
    table_name: &'static str,
    source: ColumnRef,
    ctx: &HashContext<'_>,
    missing: bool,
) -> Condition {
    let mut child = sql.child(ctx.resource_type);
    let table = child.add_table(table_name, RES_ID, None);
    let value = child.bind(ctx.identity());
    let identity = Condition::eq(table.column(HASH_IDENTITY), value);
    let partition = child.partition_predicate(table);
    if let Some(condition) = Condition::and([Some(identity), partition]) {
        child.add_predicate(condition);
    }
    match sql.finish_child(child) {
        Some(subquery) => Condition::in_subquery(source, subquery, missing),
        None => Condition::Never,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shirabe_core::RequestPartitionId;

    #[test]
    fn test_missing_predicate_shapes() {
        let mut sql = SearchQueryBuilder::new("Patient", RequestPartitionId::AllPartitions, false);
        let root = sql.resource_table(None);
        let ctx = HashContext {
            partition: None,
            resource_type: "Patient",
            param_name: "birthdate",
        };
        let missing = missing_predicate(&mut sql, date::DATE_TABLE, root.column(RES_ID), &ctx, true);
        assert_eq!(
            missing.to_string(),
            "t0.res_id NOT IN (SELECT DISTINCT t1.res_id FROM hfj_spidx_date t1 WHERE t1.hash_identity = ?1)"
        );
        let present = missing_predicate(&mut sql, date::DATE_TABLE, root.column(RES_ID), &ctx, false);
        assert!(present.to_string().starts_with("t0.res_id IN (SELECT"));
    }
}
