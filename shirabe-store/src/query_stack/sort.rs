//! `_sort` keys as outer joins plus `ORDER BY` columns.

use shirabe_core::{SearchError, SearchParamType, SortSpec};

use super::reference::path_predicate;
use super::QueryStack;
use crate::error::Result;
use crate::index::date::{DateIndex, DATE_TABLE};
use crate::index::number::{NUMBER_TABLE, QUANTITY_TABLE};
use crate::index::string::{StringIndex, STRING_TABLE};
use crate::index::token::{TokenIndex, TOKEN_TABLE};
use crate::index::uri::URI_TABLE;
use crate::index::{HASH_IDENTITY, LINK_TABLE, RES_ID};
use crate::sql::{Condition, TableRef};

impl QueryStack<'_> {
    /// Add every key of `spec` in priority order
    pub fn add_sort(&mut self, spec: &SortSpec) -> Result<()> {
        let resource_type = self.sql.resource_type().to_string();
        for key in spec.iter() {
            self.add_sort_key(&resource_type, key)?;
        }
        Ok(())
    }

    fn add_sort_key(&mut self, resource_type: &str, key: &SortSpec) -> Result<()> {
        let name = key.param_name.as_str();
        match name {
            "_id" => {
                let table = self.sql.resource_table(None);
                self.sql.add_order_by(table.column("fhir_id"), key.order);
                return Ok(());
            }
            "_lastUpdated" => {
                let table = self.sql.resource_table(None);
                self.sql.add_order_by(table.column("res_updated"), key.order);
                return Ok(());
            }
            _ => {}
        }

        let Some(def) = self.ctx.registry.get_active_search_param(resource_type, name) else {
            let valid: Vec<String> = self
                .ctx
                .registry
                .get_active_search_params(resource_type)
                .into_keys()
                .collect();
            return Err(SearchError::invalid(format!(
                "Unknown _sort parameter value \"{name}\" for resource type \"{resource_type}\" (Note: this is a search parameter name, not a field name). Valid values for this search are: [{}]",
                valid.join(", ")
            ))
            .into());
        };

        match def.param_type {
            SearchParamType::String => {
                let table = self.sort_join(STRING_TABLE, resource_type, name);
                let column = StringIndex::new(table).sort_column();
                self.sql.add_order_by(column, key.order);
            }
            SearchParamType::Token => {
                let table = self.sort_join(TOKEN_TABLE, resource_type, name);
                for column in TokenIndex::new(table).sort_columns() {
                    self.sql.add_order_by(column, key.order);
                }
            }
            SearchParamType::Date => {
                let table = self.sort_join(DATE_TABLE, resource_type, name);
                let column = DateIndex::new(table).low_column();
                self.sql.add_order_by(column, key.order);
            }
            SearchParamType::Number => {
                let table = self.sort_join(NUMBER_TABLE, resource_type, name);
                self.sql.add_order_by(table.column("sp_value"), key.order);
            }
            SearchParamType::Quantity => {
                let table = self.sort_join(QUANTITY_TABLE, resource_type, name);
                self.sql.add_order_by(table.column("sp_value"), key.order);
            }
            SearchParamType::Uri => {
                let table = self.sort_join(URI_TABLE, resource_type, name);
                self.sql.add_order_by(table.column("sp_uri"), key.order);
            }
            SearchParamType::Reference => {
                let table = self.sql.add_outer_join(LINK_TABLE, "src_resource_id");
                let path = path_predicate(&mut self.sql, table, resource_type, &def);
                self.sql.add_join_condition(table, path);
                self.sql.add_order_by(table.column("target_resource_id"), key.order);
            }
            SearchParamType::Composite | SearchParamType::Special => {
                return Err(SearchError::invalid(format!(
                    "This server does not support _sort specifications of type {} - Can't serve _sort={name}",
                    def.param_type.as_str()
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Outer join on an index table restricted to one parameter
    fn sort_join(&mut self, table_name: &'static str, resource_type: &str, param_name: &str) -> TableRef {
        let table = self.sql.add_outer_join(table_name, RES_ID);
        let identity = self.hash_context(resource_type, param_name).identity();
        let value = self.sql.bind(identity);
        self.sql.add_join_condition(table, Condition::eq(table.column(HASH_IDENTITY), value));
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_builder::tests::test_context;
    use shirabe_core::{RequestPartitionId, SortOrder};

    #[test]
    fn test_sort_by_last_updated_uses_resource_root() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        stack.add_sort(&SortSpec::new("_lastUpdated", SortOrder::Desc)).unwrap();
        let generated = stack.generate(None);
        assert_eq!(
            generated.sql,
            "SELECT DISTINCT t0.res_id, t0.res_updated FROM hfj_resource t0 WHERE t0.res_type = ?1 AND t0.res_deleted_at IS NULL ORDER BY t0.res_updated DESC NULLS FIRST"
        );
    }

    #[test]
    fn test_sort_chain_adds_outer_joins() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let spec = SortSpec::parse("family,-birthdate").unwrap();
        stack.add_sort(&spec).unwrap();
        let generated = stack.generate(None);
        assert!(generated.sql.contains(
            "LEFT OUTER JOIN hfj_spidx_string t1 ON (t1.res_id = t0.res_id AND t1.hash_identity = ?1)"
        ));
        assert!(generated.sql.contains("LEFT OUTER JOIN hfj_spidx_date t2"));
        assert!(generated
            .sql
            .ends_with("ORDER BY t1.sp_value_normalized ASC NULLS LAST, t2.sp_value_low DESC NULLS FIRST"));
    }

    #[test]
    fn test_sort_by_reference_restricts_path() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        stack.add_sort(&SortSpec::new("subject", SortOrder::Asc)).unwrap();
        let generated = stack.generate(None);
        assert!(generated.sql.contains("LEFT OUTER JOIN hfj_res_link t1 ON (t1.src_resource_id = t0.res_id AND t1.src_path"));
        assert!(generated.sql.ends_with("ORDER BY t1.target_resource_id ASC NULLS LAST"));
    }

    #[test]
    fn test_sort_errors() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let err = stack.add_sort(&SortSpec::new("name.family", SortOrder::Asc)).unwrap_err();
        assert!(err.to_string().starts_with(
            "Unknown _sort parameter value \"name.family\" for resource type \"Patient\" (Note: this is a search parameter name, not a field name)."
        ));

        let mut stack = QueryStack::new(&ctx, "Location", RequestPartitionId::AllPartitions);
        let err = stack.add_sort(&SortSpec::new("near", SortOrder::Asc)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "This server does not support _sort specifications of type SPECIAL - Can't serve _sort=near"
        );
    }
}
