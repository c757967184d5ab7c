//! Builders for value-typed index tables.

use std::slice;

use shirabe_core::search_param::{
    CompositeParam, DateParam, NumberParam, QuantityParam, SpecialParam, StringParam, TokenModifier, TokenParam,
    UriParam,
};
use shirabe_core::{CompareOp, RuntimeSearchParam, SearchError};

use super::{unsupported_filter_operator, PredicateBuilderType, QueryStack};
use crate::error::Result;
use crate::index::coords::{CoordsIndex, NearQuery};
use crate::index::date::DateIndex;
use crate::index::number::{numeric_predicate, NumberIndex, QuantityIndex};
use crate::index::string::StringIndex;
use crate::index::token::{TokenIndex, TOKEN_TABLE};
use crate::index::uri::UriIndex;
use crate::index::{IndexTable, RES_ID};
use crate::sql::{ColumnRef, Condition};

impl QueryStack<'_> {
    pub(super) fn string_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&StringParam],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let (table, reused) = self.join(source, PredicateBuilderType::String, &def.name);
        let index = StringIndex::new(table);
        let ctx = self.hash_context(resource_type, &def.name);
        let mut conditions = Vec::with_capacity(values.len());
        for value in values {
            let op = match op {
                Some(op) => op,
                None if value.text => CompareOp::Co,
                None => CompareOp::Sw,
            };
            conditions.push(Some(index.value_predicate(&mut self.sql, &ctx, value, op)?));
        }
        let condition = Condition::or(conditions);
        Ok(if reused {
            condition
        } else {
            index.combine_with_partition(&mut self.sql, condition)
        })
    }

    pub(super) fn token_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&TokenParam],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let negate_all = match op {
            None | Some(CompareOp::Eq) => false,
            Some(CompareOp::Ne) => true,
            Some(other) => return Err(unsupported_filter_operator(other)),
        };

        if values.iter().any(|v| v.modifier == Some(TokenModifier::Text)) {
            return self.token_text_predicate(source, resource_type, def, values);
        }
        if let Some(modifier) = values
            .iter()
            .filter_map(|v| v.modifier)
            .find(|m| *m != TokenModifier::Not)
        {
            return Err(SearchError::invalid(format!(
                "Unsupported token modifier :{} for parameter \"{}\"",
                modifier.code(),
                def.name
            ))
            .into());
        }

        let (negated, positive): (Vec<&TokenParam>, Vec<&TokenParam>) = values
            .iter()
            .copied()
            .partition(|v| negate_all || v.modifier == Some(TokenModifier::Not));
        let ctx = self.hash_context(resource_type, &def.name);

        let positive = if positive.is_empty() {
            None
        } else {
            let (table, reused) = self.join(source, PredicateBuilderType::Token, &def.name);
            let index = TokenIndex::new(table);
            let condition = index
                .values_predicate(&mut self.sql, &ctx, &positive)
                .unwrap_or_else(|| index.hash_identity_predicate(&mut self.sql, &ctx));
            if reused {
                Some(condition)
            } else {
                index.combine_with_partition(&mut self.sql, Some(condition))
            }
        };

        let negated = if negated.is_empty() {
            None
        } else {
            // the token table cannot express "no row with this value", so exclude the pids that have one
            let source = self.source_column(source);
            let mut child = self.sql.child(resource_type);
            let index = TokenIndex::new(child.add_table(TOKEN_TABLE, RES_ID, None));
            let condition = index.values_predicate(&mut child, &ctx, &negated);
            if let Some(condition) = index.combine_with_partition(&mut child, condition) {
                child.add_predicate(condition);
            }
            self.sql
                .finish_child(child)
                .map(|subquery| Condition::in_subquery(source, subquery, true))
        };

        Ok(Condition::or([positive, negated]))
    }

    /// `:text` searches the display text, indexed like a string parameter
    fn token_text_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&TokenParam],
    ) -> Result<Option<Condition>> {
        if !self.ctx.settings.token_text_indexing_enabled {
            return Err(SearchError::MethodNotAllowed(
                "The :text modifier is disabled on this server".to_string(),
            )
            .into());
        }
        if !def.text_indexed {
            return Err(SearchError::MethodNotAllowed(format!(
                "The :text modifier is disabled for this search parameter: {}",
                def.name
            ))
            .into());
        }
        let strings: Vec<StringParam> = values
            .iter()
            .map(|v| StringParam::new(v.value.clone().unwrap_or_default()))
            .collect();
        let strings: Vec<&StringParam> = strings.iter().collect();
        self.string_predicate(source, resource_type, def, &strings, None)
    }

    pub(super) fn number_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&NumberParam],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let (table, reused) = self.join(source, PredicateBuilderType::Number, &def.name);
        let index = NumberIndex::new(table);
        let mut conditions = Vec::with_capacity(values.len());
        for value in values {
            let number = value.value.ok_or_else(|| {
                SearchError::invalid(format!("Missing value for number parameter \"{}\"", def.name))
            })?;
            let op = op.unwrap_or(value.prefix);
            conditions.push(Some(numeric_predicate(
                &mut self.sql,
                index.value_column(),
                op,
                number,
                &def.name,
            )?));
        }
        let condition = Condition::or(conditions);
        let ctx = self.hash_context(resource_type, &def.name);
        Ok(if reused {
            condition
        } else {
            index.combine_with_hash_identity(&mut self.sql, &ctx, condition)
        })
    }

    pub(super) fn quantity_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&QuantityParam],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let (table, reused) = self.join(source, PredicateBuilderType::Quantity, &def.name);
        let index = QuantityIndex::new(table);
        let ctx = self.hash_context(resource_type, &def.name);
        let mut conditions = Vec::with_capacity(values.len());
        for value in values {
            let op = op.unwrap_or(value.prefix);
            conditions.push(Some(index.value_predicate(&mut self.sql, &ctx, value, op)?));
        }
        let condition = Condition::or(conditions);
        Ok(if reused {
            condition
        } else {
            index.combine_with_partition(&mut self.sql, condition)
        })
    }

    pub(super) fn date_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&DateParam],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let (table, reused) = self.join(source, PredicateBuilderType::Date, &def.name);
        let index = DateIndex::new(table);
        let mut conditions = Vec::with_capacity(values.len());
        for value in values {
            let range = value.range.ok_or_else(|| {
                SearchError::invalid(format!(
                    "Invalid date/time value \"{}\" for parameter \"{}\"",
                    value.value, def.name
                ))
            })?;
            let op = op.unwrap_or(value.prefix);
            conditions.push(Some(index.range_predicate(&mut self.sql, op, &range)?));
        }
        let condition = Condition::or(conditions);
        let ctx = self.hash_context(resource_type, &def.name);
        Ok(if reused {
            condition
        } else {
            index.combine_with_hash_identity(&mut self.sql, &ctx, condition)
        })
    }

    pub(super) fn uri_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&UriParam],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let (table, reused) = self.join(source, PredicateBuilderType::Uri, &def.name);
        let index = UriIndex::new(table);
        let ctx = self.hash_context(resource_type, &def.name);
        let mut conditions = Vec::with_capacity(values.len());
        for value in values {
            let op = op.unwrap_or(CompareOp::Eq);
            conditions.push(Some(index.value_predicate(&mut self.sql, &ctx, value, op)?));
        }
        let condition = Condition::or(conditions);
        Ok(if reused {
            condition
        } else {
            index.combine_with_partition(&mut self.sql, condition)
        })
    }

    /// `near` on Location; no other special parameter is indexed
    pub(super) fn coords_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&SpecialParam],
    ) -> Result<Option<Condition>> {
        if def.name != "near" {
            return Err(SearchError::invalid(format!(
                "Unsupported special search parameter \"{}\" for resource type \"{resource_type}\"",
                def.name
            ))
            .into());
        }
        let (table, reused) = self.join(source, PredicateBuilderType::Coords, &def.name);
        let index = CoordsIndex::new(table);
        let mut conditions = Vec::with_capacity(values.len());
        for value in values {
            let near = NearQuery::parse(&value.value)?;
            conditions.push(Some(index.near_predicate(&mut self.sql, &near)));
        }
        let condition = Condition::or(conditions);
        let ctx = self.hash_context(resource_type, &def.name);
        Ok(if reused {
            condition
        } else {
            index.combine_with_hash_identity(&mut self.sql, &ctx, condition)
        })
    }

    /// Both components must match; each value is one (left AND right) branch
    pub(super) fn composite_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&CompositeParam],
    ) -> Result<Option<Condition>> {
        let [left_name, right_name] = def.components.as_slice() else {
            return Err(SearchError::internal(format!(
                "Composite parameter \"{}\" does not have two components",
                def.name
            ))
            .into());
        };
        let component = |name: &str| {
            self.ctx
                .registry
                .get_active_search_param(resource_type, name)
                .ok_or_else(|| {
                    SearchError::internal(format!(
                        "Component \"{name}\" of composite parameter \"{}\" is not registered",
                        def.name
                    ))
                })
        };
        let left_def = component(left_name)?;
        let right_def = component(right_name)?;

        let mut conditions = Vec::with_capacity(values.len());
        for value in values {
            let left = self.predicate_for_or_list(source, resource_type, &left_def, slice::from_ref(&*value.left), None)?;
            let right =
                self.predicate_for_or_list(source, resource_type, &right_def, slice::from_ref(&*value.right), None)?;
            conditions.push(Condition::and([left, right]));
        }
        Ok(Condition::or(conditions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_builder::tests::test_context;
    use shirabe_core::search_param::ParamValue;
    use shirabe_core::RequestPartitionId;

    #[test]
    fn test_token_text_disabled_by_default() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let mut token = TokenParam::new(None, Some("glucose"));
        token.modifier = Some(TokenModifier::Text);
        let err = stack
            .search_for_ids_with_and_or(None, "Observation", "code", &[vec![ParamValue::Token(token)]])
            .unwrap_err();
        assert!(matches!(err.into_search_error(), SearchError::MethodNotAllowed(_)));
    }

    #[test]
    fn test_token_text_requires_indexed_parameter() {
        let mut ctx = test_context();
        ctx.settings.token_text_indexing_enabled = true;
        let mut stack = QueryStack::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let mut token = TokenParam::new(None, Some("final"));
        token.modifier = Some(TokenModifier::Text);
        let err = stack
            .search_for_ids_with_and_or(None, "Observation", "status", &[vec![ParamValue::Token(token.clone())]])
            .unwrap_err();
        assert!(matches!(err.into_search_error(), SearchError::MethodNotAllowed(_)));

        let condition = stack
            .search_for_ids_with_and_or(None, "Observation", "code", &[vec![ParamValue::Token(token)]])
            .unwrap()
            .unwrap();
        assert!(condition.to_string().contains("sp_value_normalized LIKE"));
    }

    #[test]
    fn test_token_not_excludes_through_subquery() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let mut token = TokenParam::new(Some("http://loinc.org"), Some("1234"));
        token.modifier = Some(TokenModifier::Not);
        let condition = stack
            .search_for_ids_with_and_or(None, "Observation", "code", &[vec![ParamValue::Token(token)]])
            .unwrap()
            .unwrap();
        assert_eq!(
            condition.to_string(),
            "t0.res_id NOT IN (SELECT DISTINCT t1.res_id FROM hfj_spidx_token t1 WHERE t1.hash_sys_and_value = ?1)"
        );
    }

    #[test]
    fn test_unsupported_token_modifier() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let mut token = TokenParam::new(Some("http://loinc.org"), Some("1234"));
        token.modifier = Some(TokenModifier::Below);
        let err = stack
            .search_for_ids_with_and_or(None, "Observation", "code", &[vec![ParamValue::Token(token)]])
            .unwrap_err();
        assert!(err.to_string().contains(":below"));
    }

    #[test]
    fn test_composite_ands_components() {
        let ctx = test_context();
        let registry = ctx.registry.clone();
        let values = shirabe_core::search_parameter_map::parse_parameter(
            "Observation",
            "code-value-quantity",
            None,
            "http://loinc.org|8480-6$gt100",
            registry.as_ref(),
        )
        .unwrap();
        let mut stack = QueryStack::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let condition = stack
            .search_for_ids_with_and_or(None, "Observation", "code-value-quantity", &[values])
            .unwrap()
            .unwrap();
        let rendered = condition.to_string();
        assert!(rendered.contains("hash_sys_and_value"));
        assert!(rendered.contains("sp_value > "));
        assert_eq!(stack.sql().table_count(), 2);
    }
}
