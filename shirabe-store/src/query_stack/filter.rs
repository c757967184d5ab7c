//! `_filter` expressions lowered onto the regular predicate builders.
//!
//! Every leaf becomes `pid IN (subquery)` built on a child stack, so the
//! boolean structure of the expression maps directly onto AND/OR.

use shirabe_core::search_param::{parse_value, ParamValue, StringParam, TokenParam};
use shirabe_core::{CompareOp, Filter, FilterParameter, LogicalOp, SearchError, SearchParamType};

use super::reference::parse_raw_value;
use super::{unsupported_filter_operator, QueryStack};
use crate::error::Result;
use crate::sql::{ColumnRef, Condition};

impl QueryStack<'_> {
    pub(super) fn filter_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        and_or: &[Vec<ParamValue>],
    ) -> Result<Option<Condition>> {
        if !self.ctx.settings.filter_parameter_enabled {
            return Err(SearchError::invalid("_filter parameter is disabled on this server").into());
        }

        let mut conditions = Vec::with_capacity(and_or.len());
        for or_list in and_or {
            let mut alternatives = Vec::with_capacity(or_list.len());
            for value in or_list {
                let ParamValue::String(expression) = value else {
                    return Err(SearchError::invalid(format!("Invalid {} for _filter parameter", value.kind())).into());
                };
                let filter = Filter::parse(&expression.value)?;
                alternatives.push(Some(self.filter_condition(source, resource_type, &filter)?));
            }
            conditions.push(Condition::or(alternatives));
        }
        Ok(Condition::and(conditions))
    }

    fn filter_condition(&mut self, source: Option<ColumnRef>, resource_type: &str, filter: &Filter) -> Result<Condition> {
        match filter {
            Filter::Group(inner) => self.filter_condition(source, resource_type, inner),
            Filter::Logical { op, left, right } => {
                let left = Some(self.filter_condition(source, resource_type, left)?);
                let right = Some(self.filter_condition(source, resource_type, right)?);
                let combined = match op {
                    LogicalOp::And => Condition::and([left, right]),
                    LogicalOp::Or => Condition::or([left, right]),
                };
                Ok(combined.unwrap_or(Condition::Never))
            }
            Filter::Parameter(param) => self.filter_leaf(source, resource_type, param),
        }
    }

    fn filter_leaf(&mut self, source: Option<ColumnRef>, resource_type: &str, param: &FilterParameter) -> Result<Condition> {
        let column = self.source_column(source);
        let mut child = self.child(resource_type);
        let condition = child.filter_leaf_condition(resource_type, param);
        let condition = match condition {
            Ok(condition) => condition,
            Err(e) => {
                self.finish_child(child);
                return Err(e);
            }
        };
        if let Some(condition) = condition {
            child.add_predicate(condition);
        }
        Ok(match self.finish_child(child) {
            Some(subquery) => Condition::in_subquery(column, subquery, false),
            None => Condition::Never,
        })
    }

    fn filter_leaf_condition(&mut self, resource_type: &str, param: &FilterParameter) -> Result<Option<Condition>> {
        let name = param.name.as_str();
        let op = param.op;
        match name {
            "_id" => {
                let value = ParamValue::Token(TokenParam::new(None, Some(&param.value)));
                return self.resource_id_predicate(None, resource_type, &[vec![value]], Some(op));
            }
            "_language" => {
                let value = ParamValue::String(StringParam::new(param.value.as_str()));
                return self.language_predicate(None, &[vec![value]], Some(op));
            }
            "_tag" | "_profile" | "_security" | "_source" => {
                if op != CompareOp::Eq {
                    return Err(unsupported_filter_operator(op));
                }
                let values = parse_raw_value(self.ctx.registry.as_ref(), resource_type, name, None, &param.value)?;
                return self.search_for_ids_with_and_or(None, resource_type, name, &[values]);
            }
            _ => {}
        }

        let Some(def) = self.ctx.registry.get_active_search_param(resource_type, name) else {
            return Err(SearchError::invalid(format!(
                "Invalid search parameter specified, {name}, for resource type {resource_type}."
            ))
            .into());
        };
        if def.param_type == SearchParamType::Composite {
            return Err(SearchError::invalid(
                "Composite search parameters not currently supported with _filter clauses",
            )
            .into());
        }

        let value = if op == CompareOp::Pr {
            ParamValue::missing_of(def.param_type, param.value != "true")
        } else {
            let qualifier = param.chain.as_ref().map(|chain| format!(".{chain}"));
            parse_value(name, def.param_type, qualifier.as_deref(), &param.value)?
        };

        self.check_partition_hash_support()?;
        let op = (op != CompareOp::Pr).then_some(op);
        self.predicate_for_or_list(None, resource_type, &def, &[value], op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_builder::tests::test_context;
    use shirabe_core::RequestPartitionId;

    fn filter(expression: &str) -> Vec<Vec<ParamValue>> {
        vec![vec![ParamValue::String(StringParam::new(expression))]]
    }

    #[test]
    fn test_filter_disabled_by_default() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let err = stack
            .search_for_ids_with_and_or(None, "Patient", "_filter", &filter("family eq smith"))
            .unwrap_err();
        assert_eq!(err.to_string(), "_filter parameter is disabled on this server");
    }

    #[test]
    fn test_leaves_become_subqueries() {
        let mut ctx = test_context();
        ctx.settings.filter_parameter_enabled = true;
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let condition = stack
            .search_for_ids_with_and_or(
                None,
                "Patient",
                "_filter",
                &filter("family eq smith or (gender eq male and birthdate ge 2000)"),
            )
            .unwrap()
            .unwrap();
        let rendered = condition.to_string();
        assert!(rendered.starts_with("(t0.res_id IN (SELECT DISTINCT t1.res_id FROM hfj_spidx_string t1"));
        assert!(rendered.contains(" OR (t0.res_id IN (SELECT DISTINCT t2.res_id FROM hfj_spidx_token t2"));
        assert!(rendered.contains("hfj_spidx_date"));
    }

    #[test]
    fn test_unknown_and_composite_parameters() {
        let mut ctx = test_context();
        ctx.settings.filter_parameter_enabled = true;
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let err = stack
            .search_for_ids_with_and_or(None, "Patient", "_filter", &filter("nope eq 1"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid search parameter specified, nope, for resource type Patient."
        );

        let mut stack = QueryStack::new(&ctx, "Observation", RequestPartitionId::AllPartitions);
        let err = stack
            .search_for_ids_with_and_or(None, "Observation", "_filter", &filter("code-value-quantity eq 1"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Composite search parameters not currently supported with _filter clauses"
        );
    }

    #[test]
    fn test_present_operator_uses_missing() {
        let mut ctx = test_context();
        ctx.settings.filter_parameter_enabled = true;
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let condition = stack
            .search_for_ids_with_and_or(None, "Patient", "_filter", &filter("birthdate pr true"))
            .unwrap()
            .unwrap();
        assert!(condition.to_string().contains("t1.res_id IN (SELECT DISTINCT"));
    }

    #[test]
    fn test_unresolved_id_matches_nothing() {
        let mut ctx = test_context();
        ctx.settings.filter_parameter_enabled = true;
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let condition = stack
            .search_for_ids_with_and_or(None, "Patient", "_filter", &filter("_id eq 42"))
            .unwrap()
            .unwrap();
        assert_eq!(condition, Condition::Never);
    }
}
