//! Resource-level parameters: `_id`, `_language`, tags and `_source`.

use std::collections::BTreeSet;

use shirabe_core::search_param::{ParamValue, TokenModifier};
use shirabe_core::{CompareOp, ResourcePid, SearchError, StoreMetaSource};

use super::{unsupported_filter_operator, QueryStack};
use crate::error::Result;
use crate::index::{RES_ID, SOURCE_TABLE, TAG_TABLE};
use crate::resolver::TypedId;
use crate::schema::TagType;
use crate::sql::{ColumnRef, Condition, SearchQueryBuilder, TableRef};

/// Plain string content of an `_id` / `_language` / `_source` value
fn raw_value(value: &ParamValue) -> Option<String> {
    match value {
        ParamValue::Token(token) => token.value.clone(),
        ParamValue::String(string) => Some(string.value.clone()),
        ParamValue::Uri(uri) => Some(uri.value.clone()),
        ParamValue::Reference(reference) => Some(reference.value.clone()),
        _ => None,
    }
    .filter(|v| !v.is_empty())
}

/// `Eq` or `Ne`; the flag is true for `Ne`
fn equality(op: Option<CompareOp>) -> Result<bool> {
    match op {
        None | Some(CompareOp::Eq) => Ok(false),
        Some(CompareOp::Ne) => Ok(true),
        Some(other) => Err(unsupported_filter_operator(other)),
    }
}

/// (system, code) of a tag value; `_profile` values are bare URIs
fn tag_value(value: &ParamValue) -> Option<(Option<String>, Option<String>, bool)> {
    match value {
        ParamValue::Token(token) => Some((
            token.system.clone().filter(|s| !s.is_empty()),
            token.value.clone().filter(|v| !v.is_empty()),
            token.modifier == Some(TokenModifier::Not),
        )),
        ParamValue::Uri(uri) => Some((None, Some(uri.value.clone()), false)),
        ParamValue::String(string) => Some((None, Some(string.value.clone()), false)),
        _ => None,
    }
}

fn tag_type_of(param_name: &str) -> TagType {
    match param_name {
        "_profile" => TagType::Profile,
        "_security" => TagType::SecurityLabel,
        _ => TagType::Tag,
    }
}

/// `tag_type = ? AND (system/code OR ...)`; `None` when no value carries anything
fn tag_conditions(
    sql: &mut SearchQueryBuilder,
    table: TableRef,
    tag_type: TagType,
    values: &[(Option<String>, Option<String>)],
) -> Option<Condition> {
    let mut alternatives = Vec::with_capacity(values.len());
    for (system, code) in values {
        let system = system.as_ref().map(|s| {
            let placeholder = sql.bind(s.as_str());
            Condition::eq(table.column("tag_system"), placeholder)
        });
        let code = code.as_ref().map(|c| {
            let placeholder = sql.bind(c.as_str());
            Condition::eq(table.column("tag_code"), placeholder)
        });
        alternatives.push(Condition::and([system, code]));
    }
    let matches = Condition::or(alternatives)?;
    let kind = sql.bind(tag_type as i32);
    Condition::and([Some(Condition::eq(table.column("tag_type"), kind)), Some(matches)])
}

impl QueryStack<'_> {
    /// `_id`: OR-values unite, AND-groups intersect. Nothing left means nothing matches.
    pub(super) fn resource_id_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        and_or: &[Vec<ParamValue>],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let inverse = equality(op)?;
        let ctx = self.ctx;

        let mut matching: Option<BTreeSet<ResourcePid>> = None;
        for or_list in and_or {
            let ids: Vec<TypedId> = or_list
                .iter()
                .filter_map(raw_value)
                .map(|raw| match raw.rsplit_once('/') {
                    Some((prefix, id)) => {
                        let id_type = prefix.rsplit('/').next().unwrap_or(resource_type);
                        TypedId::new(id_type, id)
                    }
                    None => TypedId::new(resource_type, &raw),
                })
                .collect();
            if ids.is_empty() {
                continue;
            }
            let pids: BTreeSet<ResourcePid> = ctx
                .resolver
                .resolve_many(self.sql.partition(), &ids)?
                .into_iter()
                .collect();
            matching = Some(match matching {
                None => pids,
                Some(previous) => previous.intersection(&pids).copied().collect(),
            });
        }

        let Some(matching) = matching else {
            return Ok(None);
        };
        if matching.is_empty() {
            if inverse {
                return Ok(None);
            }
            self.sql.set_match_nothing();
            return Ok(None);
        }

        let column = self.source_column(source);
        let placeholders = self.sql.bind_all(matching.iter().map(|p| p.id()));
        Ok(Some(Condition::equal_to_or_in(column, placeholders, inverse)))
    }

    /// `_language` on the resource table
    pub(super) fn language_predicate(
        &mut self,
        source: Option<ColumnRef>,
        and_or: &[Vec<ParamValue>],
        op: Option<CompareOp>,
    ) -> Result<Option<Condition>> {
        let inverse = equality(op)?;
        let mut conditions = Vec::with_capacity(and_or.len());
        for or_list in and_or {
            let languages: Vec<String> = or_list.iter().filter_map(raw_value).collect();
            if languages.is_empty() {
                continue;
            }
            let table = self.sql.resource_table(source);
            let placeholders = self.sql.bind_all(languages);
            conditions.push(Some(Condition::equal_to_or_in(
                table.column("res_language"),
                placeholders,
                inverse,
            )));
        }
        Ok(Condition::and(conditions))
    }

    /// `_tag`, `_profile` and `_security`. Each AND-group gets its own tag join;
    /// `:not` groups become `NOT IN` subqueries.
    pub(super) fn tag_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        param_name: &str,
        and_or: &[Vec<ParamValue>],
    ) -> Result<Option<Condition>> {
        let tag_type = tag_type_of(param_name);
        let mut conditions = Vec::with_capacity(and_or.len());
        for or_list in and_or {
            let mut values = Vec::with_capacity(or_list.len());
            let mut negated = false;
            for (idx, value) in or_list.iter().enumerate() {
                if let Some(missing) = value.missing() {
                    return Err(SearchError::invalid(format!(
                        "The :missing modifier is not supported for {param_name} (missing={missing})"
                    ))
                    .into());
                }
                let (system, code, not) = tag_value(value).ok_or_else(|| {
                    SearchError::invalid(format!("Invalid {} for {param_name} parameter", value.kind()))
                })?;
                if idx == 0 {
                    negated = not;
                }
                if system.is_some() || code.is_some() {
                    values.push((system, code));
                }
            }
            if values.is_empty() {
                continue;
            }

            let source = self.source_column(source);
            if negated {
                let mut child = self.sql.child(resource_type);
                let table = child.add_table(TAG_TABLE, RES_ID, None);
                let matches = tag_conditions(&mut child, table, tag_type, &values);
                let partition = child.partition_predicate(table);
                if let Some(condition) = Condition::and([matches, partition]) {
                    child.add_predicate(condition);
                }
                if let Some(subquery) = self.sql.finish_child(child) {
                    conditions.push(Some(Condition::in_subquery(source, subquery, true)));
                }
            } else {
                let table = self.sql.add_table(TAG_TABLE, RES_ID, Some(source));
                let matches = tag_conditions(&mut self.sql, table, tag_type, &values);
                let partition = self.sql.partition_predicate(table);
                conditions.push(Condition::and([matches, partition]));
            }
        }
        Ok(Condition::and(conditions))
    }

    /// `_source=uri`, `_source=uri#requestId` or `_source=#requestId`
    pub(super) fn source_predicate(
        &mut self,
        source: Option<ColumnRef>,
        and_or: &[Vec<ParamValue>],
    ) -> Result<Option<Condition>> {
        let stored = self.ctx.settings.store_meta_source_information;
        if stored == StoreMetaSource::None {
            return Err(SearchError::invalid("The _source parameter is disabled on this server").into());
        }

        let mut conditions = Vec::with_capacity(and_or.len());
        for or_list in and_or {
            let values: Vec<String> = or_list.iter().filter_map(raw_value).collect();
            if values.is_empty() {
                continue;
            }
            let source = self.source_column(source);
            let table = self.sql.add_table(SOURCE_TABLE, "res_pid", Some(source));
            let mut alternatives = Vec::with_capacity(values.len());
            for value in &values {
                let (uri, request_id) = match value.split_once('#') {
                    Some((uri, request_id)) => (uri, request_id),
                    None => (value.as_str(), ""),
                };
                if !request_id.is_empty() && stored != StoreMetaSource::SourceUriAndRequestId {
                    return Err(SearchError::invalid(
                        "The _source parameter request ID component is not supported on this server",
                    )
                    .into());
                }
                let uri = (!uri.is_empty()).then(|| {
                    let placeholder = self.sql.bind(uri);
                    Condition::eq(table.column("source_uri"), placeholder)
                });
                let request_id = (!request_id.is_empty()).then(|| {
                    let placeholder = self.sql.bind(request_id);
                    Condition::eq(table.column("request_id"), placeholder)
                });
                alternatives.push(Condition::and([uri, request_id]));
            }
            let partition = self.sql.partition_predicate(table);
            conditions.push(Condition::and([Condition::or(alternatives), partition]));
        }
        Ok(Condition::and(conditions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_builder::tests::test_context;
    use shirabe_core::search_param::{StringParam, TokenParam};
    use shirabe_core::RequestPartitionId;

    fn token(system: Option<&str>, value: &str) -> ParamValue {
        ParamValue::Token(TokenParam::new(system, Some(value)))
    }

    #[test]
    fn test_missing_id_matches_nothing() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let condition = stack
            .search_for_ids_with_and_or(None, "Patient", "_id", &[vec![token(None, "123")]])
            .unwrap();
        assert!(condition.is_none());
        assert!(stack.generate(None).match_nothing);
    }

    #[test]
    fn test_language_in_list() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let condition = stack
            .search_for_ids_with_and_or(
                None,
                "Patient",
                "_language",
                &[vec![
                    ParamValue::String(StringParam::new("en")),
                    ParamValue::String(StringParam::new("fr")),
                ]],
            )
            .unwrap()
            .unwrap();
        assert_eq!(condition.to_string(), "t0.res_language IN (?1,?2)");
    }

    #[test]
    fn test_tag_join_and_not_subquery() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let condition = stack
            .search_for_ids_with_and_or(None, "Patient", "_tag", &[vec![token(Some("urn:sys"), "vip")]])
            .unwrap()
            .unwrap();
        assert_eq!(
            condition.to_string(),
            "(t1.tag_type = ?3 AND (t1.tag_system = ?1 AND t1.tag_code = ?2))"
        );

        let mut not = TokenParam::new(Some("urn:sys"), Some("test"));
        not.modifier = Some(TokenModifier::Not);
        let condition = stack
            .search_for_ids_with_and_or(None, "Patient", "_tag", &[vec![ParamValue::Token(not)]])
            .unwrap()
            .unwrap();
        assert!(condition.to_string().starts_with("t0.res_id NOT IN (SELECT DISTINCT t2.res_id FROM hfj_res_tag t2"));
    }

    #[test]
    fn test_source_disabled() {
        let mut ctx = test_context();
        ctx.settings.store_meta_source_information = StoreMetaSource::None;
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let err = stack
            .search_for_ids_with_and_or(
                None,
                "Patient",
                "_source",
                &[vec![ParamValue::String(StringParam::new("urn:source"))]],
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "The _source parameter is disabled on this server");
    }

    #[test]
    fn test_source_with_request_id() {
        let ctx = test_context();
        let mut stack = QueryStack::new(&ctx, "Patient", RequestPartitionId::AllPartitions);
        let condition = stack
            .search_for_ids_with_and_or(
                None,
                "Patient",
                "_source",
                &[vec![ParamValue::String(StringParam::new("urn:source#req-1"))]],
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            condition.to_string(),
            "(t1.source_uri = ?1 AND t1.request_id = ?2)"
        );
    }
}
