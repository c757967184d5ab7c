//! Reference, chain and `_has` predicates over the link table.

use shirabe_core::search_param::{parse_value, HasParam, ParamValue, ReferenceParam};
use shirabe_core::search_parameter_map::{parameter_type, parse_parameter, split_parameter_name};
use shirabe_core::{RuntimeSearchParam, SearchError, SearchParamRegistry, SearchParamType};
use tracing::{debug, warn};

use super::{PredicateBuilderType, QueryStack};
use crate::error::Result;
use crate::index::LINK_TABLE;
use crate::resolver::TypedId;
use crate::sql::{ColumnRef, Condition, SearchQueryBuilder, TableRef};

const TYPE_CHAIN: &str = "_type";

/// Paths of `def` that belong to `resource_type`; all paths when none do
pub(crate) fn link_paths(resource_type: &str, def: &RuntimeSearchParam) -> Vec<String> {
    let prefix = format!("{resource_type}.");
    let all = def.paths_split();
    let own: Vec<String> = all
        .iter()
        .filter(|p| p.starts_with(&prefix))
        .map(|p| p.to_string())
        .collect();
    if own.is_empty() {
        all.into_iter().map(str::to_string).collect()
    } else {
        own
    }
}

/// `src_path IN (...)` on a link table instance
pub(super) fn path_predicate(
    sql: &mut SearchQueryBuilder,
    link: TableRef,
    resource_type: &str,
    def: &RuntimeSearchParam,
) -> Condition {
    let placeholders = sql.bind_all(link_paths(resource_type, def));
    Condition::equal_to_or_in(link.column("src_path"), placeholders, false)
}

/// Parse one raw value of `name` as declared on `resource_type`
pub(super) fn parse_raw_value(
    registry: &dyn SearchParamRegistry,
    resource_type: &str,
    name: &str,
    qualifier: Option<&str>,
    raw: &str,
) -> Result<Vec<ParamValue>> {
    let param_type = parameter_type(resource_type, name, registry);
    let values = match param_type {
        Some(param_type) if qualifier != Some(":missing") && param_type != SearchParamType::Composite => {
            vec![parse_value(name, param_type, qualifier, raw)?]
        }
        _ => parse_parameter(resource_type, name, qualifier, raw, registry)?,
    };
    Ok(values)
}

fn invalid_resource_type(resource_type: &str) -> SearchError {
    SearchError::invalid(format!("Invalid resource type: {resource_type}"))
}

impl<'a> QueryStack<'a> {
    pub(super) fn reference_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&ReferenceParam],
    ) -> Result<Option<Condition>> {
        let (link, reused) = self.join(source, PredicateBuilderType::Reference, &def.name);
        let path = path_predicate(&mut self.sql, link, resource_type, def);
        let (chained, direct): (Vec<&ReferenceParam>, Vec<&ReferenceParam>) =
            values.iter().copied().partition(|v| v.chain.is_some());

        let mut branches = Vec::new();
        if !direct.is_empty() {
            match self.direct_reference_predicate(link, resource_type, def, &direct)? {
                Some(condition) => branches.push(Some(condition)),
                None if chained.is_empty() => {
                    self.sql.set_match_nothing();
                    return Ok(None);
                }
                None => {}
            }
        }

        let mut groups: Vec<((Option<&str>, &str), Vec<&ReferenceParam>)> = Vec::new();
        for value in chained {
            let key = (value.resource_type.as_deref(), value.chain.as_deref().unwrap_or_default());
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(value),
                None => groups.push((key, vec![value])),
            }
        }
        for ((qualifier_type, chain), members) in groups {
            branches.push(self.chained_reference_predicate(link, resource_type, def, qualifier_type, chain, &members)?);
        }

        let matches = Condition::or(branches).unwrap_or(Condition::Never);
        let condition = Condition::and([Some(path), Some(matches)]);
        Ok(if reused {
            condition
        } else {
            let partition = self.sql.partition_predicate(link);
            Condition::and([partition, condition])
        })
    }

    /// `Patient?organization=Organization/123`; `None` when nothing resolves
    fn direct_reference_predicate(
        &mut self,
        link: TableRef,
        resource_type: &str,
        def: &RuntimeSearchParam,
        values: &[&ReferenceParam],
    ) -> Result<Option<Condition>> {
        let ctx = self.ctx;
        let mut ids = Vec::new();
        let mut urls = Vec::new();
        for value in values {
            if !value.is_absolute() {
                ids.push(self.typed_id(def, value)?);
                continue;
            }
            match ctx.settings.localize_reference(&value.value) {
                Some(local) => {
                    let local = ReferenceParam {
                        value: local.to_string(),
                        ..(*value).clone()
                    };
                    ids.push(self.typed_id(def, &local)?);
                }
                None => urls.push(value.value.clone()),
            }
        }

        let pids = if ids.is_empty() {
            Vec::new()
        } else {
            ctx.resolver.resolve_many(self.sql.partition(), &ids)?
        };
        if pids.is_empty() && urls.is_empty() {
            debug!(
                "No reference targets for {}:{} resolved",
                resource_type, def.name
            );
            return Ok(None);
        }

        let by_pid = (!pids.is_empty()).then(|| {
            let placeholders = self.sql.bind_all(pids.iter().map(|p| p.id()));
            Condition::equal_to_or_in(link.column("target_resource_id"), placeholders, false)
        });
        let by_url = (!urls.is_empty()).then(|| {
            let placeholders = self.sql.bind_all(urls);
            Condition::equal_to_or_in(link.column("target_resource_url"), placeholders, false)
        });
        Ok(Condition::or([by_pid, by_url]))
    }

    fn typed_id(&self, def: &RuntimeSearchParam, value: &ReferenceParam) -> Result<TypedId> {
        let (target_type, id) = value.target();
        match target_type {
            Some(target_type) => {
                if !self.ctx.registry.is_resource_type(target_type) {
                    return Err(invalid_resource_type(target_type).into());
                }
                Ok(TypedId::new(target_type, id))
            }
            None if def.targets.len() == 1 => {
                let only = def.targets.iter().next().map(String::as_str).unwrap_or_default();
                Ok(TypedId::new(only, id))
            }
            None => Ok(TypedId::untyped(id)),
        }
    }

    /// An unqualified chain fanned out over several candidate types
    fn warn_unqualified(&self, param_name: &str, candidates: &[String]) {
        let forms: Vec<String> = candidates.iter().map(|c| format!("[{c}:{param_name}]")).collect();
        let message = format!(
            "This search uses an unqualified resource reference, which is less efficient than a qualified one. \
             [{param_name}] resolves to [{}]. If you know what you're looking for, qualify it using the form {}",
            candidates.join(","),
            forms.join(" or ")
        );
        warn!("{}", message);
        self.ctx.interceptor.perf_warning(&message);
    }

    /// Target types a chain may continue into. An empty list from a `_type`
    /// chain means any resource type.
    fn chain_candidate_types(
        &self,
        def: &RuntimeSearchParam,
        qualifier_type: Option<&str>,
        chain: &str,
    ) -> Result<Vec<String>> {
        if let Some(qualifier_type) = qualifier_type {
            if !self.ctx.registry.is_resource_type(qualifier_type) {
                return Err(invalid_resource_type(qualifier_type).into());
            }
            return Ok(vec![qualifier_type.to_string()]);
        }
        if def.targets.is_empty() && chain != TYPE_CHAIN {
            return Err(SearchError::invalid(format!(
                "Unable to perform search for unqualified chain '{name}.{chain}' as this SearchParameter does not declare any target types. Add a qualifier of the form '{name}:[ResourceType].{chain}' to perform this search.",
                name = def.name
            ))
            .into());
        }
        Ok(def.targets.iter().cloned().collect())
    }

    /// `Observation?subject.name=Doe`: one subquery per candidate target type
    fn chained_reference_predicate(
        &mut self,
        link: TableRef,
        resource_type: &str,
        def: &RuntimeSearchParam,
        qualifier_type: Option<&str>,
        chain: &str,
        values: &[&ReferenceParam],
    ) -> Result<Option<Condition>> {
        let ctx = self.ctx;
        let registry = ctx.registry.as_ref();
        let candidates = self.chain_candidate_types(def, qualifier_type, chain)?;

        if chain == TYPE_CHAIN {
            let mut conditions = Vec::with_capacity(values.len());
            for value in values {
                let target_type = value.value.as_str();
                if !registry.is_resource_type(target_type) {
                    return Err(invalid_resource_type(target_type).into());
                }
                if !candidates.is_empty() && !candidates.iter().any(|c| c == target_type) {
                    return Err(SearchError::invalid(format!(
                        "Resource type \"{target_type}\" is not a valid target type for reference search parameter: {resource_type}:{}",
                        def.name
                    ))
                    .into());
                }
                let placeholder = self.sql.bind(target_type);
                conditions.push(Some(Condition::eq(link.column("target_resource_type"), placeholder)));
            }
            return Ok(Condition::or(conditions));
        }

        let (name, qualifier) = split_parameter_name(chain);
        let mut matched = Vec::new();
        let mut branches = Vec::new();
        for candidate in &candidates {
            if parameter_type(candidate, name, registry).is_none() {
                debug!("Type {} doesn't have search param {}", candidate, name);
                continue;
            }
            let mut or_values = Vec::with_capacity(values.len());
            for value in values {
                or_values.extend(parse_raw_value(registry, candidate, name, qualifier, &value.value)?);
            }
            matched.push(candidate.clone());

            let mut child = self.child(candidate);
            if let Some(condition) = child.search_for_ids_with_and_or(None, candidate, name, &[or_values])? {
                child.add_predicate(condition);
            }
            // binds of the child must land before the type placeholder
            let Some(subquery) = self.finish_child(child) else {
                continue;
            };
            let type_value = self.sql.bind(candidate.as_str());
            branches.push(Condition::and([
                Some(Condition::eq(link.column("target_resource_type"), type_value)),
                Some(Condition::in_subquery(link.column("target_resource_id"), subquery, false)),
            ]));
        }

        if matched.is_empty() {
            return Err(SearchError::invalid(format!("Invalid parameter chain: {}.{chain}", def.name)).into());
        }
        if matched.len() > 1 {
            self.warn_unqualified(&def.name, matched.as_slice());
        }
        Ok(Some(Condition::or(branches).unwrap_or(Condition::Never)))
    }

    /// `_has:Observation:subject:code=1234`; one condition per AND-group
    pub(super) fn has_predicate(
        &mut self,
        source: Option<ColumnRef>,
        resource_type: &str,
        and_or: &[Vec<ParamValue>],
    ) -> Result<Option<Condition>> {
        let mut conditions = Vec::with_capacity(and_or.len());
        for or_list in and_or {
            let values = or_list
                .iter()
                .map(|value| match value {
                    ParamValue::Has(has) => Ok(has),
                    other => Err(SearchError::invalid(format!(
                        "Invalid {} for _has parameter on resource type \"{resource_type}\"",
                        other.kind()
                    ))),
                })
                .collect::<shirabe_core::Result<Vec<&HasParam>>>()?;
            let Some(first) = values.first() else {
                continue;
            };
            conditions.push(Some(self.single_has_predicate(source, first, &values)?));
        }
        Ok(Condition::and(conditions))
    }

    /// Pids referenced through `reference_field` by target rows matching the inner parameter
    fn single_has_predicate(
        &mut self,
        source: Option<ColumnRef>,
        first: &HasParam,
        values: &[&HasParam],
    ) -> Result<Condition> {
        let ctx = self.ctx;
        let registry = ctx.registry.as_ref();
        let target = first.target_resource_type.as_str();
        if !registry.is_resource_type(target) {
            return Err(invalid_resource_type(target).into());
        }
        let reference_def = registry
            .get_active_search_param(target, &first.reference_field)
            .filter(|def| def.param_type == SearchParamType::Reference)
            .ok_or_else(|| {
                SearchError::invalid(format!(
                    "Unknown reference parameter \"{}\" for resource type \"{target}\" in _has parameter",
                    first.reference_field
                ))
            })?;

        let (param_name, or_values) = match first.parameter_name.strip_prefix("_has:") {
            Some(nested) => {
                let nested_values = values
                    .iter()
                    .map(|v| HasParam::parse(nested, &v.value).map(ParamValue::Has))
                    .collect::<shirabe_core::Result<Vec<_>>>()?;
                ("_has", nested_values)
            }
            None => {
                let (name, qualifier) = split_parameter_name(&first.parameter_name);
                let mut parsed = Vec::with_capacity(values.len());
                for value in values {
                    parsed.extend(parse_raw_value(registry, target, name, qualifier, &value.value)?);
                }
                (name, parsed)
            }
        };

        let source = self.source_column(source);
        let mut child = self.child(target);
        let link = child.sql.add_table(LINK_TABLE, "target_resource_id", None);
        let path = path_predicate(&mut child.sql, link, target, &reference_def);
        child.add_predicate(path);
        if let Some(partition) = child.sql.partition_predicate(link) {
            child.add_predicate(partition);
        }
        let referrer = link.column("src_resource_id");
        if let Some(condition) = child.search_for_ids_with_and_or(Some(referrer), target, param_name, &[or_values])? {
            child.add_predicate(condition);
        }
        Ok(match self.finish_child(child) {
            Some(subquery) => Condition::in_subquery(source, subquery, false),
            None => Condition::Never,
        })
    }
}
