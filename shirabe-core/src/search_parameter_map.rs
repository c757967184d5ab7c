//! The parsed form of a search request.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::include::{EverythingMode, Include, SortSpec};
use crate::search_param::{
    parse_value, split_escaped, unescape, CompareOp, CompositeParam, DateRange, HasParam,
    ParamValue, SearchParamType,
};
use crate::search_param_registry::SearchParamRegistry;

/// One parameter's AND-list of OR-lists
pub type AndOrList = Vec<Vec<ParamValue>>;

/// Inclusive `_lastUpdated` bounds in epoch milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRangeParam {
    pub low: Option<i64>,
    pub high: Option<i64>,
}

impl DateRangeParam {
    /// Narrow the range with one prefixed bound (`ge2020`, `lt2021-06`)
    pub fn add_bound(&mut self, op: CompareOp, range: DateRange) -> Result<()> {
        let (low, high) = match op {
            CompareOp::Eq => (Some(range.low), Some(range.high)),
            CompareOp::Ge => (Some(range.low), None),
            CompareOp::Gt => (Some(range.high + 1), None),
            CompareOp::Le => (None, Some(range.high)),
            CompareOp::Lt => (None, Some(range.low - 1)),
            other => {
                return Err(SearchError::invalid(format!(
                    "Invalid prefix \"{other}\" for _lastUpdated"
                )));
            }
        };
        if let Some(low) = low {
            self.low = Some(self.low.map_or(low, |current| current.max(low)));
        }
        if let Some(high) = high {
            self.high = Some(self.high.map_or(high, |current| current.min(high)));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.low.is_none() && self.high.is_none()
    }

    pub fn matches(&self, instant_ms: i64) -> bool {
        self.low.is_none_or(|low| instant_ms >= low) && self.high.is_none_or(|high| instant_ms <= high)
    }
}

/// Ordered mapping from parameter name to its AND-list of OR-lists.
///
/// Insertion order is preserved: join reuse depends on the order in which
/// parameters are turned into predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParameterMap {
    params: Vec<(String, AndOrList)>,
    pub sort: Option<SortSpec>,
    pub includes: Vec<Include>,
    pub rev_includes: Vec<Include>,
    pub last_updated: Option<DateRangeParam>,
    pub count: Option<usize>,
    pub everything_mode: Option<EverythingMode>,
    pub last_n: bool,
}

impl SearchParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one AND-term (an OR-list) to `name`
    pub fn add(&mut self, name: &str, or_list: Vec<ParamValue>) {
        match self.params.iter_mut().find(|(n, _)| n == name) {
            Some((_, and_list)) => and_list.push(or_list),
            None => self.params.push((name.to_string(), vec![or_list])),
        }
    }

    /// Builder-style [`SearchParameterMap::add`] for a single value
    pub fn and(mut self, name: &str, value: ParamValue) -> Self {
        self.add(name, vec![value]);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AndOrList> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<AndOrList> {
        let idx = self.params.iter().position(|(n, _)| n == name)?;
        Some(self.params.remove(idx).1)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AndOrList)> {
        self.params.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Drop empty OR-lists, then parameters left without any AND-term
    pub fn clean(&mut self) {
        for (_, and_list) in &mut self.params {
            and_list.retain(|or_list| !or_list.is_empty());
        }
        self.params.retain(|(_, and_list)| !and_list.is_empty());
    }

    pub fn is_all_parameters_have_no_modifier(&self) -> bool {
        self.params
            .iter()
            .flat_map(|(_, and_list)| and_list.iter().flatten())
            .all(|value| !value.has_modifier())
    }

    /// Parse a URL query string (`name:modifier=a,b&other=c`) for `resource_type`.
    ///
    /// Parameter names the registry does not know are kept as plain strings;
    /// they are rejected when predicates are built.
    pub fn parse(
        resource_type: &str,
        query: &str,
        registry: &dyn SearchParamRegistry,
    ) -> Result<Self> {
        let mut map = Self::new();
        let query = query.strip_prefix('?').unwrap_or(query);

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode(raw_key)?;
            let value = decode(raw_value)?;

            match key.as_str() {
                "_sort" => match (map.sort.as_mut(), SortSpec::parse(&value)) {
                    (Some(existing), Some(next)) => existing.push_back(next),
                    (None, next) => map.sort = next,
                    (Some(_), None) => {}
                },
                "_count" => {
                    let count = value.parse().map_err(|_| {
                        SearchError::invalid(format!("Invalid _count value: \"{value}\""))
                    })?;
                    map.count = Some(count);
                }
                "_lastUpdated" => {
                    let (op, rest) = CompareOp::split_prefix(&value);
                    let range = DateRange::parse(rest)?;
                    map.last_updated
                        .get_or_insert_with(DateRangeParam::default)
                        .add_bound(op, range)?;
                }
                "_format" | "_pretty" | "_summary" | "_elements" | "_total" => {}
                _ if key.starts_with("_include") || key.starts_with("_revinclude") => {
                    let recurse = key.ends_with(":iterate") || key.ends_with(":recurse");
                    let include = Include::new(value.clone(), recurse);
                    if key.starts_with("_include") {
                        map.includes.push(include);
                    } else {
                        map.rev_includes.push(include);
                    }
                }
                _ => {
                    if let Some(qualifier) = key.strip_prefix("_has:") {
                        let values = split_escaped(&value, ',')
                            .iter()
                            .map(|v| HasParam::parse(qualifier, &unescape(v)).map(ParamValue::Has))
                            .collect::<Result<Vec<_>>>()?;
                        map.add("_has", values);
                        continue;
                    }
                    let (name, qualifier) = split_parameter_name(&key);
                    let values = parse_parameter(resource_type, name, qualifier, &value, registry)?;
                    map.add(name, values);
                }
            }
        }
        Ok(map)
    }
}

fn decode(raw: &str) -> Result<String> {
    let plus_decoded = raw.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|s| s.into_owned())
        .map_err(|e| SearchError::invalid(format!("Invalid URL encoding in \"{raw}\": {e}")))
}

/// `subject:Patient.name` -> `("subject", Some(":Patient.name"))`
pub fn split_parameter_name(key: &str) -> (&str, Option<&str>) {
    match key.find([':', '.']) {
        Some(idx) => (&key[..idx], Some(&key[idx..])),
        None => (key, None),
    }
}

/// Declared type of a parameter, including the built-in `_` parameters
pub fn parameter_type(
    resource_type: &str,
    name: &str,
    registry: &dyn SearchParamRegistry,
) -> Option<SearchParamType> {
    match name {
        "_id" | "_tag" | "_security" => Some(SearchParamType::Token),
        "_language" | "_content" | "_text" | "_filter" => Some(SearchParamType::String),
        "_profile" | "_source" => Some(SearchParamType::Uri),
        _ => registry
            .get_active_search_param(resource_type, name)
            .map(|p| p.param_type),
    }
}

/// Parse the raw (URL-decoded) value of one parameter occurrence into its OR-list
pub fn parse_parameter(
    resource_type: &str,
    name: &str,
    qualifier: Option<&str>,
    raw_value: &str,
    registry: &dyn SearchParamRegistry,
) -> Result<Vec<ParamValue>> {
    let param_type = parameter_type(resource_type, name, registry);

    if qualifier == Some(":missing") {
        let missing = match raw_value {
            "true" => true,
            "false" => false,
            other => {
                return Err(SearchError::invalid(format!(
                    "Invalid :missing value \"{other}\" for parameter \"{name}\", expected true or false"
                )));
            }
        };
        let param_type = param_type.unwrap_or(SearchParamType::String);
        return Ok(vec![ParamValue::missing_of(param_type, missing)]);
    }

    // The whole expression is one value; commas belong to it.
    if name == "_filter" {
        return parse_value(name, SearchParamType::String, None, raw_value).map(|v| vec![v]);
    }

    let Some(param_type) = param_type else {
        return Ok(split_escaped(raw_value, ',')
            .iter()
            .map(|v| ParamValue::String(crate::search_param::StringParam::new(unescape(v))))
            .collect());
    };

    if param_type == SearchParamType::Composite {
        return parse_composite(resource_type, name, qualifier, raw_value, registry);
    }

    split_escaped(raw_value, ',')
        .iter()
        .map(|v| parse_value(name, param_type, qualifier, v))
        .collect()
}

fn parse_composite(
    resource_type: &str,
    name: &str,
    qualifier: Option<&str>,
    raw_value: &str,
    registry: &dyn SearchParamRegistry,
) -> Result<Vec<ParamValue>> {
    if let Some(q) = qualifier {
        return Err(SearchError::invalid(format!(
            "Invalid modifier \"{q}\" for composite parameter \"{name}\""
        )));
    }
    let def = registry
        .get_active_search_param(resource_type, name)
        .ok_or_else(|| SearchError::internal(format!("Composite \"{name}\" disappeared")))?;
    let [left_name, right_name] = def.components.as_slice() else {
        return Err(SearchError::invalid(format!(
            "Composite parameter \"{name}\" must have exactly two components"
        )));
    };
    let component_type = |component: &str| {
        parameter_type(resource_type, component, registry).ok_or_else(|| {
            SearchError::invalid(format!(
                "Unknown component \"{component}\" of composite parameter \"{name}\""
            ))
        })
    };
    let left_type = component_type(left_name)?;
    let right_type = component_type(right_name)?;

    split_escaped(raw_value, ',')
        .iter()
        .map(|value| {
            let parts = split_escaped(value, '$');
            let [left, right] = parts.as_slice() else {
                return Err(SearchError::invalid(format!(
                    "Invalid value for composite parameter \"{name}\" (expected 'a$b'): \"{value}\""
                )));
            };
            Ok(ParamValue::Composite(CompositeParam {
                left: Box::new(parse_value(left_name, left_type, None, left)?),
                right: Box::new(parse_value(right_name, right_type, None, right)?),
                missing: None,
            }))
        })
        .collect()
}
