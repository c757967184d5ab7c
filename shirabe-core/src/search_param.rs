//! Parsed search parameter values.
//!
//! Wire strings are split into OR-values by the map parser; every OR-value is
//! turned into one [`ParamValue`] variant here, according to the declared type
//! of the parameter it belongs to.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};

/// Declared value type of a search parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamType {
    Number,
    Date,
    String,
    Token,
    Reference,
    Composite,
    Quantity,
    Uri,
    Special,
}

impl SearchParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Number => "NUMBER",
            Self::Date => "DATE",
            Self::String => "STRING",
            Self::Token => "TOKEN",
            Self::Reference => "REFERENCE",
            Self::Composite => "COMPOSITE",
            Self::Quantity => "QUANTITY",
            Self::Uri => "URI",
            Self::Special => "SPECIAL",
        }
    }
}

impl fmt::Display for SearchParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operator attached to a value.
///
/// Prefixes (`ge2020`) and `_filter` operators share this type. Values parsed
/// without an explicit prefix carry [`CompareOp::DEFAULT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Sa,
    Eb,
    Ap,
    Co,
    Sw,
    Ew,
    Pr,
    Po,
    Ss,
    Sb,
    In,
    Re,
}

impl CompareOp {
    pub const DEFAULT: CompareOp = CompareOp::Eq;

    const PREFIXES: [CompareOp; 9] = [
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Gt,
        CompareOp::Lt,
        CompareOp::Ge,
        CompareOp::Le,
        CompareOp::Sa,
        CompareOp::Eb,
        CompareOp::Ap,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Ge => "ge",
            Self::Le => "le",
            Self::Sa => "sa",
            Self::Eb => "eb",
            Self::Ap => "ap",
            Self::Co => "co",
            Self::Sw => "sw",
            Self::Ew => "ew",
            Self::Pr => "pr",
            Self::Po => "po",
            Self::Ss => "ss",
            Self::Sb => "sb",
            Self::In => "in",
            Self::Re => "re",
        }
    }

    /// Look up a `_filter` operator by its two-letter code
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.to_ascii_lowercase();
        [
            Self::Eq,
            Self::Ne,
            Self::Gt,
            Self::Lt,
            Self::Ge,
            Self::Le,
            Self::Sa,
            Self::Eb,
            Self::Ap,
            Self::Co,
            Self::Sw,
            Self::Ew,
            Self::Pr,
            Self::Po,
            Self::Ss,
            Self::Sb,
            Self::In,
            Self::Re,
        ]
        .into_iter()
        .find(|op| op.code() == code)
    }

    /// Split a value prefix (`ge2020-01-01` -> `(Ge, "2020-01-01")`).
    ///
    /// Only the nine ordered-value prefixes are recognised; anything else is
    /// left in the value and the default operator is returned.
    pub fn split_prefix(raw: &str) -> (CompareOp, &str) {
        if raw.len() > 2 && raw.is_char_boundary(2) {
            let (head, rest) = raw.split_at(2);
            if let Some(op) = Self::PREFIXES.iter().find(|op| op.code() == head) {
                return (*op, rest);
            }
        }
        (Self::DEFAULT, raw)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatePrecision {
    Year,
    Month,
    Day,
    Minute,
    Second,
    Milli,
}

/// Inclusive instant range covered by a partial date, in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub low: i64,
    pub high: i64,
    pub precision: DatePrecision,
}

impl DateRange {
    /// Parse a FHIR date, dateTime or instant into the range it denotes.
    ///
    /// `2020` covers the whole year, `2020-02` the month, `2020-02-03` the
    /// day. Times without an offset are read as UTC.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || SearchError::invalid(format!("Invalid date/time format: \"{raw}\""));
        let raw = raw.trim();

        if !raw.contains('T') {
            let parts: Vec<&str> = raw.split('-').collect();
            let year: i32 = parts
                .first()
                .filter(|y| y.len() == 4)
                .and_then(|y| y.parse().ok())
                .ok_or_else(invalid)?;
            let (start, end, precision) = match parts.len() {
                1 => {
                    let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)?;
                    let end = NaiveDate::from_ymd_opt(year + 1, 1, 1).ok_or_else(invalid)?;
                    (start, end, DatePrecision::Year)
                }
                2 => {
                    let month: u32 = parts[1].parse().map_err(|_| invalid())?;
                    let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
                    let end = start.checked_add_months(Months::new(1)).ok_or_else(invalid)?;
                    (start, end, DatePrecision::Month)
                }
                3 => {
                    let start = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| invalid())?;
                    let end = start.succ_opt().ok_or_else(invalid)?;
                    (start, end, DatePrecision::Day)
                }
                _ => return Err(invalid()),
            };
            let low = start.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc();
            let high = end.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc();
            return Ok(Self {
                low: low.timestamp_millis(),
                high: high.timestamp_millis() - 1,
                precision,
            });
        }

        let (instant, precision) = parse_date_time(raw).ok_or_else(invalid)?;
        let width = match precision {
            DatePrecision::Minute => TimeDelta::minutes(1),
            DatePrecision::Second => TimeDelta::seconds(1),
            _ => TimeDelta::milliseconds(1),
        };
        let low = instant.timestamp_millis();
        Ok(Self {
            low,
            high: low + width.num_milliseconds() - 1,
            precision,
        })
    }

    pub fn contains(&self, instant_ms: i64) -> bool {
        self.low <= instant_ms && instant_ms <= self.high
    }
}

fn parse_date_time(raw: &str) -> Option<(DateTime<Utc>, DatePrecision)> {
    let normalized = match raw.strip_suffix('Z') {
        Some(head) => format!("{head}+00:00"),
        None => raw.to_string(),
    };
    let time_part = normalized.split('T').nth(1)?;
    let has_offset = time_part.contains('+') || time_part.contains('-');
    let precision = if time_part.contains('.') {
        DatePrecision::Milli
    } else if time_part.matches(':').count() >= if has_offset { 3 } else { 2 } {
        DatePrecision::Second
    } else {
        DatePrecision::Minute
    };

    let instant = if has_offset {
        match precision {
            DatePrecision::Minute => {
                DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M%:z").ok()?
            }
            _ => DateTime::parse_from_rfc3339(&normalized).ok()?,
        }
        .with_timezone(&Utc)
    } else {
        let format = match precision {
            DatePrecision::Minute => "%Y-%m-%dT%H:%M",
            _ => "%Y-%m-%dT%H:%M:%S%.f",
        };
        NaiveDateTime::parse_from_str(&normalized, format)
            .ok()?
            .and_utc()
    };
    Some((instant, precision))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringParam {
    pub value: String,
    pub exact: bool,
    pub contains: bool,
    pub text: bool,
    pub missing: Option<bool>,
}

impl StringParam {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            exact: false,
            contains: false,
            text: false,
            missing: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenModifier {
    Text,
    Not,
    Above,
    Below,
    In,
    NotIn,
    OfType,
}

impl TokenModifier {
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "text" => Some(Self::Text),
            "not" => Some(Self::Not),
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            "in" => Some(Self::In),
            "not-in" => Some(Self::NotIn),
            "of-type" => Some(Self::OfType),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Not => "not",
            Self::Above => "above",
            Self::Below => "below",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::OfType => "of-type",
        }
    }
}

/// `system|code`; `Some("")` as system means "explicitly no system" (`|code`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenParam {
    pub system: Option<String>,
    pub value: Option<String>,
    pub modifier: Option<TokenModifier>,
    pub missing: Option<bool>,
}

impl TokenParam {
    pub fn new(system: Option<&str>, value: Option<&str>) -> Self {
        Self {
            system: system.map(str::to_string),
            value: value.map(str::to_string),
            modifier: None,
            missing: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateParam {
    pub prefix: CompareOp,
    pub value: String,
    pub range: Option<DateRange>,
    pub missing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberParam {
    pub prefix: CompareOp,
    pub value: Option<Decimal>,
    pub missing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantityParam {
    pub prefix: CompareOp,
    pub value: Option<Decimal>,
    pub system: Option<String>,
    pub units: Option<String>,
    pub missing: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UriModifier {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UriParam {
    pub value: String,
    pub modifier: Option<UriModifier>,
    pub missing: Option<bool>,
}

/// Reference value, optionally qualified (`subject:Patient=123`) or chained
/// (`subject.name=Doe`, in which case `value` belongs to the chained parameter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceParam {
    pub resource_type: Option<String>,
    pub chain: Option<String>,
    pub value: String,
    pub missing: Option<bool>,
}

impl ReferenceParam {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            resource_type: None,
            chain: None,
            value: value.into(),
            missing: None,
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.value.starts_with("http://") || self.value.starts_with("https://")
    }

    /// Split the value into `(resource type, id)`.
    ///
    /// `Patient/123/_history/4` yields `(Some("Patient"), "123")`; a bare id
    /// falls back to the qualifier type.
    pub fn target(&self) -> (Option<&str>, &str) {
        let value = match self.value.find("/_history") {
            Some(idx) => &self.value[..idx],
            None => self.value.as_str(),
        };
        match value.rsplit_once('/') {
            Some((head, id)) => {
                let resource_type = head.rsplit('/').next().filter(|t| !t.is_empty());
                (resource_type.or(self.resource_type.as_deref()), id)
            }
            None => (self.resource_type.as_deref(), value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeParam {
    pub left: Box<ParamValue>,
    pub right: Box<ParamValue>,
    pub missing: Option<bool>,
}

/// `_has:Observation:subject:code=1234`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HasParam {
    pub target_resource_type: String,
    pub reference_field: String,
    pub parameter_name: String,
    pub value: String,
    pub missing: Option<bool>,
}

impl HasParam {
    /// Parse the qualifier part of a `_has` key (everything after `_has:`)
    pub fn parse(qualifier: &str, value: &str) -> Result<Self> {
        let mut parts = qualifier.splitn(3, ':');
        let target = parts.next().unwrap_or_default();
        let reference = parts.next().unwrap_or_default();
        let parameter = parts.next().unwrap_or_default();
        if target.is_empty() || reference.is_empty() || parameter.is_empty() {
            return Err(SearchError::invalid(format!(
                "Invalid _has parameter syntax: _has:{qualifier}"
            )));
        }
        Ok(Self {
            target_resource_type: target.to_string(),
            reference_field: reference.to_string(),
            parameter_name: parameter.to_string(),
            value: value.to_string(),
            missing: None,
        })
    }
}

/// Free-form value for special parameters (`near=lat|lon|distance|units`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialParam {
    pub value: String,
    pub missing: Option<bool>,
}

/// One parsed OR-value of a search parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamValue {
    String(StringParam),
    Token(TokenParam),
    Date(DateParam),
    Number(NumberParam),
    Quantity(QuantityParam),
    Uri(UriParam),
    Reference(ReferenceParam),
    Composite(CompositeParam),
    Has(HasParam),
    Special(SpecialParam),
}

impl ParamValue {
    /// The `:missing` flag; when set the value itself carries no meaning
    pub fn missing(&self) -> Option<bool> {
        match self {
            Self::String(p) => p.missing,
            Self::Token(p) => p.missing,
            Self::Date(p) => p.missing,
            Self::Number(p) => p.missing,
            Self::Quantity(p) => p.missing,
            Self::Uri(p) => p.missing,
            Self::Reference(p) => p.missing,
            Self::Composite(p) => p.missing,
            Self::Has(p) => p.missing,
            Self::Special(p) => p.missing,
        }
    }

    /// A value standing only for `:missing=true|false` of the given type
    pub fn missing_of(param_type: SearchParamType, missing: bool) -> Self {
        let missing = Some(missing);
        match param_type {
            SearchParamType::String => Self::String(StringParam {
                missing,
                ..StringParam::new("")
            }),
            SearchParamType::Token => Self::Token(TokenParam {
                missing,
                ..TokenParam::new(None, None)
            }),
            SearchParamType::Date => Self::Date(DateParam {
                prefix: CompareOp::DEFAULT,
                value: String::new(),
                range: None,
                missing,
            }),
            SearchParamType::Number => Self::Number(NumberParam {
                prefix: CompareOp::DEFAULT,
                value: None,
                missing,
            }),
            SearchParamType::Quantity => Self::Quantity(QuantityParam {
                prefix: CompareOp::DEFAULT,
                value: None,
                system: None,
                units: None,
                missing,
            }),
            SearchParamType::Uri => Self::Uri(UriParam {
                value: String::new(),
                modifier: None,
                missing,
            }),
            SearchParamType::Reference => Self::Reference(ReferenceParam {
                missing,
                ..ReferenceParam::new("")
            }),
            SearchParamType::Composite => Self::Composite(CompositeParam {
                left: Box::new(Self::missing_of(SearchParamType::String, false)),
                right: Box::new(Self::missing_of(SearchParamType::String, false)),
                missing,
            }),
            SearchParamType::Special => Self::Special(SpecialParam {
                value: String::new(),
                missing,
            }),
        }
    }

    /// True when the value was qualified with a modifier, a chain, or `:missing`
    pub fn has_modifier(&self) -> bool {
        if self.missing().is_some() {
            return true;
        }
        match self {
            Self::String(p) => p.exact || p.contains || p.text,
            Self::Token(p) => p.modifier.is_some(),
            Self::Uri(p) => p.modifier.is_some(),
            Self::Reference(p) => p.chain.is_some(),
            Self::Has(_) => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "StringParam",
            Self::Token(_) => "TokenParam",
            Self::Date(_) => "DateParam",
            Self::Number(_) => "NumberParam",
            Self::Quantity(_) => "QuantityParam",
            Self::Uri(_) => "UriParam",
            Self::Reference(_) => "ReferenceParam",
            Self::Composite(_) => "CompositeParam",
            Self::Has(_) => "HasParam",
            Self::Special(_) => "SpecialParam",
        }
    }

    /// Render the value back into its query-string form (unescaped)
    pub fn value_as_query_token(&self) -> String {
        match self {
            Self::String(p) => p.value.clone(),
            Self::Token(p) => match (&p.system, &p.value) {
                (Some(system), Some(value)) => format!("{system}|{value}"),
                (Some(system), None) => format!("{system}|"),
                (None, Some(value)) => value.clone(),
                (None, None) => String::new(),
            },
            Self::Date(p) => prefixed(p.prefix, &p.value),
            Self::Number(p) => prefixed(
                p.prefix,
                &p.value.map(|v| v.to_string()).unwrap_or_default(),
            ),
            Self::Quantity(p) => {
                let number = p.value.map(|v| v.to_string()).unwrap_or_default();
                match (&p.system, &p.units) {
                    (None, None) => prefixed(p.prefix, &number),
                    (system, units) => prefixed(
                        p.prefix,
                        &format!(
                            "{number}|{}|{}",
                            system.as_deref().unwrap_or_default(),
                            units.as_deref().unwrap_or_default()
                        ),
                    ),
                }
            }
            Self::Uri(p) => p.value.clone(),
            Self::Reference(p) => p.value.clone(),
            Self::Composite(p) => format!(
                "{}${}",
                p.left.value_as_query_token(),
                p.right.value_as_query_token()
            ),
            Self::Has(p) => p.value.clone(),
            Self::Special(p) => p.value.clone(),
        }
    }
}

fn prefixed(prefix: CompareOp, value: &str) -> String {
    if prefix == CompareOp::DEFAULT {
        value.to_string()
    } else {
        format!("{prefix}{value}")
    }
}

/// Split on an unescaped delimiter. Escape sequences are kept intact so the
/// pieces can be split again on another delimiter before [`unescape`].
pub fn split_escaped(raw: &str, delimiter: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == delimiter {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

/// Remove FHIR search escapes (`\,` `\|` `\$` `\\`)
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a decimal, keeping the scale the client wrote (`1.00` has scale 2)
pub fn parse_decimal(raw: &str) -> Result<Decimal> {
    let parsed = if raw.contains(['e', 'E']) {
        Decimal::from_scientific(raw)
    } else {
        Decimal::from_str(raw)
    };
    parsed.map_err(|_| SearchError::invalid(format!("Invalid number value: \"{raw}\"")))
}

/// Parse one OR-value of a non-composite parameter.
///
/// `qualifier` is the raw text following the parameter name (`:exact`,
/// `:Patient.name`, `.name`), without `:missing` which the map parser handles.
pub fn parse_value(
    param_name: &str,
    param_type: SearchParamType,
    qualifier: Option<&str>,
    raw: &str,
) -> Result<ParamValue> {
    let modifier = qualifier.and_then(|q| q.strip_prefix(':'));
    let unsupported = |m: &str| {
        SearchError::invalid(format!(
            "Invalid modifier \":{m}\" for {} parameter \"{param_name}\"",
            param_type.as_str().to_ascii_lowercase()
        ))
    };
    if param_type != SearchParamType::Reference
        && let Some(q) = qualifier
        && q.starts_with('.')
    {
        return Err(SearchError::invalid(format!(
            "Invalid chain \"{param_name}{q}\": only reference parameters can be chained"
        )));
    }

    match param_type {
        SearchParamType::String => {
            let mut param = StringParam::new(unescape(raw));
            match modifier {
                None => {}
                Some("exact") => param.exact = true,
                Some("contains") => param.contains = true,
                Some("text") => param.text = true,
                Some(m) => return Err(unsupported(m)),
            }
            Ok(ParamValue::String(param))
        }
        SearchParamType::Token => {
            let modifier = match modifier {
                None => None,
                Some(m) => Some(TokenModifier::parse(m).ok_or_else(|| unsupported(m))?),
            };
            let pieces = split_escaped(raw, '|');
            let (system, value) = if pieces.len() == 1 {
                (None, Some(unescape(&pieces[0])))
            } else {
                let value = unescape(&pieces[1..].join("|"));
                (Some(unescape(&pieces[0])), (!value.is_empty()).then_some(value))
            };
            Ok(ParamValue::Token(TokenParam {
                system,
                value,
                modifier,
                missing: None,
            }))
        }
        SearchParamType::Date => {
            if let Some(m) = modifier {
                return Err(unsupported(m));
            }
            let (prefix, rest) = CompareOp::split_prefix(raw);
            let range = DateRange::parse(rest)?;
            Ok(ParamValue::Date(DateParam {
                prefix,
                value: rest.to_string(),
                range: Some(range),
                missing: None,
            }))
        }
        SearchParamType::Number => {
            if let Some(m) = modifier {
                return Err(unsupported(m));
            }
            let (prefix, rest) = CompareOp::split_prefix(raw);
            Ok(ParamValue::Number(NumberParam {
                prefix,
                value: Some(parse_decimal(rest)?),
                missing: None,
            }))
        }
        SearchParamType::Quantity => {
            if let Some(m) = modifier {
                return Err(unsupported(m));
            }
            let (prefix, rest) = CompareOp::split_prefix(raw);
            let pieces = split_escaped(rest, '|');
            let non_empty = |idx: usize| {
                pieces
                    .get(idx)
                    .map(|p| unescape(p))
                    .filter(|p| !p.is_empty())
            };
            Ok(ParamValue::Quantity(QuantityParam {
                prefix,
                value: Some(parse_decimal(&unescape(&pieces[0]))?),
                system: non_empty(1),
                units: non_empty(2),
                missing: None,
            }))
        }
        SearchParamType::Uri => {
            let modifier = match modifier {
                None => None,
                Some("above") => Some(UriModifier::Above),
                Some("below") => Some(UriModifier::Below),
                Some(m) => return Err(unsupported(m)),
            };
            Ok(ParamValue::Uri(UriParam {
                value: unescape(raw),
                modifier,
                missing: None,
            }))
        }
        SearchParamType::Reference => {
            let mut param = ReferenceParam::new(unescape(raw));
            if let Some(q) = qualifier {
                if let Some(chain) = q.strip_prefix('.') {
                    param.chain = Some(chain.to_string());
                } else if let Some(rest) = q.strip_prefix(':') {
                    match rest.split_once('.') {
                        Some((resource_type, chain)) => {
                            param.resource_type = Some(resource_type.to_string());
                            param.chain = Some(chain.to_string());
                        }
                        None => param.resource_type = Some(rest.to_string()),
                    }
                }
            }
            if param.chain.as_deref() == Some("") || param.resource_type.as_deref() == Some("") {
                return Err(SearchError::invalid(format!(
                    "Invalid reference qualifier \"{param_name}{}\"",
                    qualifier.unwrap_or_default()
                )));
            }
            Ok(ParamValue::Reference(param))
        }
        SearchParamType::Special => Ok(ParamValue::Special(SpecialParam {
            value: unescape(raw),
            missing: None,
        })),
        SearchParamType::Composite => Err(SearchError::internal(format!(
            "Composite parameter \"{param_name}\" must be parsed with its components"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_prefix() {
        assert_eq!(CompareOp::split_prefix("ge2020"), (CompareOp::Ge, "2020"));
        assert_eq!(CompareOp::split_prefix("2020"), (CompareOp::Eq, "2020"));
        assert_eq!(CompareOp::split_prefix("ap5.4"), (CompareOp::Ap, "5.4"));
        // "co" is a _filter operator, not a value prefix
        assert_eq!(CompareOp::split_prefix("co12"), (CompareOp::Eq, "co12"));
    }

    #[test]
    fn test_date_range_year_month_day() {
        let year = DateRange::parse("2020").unwrap();
        assert_eq!(year.precision, DatePrecision::Year);
        assert_eq!(year.low, 1_577_836_800_000);
        assert_eq!(year.high, 1_609_459_200_000 - 1);

        let month = DateRange::parse("2020-02").unwrap();
        assert_eq!(month.high - month.low + 1, 29 * 86_400_000);

        let day = DateRange::parse("2020-02-03").unwrap();
        assert_eq!(day.high - day.low + 1, 86_400_000);
        assert!(year.contains(day.low));
    }

    #[test]
    fn test_date_range_date_time() {
        let second = DateRange::parse("2020-01-01T10:00:00Z").unwrap();
        assert_eq!(second.precision, DatePrecision::Second);
        assert_eq!(second.high - second.low, 999);

        let offset = DateRange::parse("2020-01-01T12:00:00+02:00").unwrap();
        assert_eq!(offset.low, second.low);

        let minute = DateRange::parse("2020-01-01T10:00").unwrap();
        assert_eq!(minute.precision, DatePrecision::Minute);
        assert_eq!(minute.low, second.low);

        let milli = DateRange::parse("2020-01-01T10:00:00.250Z").unwrap();
        assert_eq!(milli.low, milli.high);
    }

    #[test]
    fn test_date_range_rejects_garbage() {
        assert!(DateRange::parse("20").is_err());
        assert!(DateRange::parse("2020-13").is_err());
        assert!(DateRange::parse("yesterday").is_err());
    }

    #[test]
    fn test_parse_token_forms() {
        let ParamValue::Token(t) = parse_value("code", SearchParamType::Token, None, "http://loinc.org|1234").unwrap() else {
            panic!("expected token");
        };
        assert_eq!(t.system.as_deref(), Some("http://loinc.org"));
        assert_eq!(t.value.as_deref(), Some("1234"));

        let ParamValue::Token(t) = parse_value("code", SearchParamType::Token, None, "|1234").unwrap() else {
            panic!("expected token");
        };
        assert_eq!(t.system.as_deref(), Some(""));

        let ParamValue::Token(t) = parse_value("code", SearchParamType::Token, None, "http://loinc.org|").unwrap() else {
            panic!("expected token");
        };
        assert_eq!(t.value, None);

        let ParamValue::Token(t) = parse_value("code", SearchParamType::Token, Some(":not"), "a\\|b").unwrap() else {
            panic!("expected token");
        };
        assert_eq!(t.system, None);
        assert_eq!(t.value.as_deref(), Some("a|b"));
        assert_eq!(t.modifier, Some(TokenModifier::Not));
    }

    #[test]
    fn test_parse_number_keeps_scale() {
        let ParamValue::Number(n) = parse_value("probability", SearchParamType::Number, None, "1.00").unwrap() else {
            panic!("expected number");
        };
        assert_eq!(n.value.unwrap().scale(), 2);
        assert_eq!(n.prefix, CompareOp::Eq);

        let ParamValue::Number(n) = parse_value("probability", SearchParamType::Number, None, "gt1e2").unwrap() else {
            panic!("expected number");
        };
        assert_eq!(n.prefix, CompareOp::Gt);
        assert_eq!(n.value.unwrap(), Decimal::from(100));
    }

    #[test]
    fn test_parse_quantity() {
        let ParamValue::Quantity(q) = parse_value(
            "value-quantity",
            SearchParamType::Quantity,
            None,
            "le5.4|http://unitsofmeasure.org|mg",
        )
        .unwrap() else {
            panic!("expected quantity");
        };
        assert_eq!(q.prefix, CompareOp::Le);
        assert_eq!(q.system.as_deref(), Some("http://unitsofmeasure.org"));
        assert_eq!(q.units.as_deref(), Some("mg"));

        let ParamValue::Quantity(q) =
            parse_value("value-quantity", SearchParamType::Quantity, None, "5.4||mg").unwrap()
        else {
            panic!("expected quantity");
        };
        assert_eq!(q.system, None);
        assert_eq!(q.units.as_deref(), Some("mg"));
    }

    #[test]
    fn test_parse_reference_qualifiers() {
        let ParamValue::Reference(r) = parse_value(
            "subject",
            SearchParamType::Reference,
            Some(":Patient.name"),
            "Doe",
        )
        .unwrap() else {
            panic!("expected reference");
        };
        assert_eq!(r.resource_type.as_deref(), Some("Patient"));
        assert_eq!(r.chain.as_deref(), Some("name"));

        let ParamValue::Reference(r) =
            parse_value("subject", SearchParamType::Reference, None, "Patient/123/_history/2").unwrap()
        else {
            panic!("expected reference");
        };
        assert_eq!(r.target(), (Some("Patient"), "123"));
        assert!(!r.is_absolute());

        let r = ReferenceParam::new("http://example.org/fhir/Patient/9");
        assert!(r.is_absolute());
        assert_eq!(r.target(), (Some("Patient"), "9"));
    }

    #[test]
    fn test_chain_on_non_reference_is_rejected() {
        let err = parse_value("name", SearchParamType::String, Some(".family"), "x").unwrap_err();
        assert!(matches!(err, SearchError::InvalidRequest(_)));
    }

    #[test]
    fn test_unknown_modifier_is_rejected() {
        let err = parse_value("name", SearchParamType::String, Some(":sounds-like"), "x").unwrap_err();
        assert!(err.to_string().contains(":sounds-like"));
    }

    #[test]
    fn test_split_escaped_and_unescape() {
        let parts = split_escaped("a\\,b,c\\|d", ',');
        assert_eq!(parts, vec!["a\\,b", "c\\|d"]);
        assert_eq!(unescape(&parts[0]), "a,b");
        assert_eq!(unescape(&parts[1]), "c|d");
    }

    #[test]
    fn test_has_param_parse() {
        let has = HasParam::parse("Observation:subject:_has:AuditEvent:entity:type", "login").unwrap();
        assert_eq!(has.target_resource_type, "Observation");
        assert_eq!(has.reference_field, "subject");
        assert_eq!(has.parameter_name, "_has:AuditEvent:entity:type");
        assert!(HasParam::parse("Observation:subject", "x").is_err());
    }

    #[test]
    fn test_missing_value_has_modifier() {
        let value = ParamValue::missing_of(SearchParamType::Date, true);
        assert_eq!(value.missing(), Some(true));
        assert!(value.has_modifier());
    }
}
