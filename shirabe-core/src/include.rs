//! `_include`, `_revinclude` and `_sort` specifications.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One `_include` / `_revinclude` value (`Observation:subject:Patient`, `*`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Include {
    pub value: String,
    /// `:iterate` (or the older `:recurse`) was given
    pub recurse: bool,
}

impl Include {
    pub fn new(value: impl Into<String>, recurse: bool) -> Self {
        Self {
            value: value.into(),
            recurse,
        }
    }

    /// Include everything (`*`)
    pub fn wildcard(recurse: bool) -> Self {
        Self::new("*", recurse)
    }

    pub fn is_wildcard(&self) -> bool {
        self.value == "*" || self.param_name() == Some("*")
    }

    pub fn param_type(&self) -> Option<&str> {
        self.value.split(':').next().filter(|s| !s.is_empty())
    }

    pub fn param_name(&self) -> Option<&str> {
        self.value.split(':').nth(1).filter(|s| !s.is_empty())
    }

    pub fn param_target_type(&self) -> Option<&str> {
        self.value.split(':').nth(2).filter(|s| !s.is_empty())
    }
}

impl fmt::Display for Include {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)?;
        if self.recurse {
            f.write_str(" (iterate)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A sort key; further keys hang off `chain` in priority order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub param_name: String,
    pub order: SortOrder,
    pub chain: Option<Box<SortSpec>>,
}

impl SortSpec {
    pub fn new(param_name: impl Into<String>, order: SortOrder) -> Self {
        Self {
            param_name: param_name.into(),
            order,
            chain: None,
        }
    }

    /// Parse a `_sort` value: comma separated, `-` marks descending
    pub fn parse(raw: &str) -> Option<Self> {
        let mut head: Option<SortSpec> = None;
        for key in raw.split(',').map(str::trim).rev().filter(|k| !k.is_empty()) {
            let (name, order) = match key.strip_prefix('-') {
                Some(name) => (name, SortOrder::Desc),
                None => (key, SortOrder::Asc),
            };
            let mut spec = SortSpec::new(name, order);
            spec.chain = head.map(Box::new);
            head = Some(spec);
        }
        head
    }

    /// Append `next` after the last key of this chain
    pub fn push_back(&mut self, next: SortSpec) {
        match &mut self.chain {
            Some(chained) => chained.push_back(next),
            None => self.chain = Some(Box::new(next)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SortSpec> {
        std::iter::successors(Some(self), |s| s.chain.as_deref())
    }
}

/// `$everything` mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EverythingMode {
    /// `Patient/123/$everything`
    Instance(String),
    /// `Patient/$everything`
    Type,
}
