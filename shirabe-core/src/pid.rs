use std::fmt;

use serde::{Deserialize, Serialize};

/// Internal persistent identifier of a stored resource.
///
/// Distinct from the business id (`Patient/abc`); every value is a legal id,
/// end of iteration is signalled with `Option::None` instead of a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePid(pub i64);

impl ResourcePid {
    pub fn id(self) -> i64 {
        self.0
    }
}

impl From<i64> for ResourcePid {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResourcePid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
