//! Hook for searches answered outside the SQL index (`_content`, `_text`, last-N).

use shirabe_core::{ResourcePid, SearchParameterMap};

use crate::error::Result;

/// Parameters that can only be served by a [`FulltextSearchProvider`]
pub const FULLTEXT_PARAMS: [&str; 2] = ["_content", "_text"];

pub trait FulltextSearchProvider: Send + Sync {
    /// Pids matching the full-text (or last-N) part of `params`
    fn search(&self, resource_type: &str, params: &SearchParameterMap) -> Result<Vec<ResourcePid>>;
}

/// Whether any part of `params` needs the full-text provider
pub fn requires_fulltext(params: &SearchParameterMap) -> bool {
    params.last_n || FULLTEXT_PARAMS.iter().any(|p| params.contains_key(p))
}
