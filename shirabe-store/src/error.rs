use shirabe_core::SearchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Misuse of an iterator or cursor (reading past the end)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Failures that must be reported to clients as an opaque internal error
    pub fn is_internal(&self) -> bool {
        match self {
            Self::Search(err) => matches!(err, SearchError::Internal(_)),
            Self::Sqlite(_) | Self::Other(_) => true,
            Self::IllegalState(_) => false,
        }
    }

    /// Collapse into the search error taxonomy
    pub fn into_search_error(self) -> SearchError {
        match self {
            Self::Search(err) => err,
            other => SearchError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
