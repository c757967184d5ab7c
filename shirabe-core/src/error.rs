use thiserror::Error;

/// Failures raised while turning search parameters into a query.
///
/// `NotFound` is only produced by collaborators (identifier resolution) and is
/// normally recovered into "contributes no matches" by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    #[error("Resource not found: {resource_type}/{id}")]
    NotFound {
        resource_type: String,
        id: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SearchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_passes_message_through() {
        let err = SearchError::invalid("Unknown search parameter \"foo\"");
        assert_eq!(err.to_string(), "Unknown search parameter \"foo\"");
    }

    #[test]
    fn test_not_found_display() {
        let err = SearchError::not_found("Patient", "123");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Resource not found: Patient/123");
    }
}
