use serde::{Deserialize, Serialize};

use crate::error::SearchError;

/// FHIR OperationOutcome describing why a search was rejected
/// See: https://www.hl7.org/fhir/operationoutcome.html
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub resource_type: String,
    pub issue: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcomeIssue {
    pub severity: IssueSeverity,
    pub code: IssueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    Invalid,
    Processing,
    NotSupported,
    NotFound,
    Exception,
}

impl OperationOutcome {
    pub fn new(severity: IssueSeverity, code: IssueType, diagnostics: impl Into<String>) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue: vec![OperationOutcomeIssue {
                severity,
                code,
                diagnostics: Some(diagnostics.into()),
            }],
        }
    }

    /// Map a search failure to the outcome returned to the client.
    ///
    /// Internal failures never expose their detail; it is logged instead.
    pub fn from_error(error: &SearchError) -> Self {
        let (code, diagnostics) = match error {
            SearchError::InvalidRequest(message) => (IssueType::Invalid, message.clone()),
            SearchError::PreconditionFailed(message) => (IssueType::Processing, message.clone()),
            SearchError::MethodNotAllowed(message) => (IssueType::NotSupported, message.clone()),
            SearchError::NotFound { .. } => (IssueType::NotFound, error.to_string()),
            SearchError::Internal(detail) => {
                tracing::error!(%detail, "Internal error while processing search");
                (
                    IssueType::Exception,
                    "An internal error occurred while processing the search".to_string(),
                )
            }
        };
        Self::new(IssueSeverity::Error, code, diagnostics)
    }

    /// HTTP status a transport layer should use for this error
    pub fn http_status(error: &SearchError) -> u16 {
        match error {
            SearchError::InvalidRequest(_) => 400,
            SearchError::NotFound { .. } => 404,
            SearchError::MethodNotAllowed(_) => 405,
            SearchError::PreconditionFailed(_) => 412,
            SearchError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_outcome_serialization() {
        let outcome = OperationOutcome::from_error(&SearchError::invalid("Unknown parameter"));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("OperationOutcome"));
        assert!(json.contains("\"invalid\""));
        assert!(json.contains("Unknown parameter"));
    }

    #[test]
    fn test_internal_error_is_opaque() {
        let outcome =
            OperationOutcome::from_error(&SearchError::internal("no such column: t0.sp_valu"));
        assert_eq!(outcome.issue[0].code, IssueType::Exception);
        assert!(!outcome.issue[0]
            .diagnostics
            .as_ref()
            .unwrap()
            .contains("sp_valu"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            OperationOutcome::http_status(&SearchError::PreconditionFailed("x".into())),
            412
        );
        assert_eq!(
            OperationOutcome::http_status(&SearchError::MethodNotAllowed("x".into())),
            405
        );
        let outcome = OperationOutcome::from_error(&SearchError::MethodNotAllowed("x".into()));
        assert_eq!(outcome.issue[0].code, IssueType::NotSupported);
    }
}
