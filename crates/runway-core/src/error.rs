//! Closed error taxonomy shared across the engine

use serde::{Deserialize, Serialize};

/// Classification assigned to failures surfaced in events as `error_type`.
///
/// User-visible failure surfaces expose the kind and a reason string only;
/// stack traces stay out of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkFailure,
    Timeout,
    SchemaViolation,
    PermissionDenied,
    BadPlan,
    MissingCitations,
    InvalidCitation,
    ServerError,
    BudgetExhausted,
    RateLimited,
    Cancelled,
    Refusal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkFailure => "network_failure",
            Self::Timeout => "timeout",
            Self::SchemaViolation => "schema_violation",
            Self::PermissionDenied => "permission_denied",
            Self::BadPlan => "bad_plan",
            Self::MissingCitations => "missing_citations",
            Self::InvalidCitation => "invalid_citation",
            Self::ServerError => "server_error",
            Self::BudgetExhausted => "budget_exhausted",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
            Self::Refusal => "refusal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
