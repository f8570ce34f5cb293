//! Structured error taxonomy.
//!
//! Every failure that surfaces inside a dispatch is normalized into an
//! [`ErrorInfo`]: a category × severity pair with a message, a retryability
//! flag, and an optional nested cause. The taxonomy drives three behaviors:
//!
//! - **Retry**: the runner and orchestrators re-attempt failures whose
//!   `retryable` flag is set, under the configured
//!   [`RetryPolicy`](crate::RetryPolicy).
//! - **Routing**: the [`ErrorRouter`](crate::ErrorRouter) selects a recovery
//!   agent by (category, severity) precedence.
//! - **Abort semantics**: a `Critical` callback error aborts the remaining
//!   callbacks of a hook firing; anything milder is logged and ignored.
//!
//! # Classification
//!
//! [`ErrorInfo::classify`] converts an arbitrary handler error into the
//! taxonomy, first match wins:
//!
//! 1. An error that already *is* an `ErrorInfo` is used verbatim.
//! 2. Messages containing `"connection"` or `"refused"` → `Network`/`High`,
//!    retryable.
//! 3. Messages carrying an HTTP-style status → `Llm` with severity mapped
//!    from the status class (auth statuses map to `Auth`/`High`).
//! 4. Anything else → `Unknown`/`Medium`.
//!
//! Cancellations, panics, and orchestrator validation failures are
//! constructed directly at their sites via the dedicated constructors.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::error::Error;
use std::fmt;

/// Broad failure category used for routing and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Malformed input, missing routing metadata, unregistered agents,
    /// invalid plans, lifecycle violations.
    Validation,
    /// Deadline overruns and cancellations.
    Timeout,
    /// Connectivity failures to external services.
    Network,
    /// Failures reported by a model provider.
    Llm,
    /// Authentication/authorization failures.
    Auth,
    /// Panics and other unexpected internal failures.
    Internal,
    /// Anything that could not be classified.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::Llm => "llm",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// How serious a failure is, from advisory to pipeline-aborting.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Informational; no behavior change.
    Low,
    /// Default severity for unclassified failures.
    Medium,
    /// Likely to need a recovery agent.
    High,
    /// Aborts the remaining callbacks of a hook firing.
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// A classified failure: category, severity, message, retryability, and an
/// optional nested cause.
///
/// `ErrorInfo` is serializable so the error router can carry it in the
/// payload of a follow-up event.
///
/// # Example
///
/// ```rust
/// use agentmesh::{ErrorCategory, ErrorInfo, ErrorSeverity};
///
/// let info = ErrorInfo::new(ErrorCategory::Network, ErrorSeverity::High, "connection refused")
///     .retryable(true);
/// assert!(info.retryable);
/// assert_eq!(info.to_string(), "[network/high] connection refused");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    /// Broad failure category.
    pub category: ErrorCategory,
    /// How serious the failure is.
    pub severity: ErrorSeverity,
    /// Human-readable description.
    pub message: String,
    /// Whether a retry may succeed.
    pub retryable: bool,
    /// Nested cause, when this failure wraps another.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    /// Create an error with the given category, severity, and message.
    ///
    /// `retryable` defaults to `false`; use [`ErrorInfo::retryable`] or one
    /// of the category constructors to change it.
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            retryable: false,
            cause: None,
        }
    }

    /// Set the retryability flag (builder pattern).
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach a nested cause (builder pattern).
    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// A `Validation`/`High` failure (missing route, unregistered agent,
    /// invalid plan, lifecycle violation).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, ErrorSeverity::High, message)
    }

    /// A retryable `Timeout`/`Medium` failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, ErrorSeverity::Medium, message).retryable(true)
    }

    /// A `Timeout`/`Medium` failure for a cancelled operation.
    ///
    /// Cancellations are never retryable: the context that cancelled them is
    /// going away.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, ErrorSeverity::Medium, message)
    }

    /// A retryable `Network`/`High` failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, ErrorSeverity::High, message).retryable(true)
    }

    /// An `Internal`/`Critical` failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, ErrorSeverity::Critical, message)
    }

    /// An `Llm` failure with severity mapped from a provider status code.
    ///
    /// `401`/`403` map to `Auth`/`High`; other 4xx map to `Llm`/`Medium`;
    /// 5xx map to `Llm`/`High` and are retryable.
    pub fn llm_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::new(ErrorCategory::Auth, ErrorSeverity::High, message),
            400..=499 => Self::new(ErrorCategory::Llm, ErrorSeverity::Medium, message),
            _ => Self::new(ErrorCategory::Llm, ErrorSeverity::High, message).retryable(true),
        }
    }

    /// Convert a caught panic payload into `Internal`/`Critical`.
    pub fn from_panic(agent_name: &str, payload: &Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::internal(format!("agent '{}' panicked: {}", agent_name, detail))
    }

    /// Classify an arbitrary error into the taxonomy (first match wins).
    ///
    /// An error that downcasts to `ErrorInfo` is returned verbatim so
    /// handlers can raise precise classifications through the generic
    /// `Box<dyn Error>` seam.
    pub fn classify(err: &(dyn Error + Send + Sync + 'static)) -> Self {
        if let Some(info) = err.downcast_ref::<ErrorInfo>() {
            return info.clone();
        }

        let message = err.to_string();
        let lower = message.to_lowercase();

        if lower.contains("connection") || lower.contains("refused") {
            return Self::network(message);
        }
        if let Some(status) = extract_status(&lower) {
            return Self::llm_status(status, message);
        }

        Self::new(ErrorCategory::Unknown, ErrorSeverity::Medium, message)
    }

    /// `true` when this failure aborts the remaining callbacks of a firing.
    pub fn is_critical(&self) -> bool {
        self.severity == ErrorSeverity::Critical
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.category, self.severity, self.message)
    }
}

impl Error for ErrorInfo {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// Scan a lowercased message for an HTTP-style status code.
///
/// Recognizes `"status 503"`, `"status: 503"`, and `"http 503"` shapes.
fn extract_status(message: &str) -> Option<u16> {
    for marker in ["status code", "status:", "status", "http"] {
        if let Some(pos) = message.find(marker) {
            let tail = message[pos + marker.len()..].trim_start_matches([' ', ':']);
            let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.len() == 3 {
                if let Ok(status) = digits.parse::<u16>() {
                    if (100..600).contains(&status) {
                        return Some(status);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(msg: &str) -> Box<dyn Error + Send + Sync> {
        Box::new(std::io::Error::other(msg.to_string()))
    }

    #[test]
    fn classify_passes_error_info_verbatim() {
        let original = ErrorInfo::llm_status(429, "rate limited");
        let boxed: Box<dyn Error + Send + Sync> = Box::new(original.clone());
        assert_eq!(ErrorInfo::classify(boxed.as_ref()), original);
    }

    #[test]
    fn classify_connection_errors_as_network() {
        let info = ErrorInfo::classify(boxed("connection refused by peer").as_ref());
        assert_eq!(info.category, ErrorCategory::Network);
        assert_eq!(info.severity, ErrorSeverity::High);
        assert!(info.retryable);
    }

    #[test]
    fn classify_status_errors_as_llm() {
        let info = ErrorInfo::classify(boxed("provider returned status 503").as_ref());
        assert_eq!(info.category, ErrorCategory::Llm);
        assert_eq!(info.severity, ErrorSeverity::High);
        assert!(info.retryable);

        let info = ErrorInfo::classify(boxed("provider returned status 404").as_ref());
        assert_eq!(info.severity, ErrorSeverity::Medium);
        assert!(!info.retryable);
    }

    #[test]
    fn classify_auth_statuses() {
        let info = ErrorInfo::classify(boxed("denied with status 401").as_ref());
        assert_eq!(info.category, ErrorCategory::Auth);
        assert_eq!(info.severity, ErrorSeverity::High);
    }

    #[test]
    fn classify_fallback_is_unknown_medium() {
        let info = ErrorInfo::classify(boxed("something odd happened").as_ref());
        assert_eq!(info.category, ErrorCategory::Unknown);
        assert_eq!(info.severity, ErrorSeverity::Medium);
        assert!(!info.retryable);
    }

    #[test]
    fn display_format() {
        let info = ErrorInfo::validation("missing 'route' metadata");
        assert_eq!(info.to_string(), "[validation/high] missing 'route' metadata");
    }

    #[test]
    fn severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
    }
}
