use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Application-specific error types.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Error interacting with the CRM or the credit provider.
    ExternalApiError(String),
    /// Credential renewal against the provider failed.
    AuthenticationFailed(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::AuthenticationFailed(msg) => write!(f, "Authentication failed: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and JSON body.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ExternalApiError(msg) => {
                tracing::error!("External API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "External service error".to_string(),
                )
            }
            AppError::AuthenticationFailed(msg) => {
                tracing::error!("Provider authentication failed: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "Provider authentication failed".to_string(),
                )
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                // Log full context chain for debugging
                tracing::error!("Error with context: {} -> {}", context, source);
                // Delegate to underlying error's response
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

/// Terminal failure classification for one flow execution, surfaced to
/// callers as a stable tag plus a human-readable reason. The reason prefers
/// the upstream provider's own description verbatim whenever one exists, so
/// operators can correlate directly against the provider's records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum FlowFailure {
    /// No opportunity for the CPF in any of the lookup pipelines.
    NotFoundInCrm,
    /// The customer record is missing fields the provider requires.
    MissingRequiredFields(Vec<String>),
    /// The provider rejected the consent term (description carried verbatim).
    TermRejected(String),
    /// The provider reported the consent term as failed.
    TermFailed(String),
    /// The term could not be authorized and still awaits customer consent.
    AwaitingConsent,
    /// Polling exhausted its budget without a terminal status.
    PollTimeout,
    /// The term was approved but no installment count produced a valid
    /// simulation.
    SimulationUnavailable,
    /// Credential renewal against the provider failed.
    Authentication(String),
    /// Transport or protocol failure talking to the CRM or the provider.
    Upstream(String),
}

impl FlowFailure {
    /// Human-readable reason shown to callers as `failureReason`.
    pub fn reason(&self) -> String {
        match self {
            FlowFailure::NotFoundInCrm => "Opportunity not found in CRM".to_string(),
            FlowFailure::MissingRequiredFields(fields) => {
                format!("Missing required fields: {}", fields.join(", "))
            }
            FlowFailure::TermRejected(description) => description.clone(),
            FlowFailure::TermFailed(description) => description.clone(),
            FlowFailure::AwaitingConsent => {
                "Could not authorize the term - awaiting customer consent".to_string()
            }
            FlowFailure::PollTimeout => {
                "Term not finalized within the polling budget - try again later".to_string()
            }
            FlowFailure::SimulationUnavailable => {
                "Could not create a simulation at any installment count".to_string()
            }
            FlowFailure::Authentication(detail) => detail.clone(),
            FlowFailure::Upstream(detail) => detail.clone(),
        }
    }

    /// HTTP status used by the flow endpoint for this failure.
    pub fn http_status(&self) -> StatusCode {
        match self {
            FlowFailure::NotFoundInCrm => StatusCode::NOT_FOUND,
            FlowFailure::PollTimeout => StatusCode::REQUEST_TIMEOUT,
            FlowFailure::Authentication(_) | FlowFailure::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for FlowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    #[allow(dead_code)]
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reason_is_carried_verbatim() {
        let failure = FlowFailure::TermRejected("Margem indisponivel".to_string());
        assert_eq!(failure.reason(), "Margem indisponivel");
        assert_eq!(failure.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn timeout_maps_to_request_timeout() {
        assert_eq!(
            FlowFailure::PollTimeout.http_status(),
            StatusCode::REQUEST_TIMEOUT
        );
    }

    #[test]
    fn failure_tags_are_stable() {
        let json = serde_json::to_value(FlowFailure::PollTimeout).unwrap();
        assert_eq!(json["kind"], "pollTimeout");

        let json =
            serde_json::to_value(FlowFailure::MissingRequiredFields(vec!["phone".into()])).unwrap();
        assert_eq!(json["kind"], "missingRequiredFields");
        assert_eq!(json["detail"][0], "phone");
    }
}
