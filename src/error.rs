use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::supervisor::WorkerId;

/// A request-scoped failure of the application handler.
///
/// Always converted into a response for that one request; the connection is
/// closed afterwards because handler state is no longer trusted.
#[derive(Debug, thiserror::Error)]
pub enum HandlerFault {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Handler did not respond within {0:?}")]
    TimedOut(Duration),

    /// The handler reports process-level corruption; the worker exits after answering.
    #[error("Handler reported fatal corruption: {0}")]
    Fatal(String),
}

impl HandlerFault {
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerFault::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the owning worker must stop after this request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerFault::Fatal(_))
    }
}

impl IntoResponse for HandlerFault {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, message) = match &self {
            HandlerFault::TimedOut(limit) => (
                "Gateway timeout",
                format!("The request did not complete within {} seconds", limit.as_secs_f64()),
            ),
            _ => {
                tracing::error!(error = %self, "Handler fault");
                (
                    "Internal server error",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let mut response = (
            status,
            Json(json!({
                "error": error,
                "message": message,
            })),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        response
    }
}

/// A worker-scoped failure, recovered by the supervisor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerFault {
    #[error("Worker {0} exited unexpectedly")]
    Exited(WorkerId),

    #[error("Worker {id} crashed: {reason}")]
    Crashed { id: WorkerId, reason: String },

    #[error("Worker {id} has been busy without a heartbeat for {silent_for:?}")]
    Unresponsive { id: WorkerId, silent_for: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_504() {
        let response = HandlerFault::TimedOut(Duration::from_secs(1)).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers()[header::CONNECTION], "close");
    }

    #[test]
    fn test_failures_map_to_500() {
        for fault in [
            HandlerFault::Failed("boom".into()),
            HandlerFault::Panicked("boom".into()),
            HandlerFault::Fatal("boom".into()),
        ] {
            let response = fault.into_response();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(response.headers()[header::CONNECTION], "close");
        }
    }

    #[test]
    fn test_only_fatal_is_fatal() {
        assert!(HandlerFault::Fatal("x".into()).is_fatal());
        assert!(!HandlerFault::Failed("x".into()).is_fatal());
        assert!(!HandlerFault::TimedOut(Duration::from_secs(1)).is_fatal());
    }
}
