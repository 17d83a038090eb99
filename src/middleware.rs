//! Request ID span for correlating logs with requests.
//!
//! Generates a UUID v4 for each incoming request and creates a tracing span
//! that wraps the whole dispatch, liveness answers included. All logs emitted
//! while the request is processed carry the request_id and worker_id fields.

use std::future::Future;
use std::time::Instant;

use axum::{body::Body, extract::Request, response::Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::supervisor::WorkerId;

/// Extension type for accessing the request ID in the application.
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Run `next` inside a request span and log completion with the status code.
pub async fn with_request_span<F, Fut>(worker: WorkerId, request: Request<Body>, next: F) -> Response
where
    F: FnOnce(Request<Body>) -> Fut,
    Fut: Future<Output = Response>,
{
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        worker_id = %worker,
        method = %method,
        path = %path,
        duration_ms = tracing::field::Empty,
    );

    let start = Instant::now();

    let mut request = request;
    request.extensions_mut().insert(RequestId(request_id));

    async move {
        let response = next(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::info!(
            status = response.status().as_u16(),
            duration_ms,
            "Request completed"
        );

        response
    }
    .instrument(span)
    .await
}
