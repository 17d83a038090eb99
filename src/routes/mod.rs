//! Default application served when no other application is embedded.
//!
//! Only a root info endpoint plus JSON bodies for unknown paths and methods.
//! The liveness path never reaches this router: workers answer it directly.

pub mod home;

use axum::{http::StatusCode, response::Json, routing::get, Router};
use http::header::{HeaderValue, CACHE_CONTROL};
use serde_json::{json, Value};
use tower_http::set_header::SetResponseHeaderLayer;

/// Cache-Control for the info endpoint; it only changes on deploy
pub const CACHE_CONTROL_INFO: &str = "public, max-age=60";

/// Creates the default Axum router.
pub fn create_router() -> Router {
    Router::new()
        .route("/", get(home::index))
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_INFO),
        ))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found",
            "message": "The requested endpoint does not exist",
        })),
    )
}

async fn method_not_allowed() -> (StatusCode, Json<Value>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({
            "error": "Method not allowed",
            "message": "The request method is not allowed for this endpoint",
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Application;
    use axum::body::{to_bytes, Body};
    use axum::extract::Request;

    async fn call(method: &str, path: &str) -> (StatusCode, Value, Option<String>) {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = create_router().handle(request).await.unwrap();
        let status = response.status();
        let cache = response
            .headers()
            .get(CACHE_CONTROL)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap(), cache)
    }

    #[tokio::test]
    async fn test_root_lists_endpoints() {
        let (status, body, cache) = call("GET", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["endpoints"]["health"], "/health");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(cache.as_deref(), Some(CACHE_CONTROL_INFO));
    }

    #[tokio::test]
    async fn test_unknown_path_is_json_404() {
        let (status, body, _) = call("GET", "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Endpoint not found");
    }

    #[tokio::test]
    async fn test_wrong_method_is_json_405() {
        let (status, body, _) = call("DELETE", "/").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["error"], "Method not allowed");
    }
}
