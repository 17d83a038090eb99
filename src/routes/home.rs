//! Root endpoint describing the service.

use axum::response::Json;
use serde_json::{json, Value};

use crate::config::LIVENESS_PATH;

/// Service name and version with a list of the endpoints it answers.
pub async fn index() -> Json<Value> {
    Json(json!({
        "message": env!("CARGO_PKG_DESCRIPTION"),
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": LIVENESS_PATH,
        },
    }))
}
