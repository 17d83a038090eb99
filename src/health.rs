//! Liveness status shared by the worker endpoint, the supervisor and the prober.
//!
//! A [`HealthStatus`] is produced fresh on every check and carries no history.
//! It renders as `200 {"status":"healthy"}` or `503 {"status":"unhealthy"}`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::worker::WorkerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthResult {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub checked_at: DateTime<Utc>,
    #[serde(rename = "status")]
    pub result: HealthResult,
}

impl HealthStatus {
    pub fn now(result: HealthResult) -> Self {
        Self {
            checked_at: Utc::now(),
            result,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.result == HealthResult::Healthy
    }

    /// Liveness of a single worker: healthy unless it is going away.
    pub fn for_worker(state: WorkerState) -> Self {
        match state {
            WorkerState::Terminating | WorkerState::Dead => Self::now(HealthResult::Unhealthy),
            _ => Self::now(HealthResult::Healthy),
        }
    }

    /// Liveness of a pool: healthy while any worker is `Ready` or `Busy`.
    pub fn for_pool<I>(states: I) -> Self
    where
        I: IntoIterator<Item = WorkerState>,
    {
        let mut seen_any = false;
        for state in states {
            if matches!(state, WorkerState::Ready | WorkerState::Busy) {
                return Self::now(HealthResult::Healthy);
            }
            if state != WorkerState::Starting {
                seen_any = true;
            }
        }
        if seen_any {
            Self::now(HealthResult::Unhealthy)
        } else {
            Self::now(HealthResult::Unknown)
        }
    }
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let status = match self.result {
            HealthResult::Healthy => StatusCode::OK,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        let mut response = (status, Json(self)).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}
