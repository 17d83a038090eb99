//! Per-request dispatch inside a worker.
//!
//! Liveness requests are answered here without touching the application.
//! Everything else runs through the application under the request timeout,
//! with panics and faults turned into 5xx responses.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tokio::sync::mpsc;

use super::{send_heartbeat, Heartbeat, WorkerStatus};
use crate::app::Application;
use crate::config::LIVENESS_PATH;
use crate::error::HandlerFault;
use crate::health::HealthStatus;
use crate::http::Activity;
use crate::middleware::with_request_span;
use crate::supervisor::WorkerId;

/// Dispatches requests of one connection.
#[derive(Clone)]
pub struct Dispatcher {
    worker: WorkerId,
    app: Arc<dyn Application>,
    status: Arc<WorkerStatus>,
    heartbeats: mpsc::Sender<Heartbeat>,
    activity: Arc<Activity>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        worker: WorkerId,
        app: Arc<dyn Application>,
        status: Arc<WorkerStatus>,
        heartbeats: mpsc::Sender<Heartbeat>,
        activity: Arc<Activity>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            worker,
            app,
            status,
            heartbeats,
            activity,
            request_timeout,
        }
    }

    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        with_request_span(self.worker, request, |request| async move {
            if is_liveness_request(&request) {
                self.activity.begin_request();
                let response = self.handle_liveness().into_response();
                self.activity.end_request(true);
                return response;
            }
            self.handle_request(request).await
        })
        .await
    }

    /// Liveness of this worker, independent of application load.
    pub fn handle_liveness(&self) -> HealthStatus {
        HealthStatus::for_worker(self.status.get())
    }

    async fn handle_request(&self, request: Request<Body>) -> Response {
        self.activity.begin_request();
        // Staleness is measured from here until the request ends
        self.heartbeat().await;

        let outcome = tokio::time::timeout(
            self.request_timeout,
            AssertUnwindSafe(self.app.handle(request)).catch_unwind(),
        )
        .await;

        let fault = match outcome {
            Ok(Ok(Ok(response))) => {
                self.activity.end_request(true);
                self.heartbeat().await;
                return response;
            }
            Ok(Ok(Err(fault))) => fault,
            Ok(Err(panic)) => HandlerFault::Panicked(panic_message(panic.as_ref())),
            Err(_elapsed) => {
                tracing::warn!(
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Request timed out, aborting handler"
                );
                HandlerFault::TimedOut(self.request_timeout)
            }
        };

        if fault.is_fatal() {
            self.status.mark_fatal();
        }
        self.activity.end_request(false);
        self.heartbeat().await;
        fault.into_response()
    }

    /// Report the worker's current state. The worker owns its state
    /// transitions; dispatch only refreshes the timestamp.
    async fn heartbeat(&self) {
        if self.status.is_fatal() {
            return;
        }
        send_heartbeat(&self.heartbeats, self.worker, self.status.get()).await;
    }
}

fn is_liveness_request<B>(request: &Request<B>) -> bool {
    request.uri().path() == LIVENESS_PATH
        && (request.method() == Method::GET || request.method() == Method::HEAD)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::{header, StatusCode};
    use std::time::Instant;

    struct Echo;

    #[async_trait]
    impl Application for Echo {
        async fn handle(&self, request: Request<Body>) -> Result<Response, HandlerFault> {
            Ok(request.uri().path().to_string().into_response())
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl Application for Sleepy {
        async fn handle(&self, _request: Request<Body>) -> Result<Response, HandlerFault> {
            tokio::time::sleep(self.0).await;
            Ok("late".into_response())
        }
    }

    struct Panics;

    #[async_trait]
    impl Application for Panics {
        async fn handle(&self, _request: Request<Body>) -> Result<Response, HandlerFault> {
            panic!("handler exploded");
        }
    }

    struct Corrupt;

    #[async_trait]
    impl Application for Corrupt {
        async fn handle(&self, _request: Request<Body>) -> Result<Response, HandlerFault> {
            Err(HandlerFault::Fatal("heap smashed".into()))
        }
    }

    fn dispatcher(
        app: impl Application,
        timeout: Duration,
    ) -> (Dispatcher, mpsc::Receiver<Heartbeat>) {
        let (tx, rx) = mpsc::channel(16);
        let status = WorkerStatus::new();
        status.set(WorkerState::Busy);
        let dispatcher = Dispatcher::new(
            WorkerId(1),
            Arc::new(app),
            Arc::new(status),
            tx,
            Arc::new(Activity::new(Instant::now())),
            timeout,
        );
        (dispatcher, rx)
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_request_reaches_application() {
        let (d, mut rx) = dispatcher(Echo, Duration::from_secs(5));
        let response = d.dispatch(get("/hello")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"/hello");

        // Request start and end both refresh the heartbeat
        assert_eq!(rx.recv().await.unwrap().state, WorkerState::Busy);
        assert_eq!(rx.recv().await.unwrap().state, WorkerState::Busy);
        assert!(d.activity.is_reusable());
        assert!(!d.activity.is_in_flight());
    }

    #[tokio::test]
    async fn test_liveness_short_circuits() {
        let (d, mut rx) = dispatcher(Panics, Duration::from_secs(5));
        let response = d.dispatch(get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        // No heartbeat: the application was never called
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_liveness_unhealthy_while_terminating() {
        let (d, _rx) = dispatcher(Echo, Duration::from_secs(5));
        d.status.set(WorkerState::Terminating);
        let response = d.dispatch(get("/health")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_post_to_health_goes_to_application() {
        let (d, _rx) = dispatcher(Echo, Duration::from_secs(5));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = d.dispatch(request).await;
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"/health");
    }

    #[tokio::test]
    async fn test_timeout_answers_504_and_closes() {
        let (d, _rx) = dispatcher(Sleepy(Duration::from_secs(10)), Duration::from_millis(50));
        let response = d.dispatch(get("/slow")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers()[header::CONNECTION], "close");
        assert!(!d.activity.is_reusable());
        assert_eq!(d.status.get(), WorkerState::Busy);
    }

    #[tokio::test]
    async fn test_panic_answers_500() {
        let (d, _rx) = dispatcher(Panics, Duration::from_secs(5));
        let response = d.dispatch(get("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!d.status.is_fatal());
    }

    #[tokio::test]
    async fn test_fatal_fault_marks_worker() {
        let (d, _rx) = dispatcher(Corrupt, Duration::from_secs(5));
        let response = d.dispatch(get("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(d.status.is_fatal());
        assert_eq!(d.status.get(), WorkerState::Dead);
    }

    #[tokio::test]
    async fn test_request_does_not_undo_terminating() {
        let (d, mut rx) = dispatcher(Echo, Duration::from_secs(5));
        d.status.set(WorkerState::Terminating);
        let response = d.dispatch(get("/last")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(d.status.get(), WorkerState::Terminating);
        assert_eq!(rx.recv().await.unwrap().state, WorkerState::Terminating);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
