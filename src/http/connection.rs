//! Driving one HTTP/1.1 connection to completion.
//!
//! hyper parses requests and writes responses; this loop adds the two things it
//! leaves to the caller: closing an idle keep-alive connection and draining the
//! connection when the worker is told to shut down.

use std::time::{Duration, Instant};

use axum::body::Body;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::HttpService;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::sync::watch;

use super::acceptor::Connection;

/// Idle bounds for a single connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Idle time allowed between a response and the next request
    pub keep_alive: Duration,
    /// Idle time allowed before the first request arrives
    pub first_request: Duration,
}

impl ConnectionLimits {
    /// Upper bound on reading any request head, partial ones included.
    fn header_read(&self) -> Duration {
        self.first_request.max(self.keep_alive)
    }
}

/// Serve requests on `connection` until the client leaves, the keep-alive
/// window lapses, a response closes it, or shutdown is signalled.
///
/// A client that starts a request head but never finishes it is cut off by
/// hyper's header read timeout; the idle deadline alone cannot close a
/// connection with a partly read request.
///
/// Requests on one connection are handled strictly one after another.
pub async fn drive<S>(
    connection: Connection,
    service: S,
    limits: ConnectionLimits,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), hyper::Error>
where
    S: HttpService<Incoming, ResBody = Body>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (stream, activity) = connection.into_parts();

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .keep_alive(!limits.keep_alive.is_zero())
        .header_read_timeout(limits.header_read())
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut closing = *shutdown.borrow_and_update();
    if closing {
        conn.as_mut().graceful_shutdown();
    }

    loop {
        let deadline = activity.idle_deadline(limits.keep_alive, limits.first_request);

        tokio::select! {
            result = conn.as_mut() => return result,

            _ = shutdown.changed(), if !closing => {
                // Finish the request in flight, accept no further ones
                closing = true;
                conn.as_mut().graceful_shutdown();
            }

            _ = activity.request_finished(), if !closing => {}

            _ = sleep_until(deadline), if !closing && deadline.is_some() => {
                let expired = activity
                    .idle_deadline(limits.keep_alive, limits.first_request)
                    .is_some_and(|d| d <= Instant::now());
                if expired {
                    tracing::debug!(
                        served = activity.requests_served(),
                        "Closing idle connection"
                    );
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
