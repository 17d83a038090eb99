//! The shared listening socket.
//!
//! Bound once by the supervisor and handed to every worker behind an `Arc`.
//! Workers call [`Acceptor::accept_next`] concurrently; the kernel gives each
//! pending connection to exactly one caller, so no lock is involved.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::config::ConfigError;

#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Resolve `addr` (`host:port`) and bind the first address that accepts.
    /// A second bind to an address already held by an acceptor fails with
    /// [`ConfigError::Bind`].
    pub async fn bind(addr: &str) -> Result<Self, ConfigError> {
        let candidates = lookup_host(addr)
            .await
            .map_err(|source| ConfigError::Resolve {
                addr: addr.to_string(),
                source,
            })?;

        let mut last_error = None;
        for candidate in candidates {
            match TcpListener::bind(candidate).await {
                Ok(listener) => {
                    let local_addr = listener
                        .local_addr()
                        .map_err(|source| ConfigError::Bind {
                            addr: candidate,
                            source,
                        })?;
                    tracing::info!(%local_addr, bind = addr, "Listening");
                    return Ok(Self {
                        listener,
                        local_addr,
                    });
                }
                Err(source) => {
                    tracing::debug!(%candidate, error = %source, "Bind attempt failed");
                    last_error = Some(ConfigError::Bind {
                        addr: candidate,
                        source,
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConfigError::Resolve {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Suspend until the kernel hands this caller a connection.
    pub async fn accept_next(&self) -> std::io::Result<Connection> {
        let (stream, peer) = self.listener.accept().await?;

        // Match axum default: set TCP_NODELAY for low-latency
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        Ok(Connection::new(stream, peer))
    }
}

/// An accepted client connection, owned by a single worker until closed.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    activity: Arc<Activity>,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            activity: Arc::new(Activity::new(Instant::now())),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn activity(&self) -> Arc<Activity> {
        Arc::clone(&self.activity)
    }

    pub fn into_parts(self) -> (TcpStream, Arc<Activity>) {
        (self.stream, self.activity)
    }
}

/// Request bookkeeping for one connection, shared between the request
/// dispatcher and the keep-alive watchdog.
#[derive(Debug)]
pub struct Activity {
    inner: Mutex<ActivityInner>,
    changed: Notify,
}

#[derive(Debug)]
struct ActivityInner {
    last_activity_at: Instant,
    in_flight: bool,
    served: u64,
    reusable: bool,
}

impl Activity {
    pub fn new(now: Instant) -> Self {
        Self {
            inner: Mutex::new(ActivityInner {
                last_activity_at: now,
                in_flight: false,
                served: 0,
                reusable: true,
            }),
            changed: Notify::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut ActivityInner) -> R) -> R {
        // Only plain field writes happen under the lock, a poisoned guard is still consistent.
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// A request has been read and handed to the application.
    pub fn begin_request(&self) {
        self.with(|a| {
            a.in_flight = true;
            a.last_activity_at = Instant::now();
        })
    }

    /// The response head has been produced.
    pub fn end_request(&self, reusable: bool) {
        self.with(|a| {
            a.in_flight = false;
            a.served += 1;
            a.reusable &= reusable;
            a.last_activity_at = Instant::now();
        });
        self.changed.notify_one();
    }

    /// Resolves after the next [`Activity::end_request`], or at once if one
    /// happened since the last wait.
    pub async fn request_finished(&self) {
        self.changed.notified().await
    }

    pub fn last_activity_at(&self) -> Instant {
        self.with(|a| a.last_activity_at)
    }

    pub fn requests_served(&self) -> u64 {
        self.with(|a| a.served)
    }

    pub fn is_reusable(&self) -> bool {
        self.with(|a| a.reusable)
    }

    pub fn is_in_flight(&self) -> bool {
        self.with(|a| a.in_flight)
    }

    /// When the connection should be closed if nothing else happens.
    ///
    /// `None` while a request is in flight. Before the first request the
    /// wait is bounded by `first_request`, afterwards by `keep_alive`.
    pub fn idle_deadline(&self, keep_alive: Duration, first_request: Duration) -> Option<Instant> {
        self.with(|a| {
            if a.in_flight {
                None
            } else if a.served == 0 {
                Some(a.last_activity_at + first_request)
            } else {
                Some(a.last_activity_at + keep_alive)
            }
        })
    }
}
