//! The application seam.
//!
//! Workers know nothing about the application beyond this trait: a request goes
//! in, a response or a [`HandlerFault`] comes out. Any `axum::Router` qualifies.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use axum::Router;
use tower::ServiceExt;

use crate::error::HandlerFault;

#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn handle(&self, request: Request<Body>) -> Result<Response, HandlerFault>;
}

#[async_trait]
impl Application for Router {
    async fn handle(&self, request: Request<Body>) -> Result<Response, HandlerFault> {
        let result: Result<Response, Infallible> = self.clone().oneshot(request).await;
        match result {
            Ok(response) => Ok(response),
            Err(never) => match never {},
        }
    }
}
