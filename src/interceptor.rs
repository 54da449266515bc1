//! Traffic interception and modification interfaces
//!
//! Hooks run inside the proxy's request/response cycle: a request hook can
//! rewrite the outgoing request or answer it directly without any upstream
//! dial; a response hook can rewrite the response before it is written back.

use crate::error::Result;
use bytes::Bytes;
use http::{Request, Response};
use std::sync::Arc;

/// Outcome of a request hook
pub enum RequestAction {
  /// Continue toward the upstream with this (possibly rewritten) request
  Forward(Request<Bytes>),
  /// Short-circuit: write this response to the client, dial nothing
  Respond(Response<Bytes>),
}

/// Trait for intercepting and modifying HTTP requests
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Inspect the request before it is forwarded
  async fn intercept_request(&self, request: Request<Bytes>) -> Result<RequestAction>;
}

/// Trait for intercepting and modifying HTTP responses
///
/// Forwarding has already happened by the time a response hook runs; the
/// returned response is always written back to the client.
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Inspect the upstream response before it is written back
  async fn intercept_response(&self, response: Response<Bytes>) -> Result<Response<Bytes>>;
}

/// Combined interceptor registry; the default set is pass-through
#[derive(Default)]
pub struct InterceptorHandler {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptorHandler {
  /// Create an empty (pass-through) handler
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a request interceptor
  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }

  /// Add a response interceptor
  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }

  /// Run a request through the chain; the first hook that answers directly
  /// stops the chain.
  pub async fn process_request(&self, mut request: Request<Bytes>) -> Result<RequestAction> {
    for interceptor in &self.request_interceptors {
      match interceptor.intercept_request(request).await? {
        RequestAction::Forward(next) => request = next,
        RequestAction::Respond(response) => return Ok(RequestAction::Respond(response)),
      }
    }
    Ok(RequestAction::Forward(request))
  }

  /// Run a response through the chain
  pub async fn process_response(&self, mut response: Response<Bytes>) -> Result<Response<Bytes>> {
    for interceptor in &self.response_interceptors {
      response = interceptor.intercept_response(response).await?;
    }
    Ok(response)
  }
}

/// Logging interceptor that records traffic without modifying it
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl RequestInterceptor for LoggingInterceptor {
  async fn intercept_request(&self, request: Request<Bytes>) -> Result<RequestAction> {
    tracing::info!("[intercept] request: {} {}", request.method(), request.uri());
    for (name, value) in request.headers() {
      tracing::debug!("[intercept]   {}: {:?}", name, value);
    }
    Ok(RequestAction::Forward(request))
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for LoggingInterceptor {
  async fn intercept_response(&self, response: Response<Bytes>) -> Result<Response<Bytes>> {
    tracing::info!("[intercept] response: {}", response.status());
    for (name, value) in response.headers() {
      tracing::debug!("[intercept]   {}: {:?}", name, value);
    }
    Ok(response)
  }
}
