//! Interceptor pipeline
//!
//! Interceptors are plain function values held in two ordered lists. A run
//! takes a snapshot of the list and folds over it sequentially, so
//! registering an interceptor mid-request never affects that request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use af_common::{ApiEvent, ClassifiedError, ErrorKind, EventBus, RequestId, Response};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::auth::AuthTokenManager;
use crate::request::RequestConfig;

pub type RequestInterceptor =
    Arc<dyn Fn(RequestConfig) -> BoxFuture<'static, Result<RequestConfig, ClassifiedError>> + Send + Sync>;

pub type ResponseInterceptor = Arc<
    dyn Fn(Result<Response, ClassifiedError>, Arc<ResponseContext>) -> BoxFuture<'static, Result<Response, ClassifiedError>>
        + Send
        + Sync,
>;

/// What a response interceptor knows about the request it is looking at
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub request_id: RequestId,
    pub config: Arc<RequestConfig>,
    pub elapsed: Duration,
}

/// Wrap an async closure as a request interceptor
pub fn request_interceptor<F, Fut>(f: F) -> RequestInterceptor
where
    F: Fn(RequestConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RequestConfig, ClassifiedError>> + Send + 'static,
{
    Arc::new(move |config| f(config).boxed())
}

/// Wrap an async closure as a response interceptor
pub fn response_interceptor<F, Fut>(f: F) -> ResponseInterceptor
where
    F: Fn(Result<Response, ClassifiedError>, Arc<ResponseContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, ClassifiedError>> + Send + 'static,
{
    Arc::new(move |outcome, ctx| f(outcome, ctx).boxed())
}

#[derive(Default)]
pub struct InterceptorPipeline {
    request: RwLock<Vec<RequestInterceptor>>,
    response: RwLock<Vec<ResponseInterceptor>>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&self, interceptor: RequestInterceptor) {
        self.request.write().push(interceptor);
    }

    pub fn add_response(&self, interceptor: ResponseInterceptor) {
        self.response.write().push(interceptor);
    }

    pub fn request_count(&self) -> usize {
        self.request.read().len()
    }

    pub fn response_count(&self) -> usize {
        self.response.read().len()
    }

    /// Run request interceptors in registration order; the first error stops the chain
    pub async fn run_request(&self, config: RequestConfig) -> Result<RequestConfig, ClassifiedError> {
        let chain = self.request.read().clone();
        let mut config = config;
        for (index, interceptor) in chain.iter().enumerate() {
            config = interceptor(config).await.map_err(|e| {
                debug!(index, kind = %e.kind, "Request interceptor rejected");
                e
            })?;
        }
        Ok(config)
    }

    /// Run response interceptors in registration order.
    ///
    /// Each interceptor sees the previous outcome, success or failure. An
    /// interceptor that turns a success into a failure ends the chain.
    pub async fn run_response(
        &self,
        outcome: Result<Response, ClassifiedError>,
        ctx: Arc<ResponseContext>,
    ) -> Result<Response, ClassifiedError> {
        let chain = self.response.read().clone();
        let mut outcome = outcome;
        for (index, interceptor) in chain.iter().enumerate() {
            let was_ok = outcome.is_ok();
            outcome = interceptor(outcome, ctx.clone()).await;
            if was_ok && outcome.is_err() {
                debug!(index, request_id = %ctx.request_id, "Response interceptor rejected");
                break;
            }
        }
        outcome
    }
}

// ============================================================================
// Built-ins
// ============================================================================

/// Attach `Authorization: Bearer <token>` unless the caller set one
pub fn auth_header(auth: Arc<AuthTokenManager>) -> RequestInterceptor {
    request_interceptor(move |mut config: RequestConfig| {
        let token = auth.current_token();
        async move {
            if config.header("authorization").is_none() {
                if let Some(token) = token {
                    config.set_header("Authorization", format!("Bearer {}", token));
                }
            }
            Ok(config)
        }
    })
}

/// Log 5xx failures and publish api:serverError
pub fn server_error_logger(events: EventBus) -> ResponseInterceptor {
    response_interceptor(move |outcome: Result<Response, ClassifiedError>, ctx: Arc<ResponseContext>| {
        let events = events.clone();
        async move {
            if let Err(err) = &outcome {
                if err.kind == ErrorKind::ServerError {
                    let status = err.http_status.unwrap_or(500);
                    error!(
                        request_id = %ctx.request_id,
                        method = %ctx.config.method,
                        url = %ctx.config.url,
                        status,
                        attempts = err.attempts,
                        message = %err.message,
                        "Server error"
                    );
                    events.emit(ApiEvent::ApiServerError {
                        status,
                        url: ctx.config.url.clone(),
                    });
                }
            }
            outcome
        }
    })
}

/// Debug-level trace of every outgoing request
pub fn request_logger() -> RequestInterceptor {
    request_interceptor(|config: RequestConfig| async move {
        debug!(method = %config.method, url = %config.url, "Outgoing request");
        Ok(config)
    })
}
