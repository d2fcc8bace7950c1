//! apiflow orchestration core
//!
//! - ErrorClassifier: maps transport outcomes to `ErrorKind`
//! - RetryEngine: bounded retry with exponential backoff
//! - ConcurrencyScheduler: bounded batches and per-group admission
//! - AuthTokenManager: single-flight token refresh with FIFO replay
//! - InterceptorPipeline: request/response function chains
//! - Dispatcher: ties the above together around a `Transport`

pub mod auth;
pub mod classifier;
pub mod dispatcher;
pub mod interceptor;
pub mod registry;
pub mod request;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use auth::{
    AuthStatus, AuthTokenManager, MemoryTokenStore, ReplayFn, StorageError, TokenRefresher, TokenStore,
    DEFAULT_STORAGE_KEY,
};
pub use tokio_util::sync::CancellationToken;
pub use classifier::{classify, classify_response, classify_status, is_retryable, is_retryable_status};
pub use dispatcher::{Dispatcher, DispatcherBuilder, PendingRequest, DEFAULT_GROUP};
pub use interceptor::{
    auth_header, request_interceptor, request_logger, response_interceptor, server_error_logger,
    InterceptorPipeline, RequestInterceptor, ResponseContext, ResponseInterceptor,
};
pub use registry::{ActiveRequestInfo, RequestPhase, RequestRegistry};
pub use request::RequestConfig;
pub use retry::{execute_with_retry, AttemptRecord, RetryPolicy, RetryPredicate, RetryState};
pub use scheduler::{parallel, parallel_with, BatchFailure, BatchOptions, ConcurrencyScheduler, SchedulerStats};
pub use transport::Transport;

pub use af_common::{
    ApiEvent, ClassifiedError, ErrorKind, EventBus, Method, RequestId, Response, ResponseType, TransportError,
};
