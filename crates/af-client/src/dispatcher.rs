//! Dispatcher - the single entry point for requests
//!
//! A dispatched request flows through:
//! 1. Request interceptors (registration order, any error aborts)
//! 2. Dedupe check against in-flight requests sharing its key
//! 3. The retry loop, where each attempt takes a slot from its
//!    concurrency group, calls the transport and classifies the outcome.
//!    Authentication failures are handed to the AuthTokenManager.
//! 4. Registry removal, then response interceptors
//!
//! The request timeout is a total budget around steps 1-3.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use af_common::{ApiEvent, ClassifiedError, ErrorKind, EventBus, RequestId, Response};
use af_config::{ClientConfig, ConcurrencyConfig};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthTokenManager, ReplayFn};
use crate::classifier::{classify_response, classify_transport_error};
use crate::interceptor::{
    auth_header, server_error_logger, InterceptorPipeline, RequestInterceptor, ResponseContext,
    ResponseInterceptor,
};
use crate::registry::{
    cancel_once, ActiveRequest, ActiveRequestInfo, RegistrationGuard, RequestPhase, RequestRegistry,
};
use crate::request::{join_url, RequestConfig};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::scheduler::{self, BatchFailure, BatchOptions, ConcurrencyScheduler, SchedulerStats};
use crate::transport::Transport;

pub const DEFAULT_GROUP: &str = "default";

type Outcome = Result<Response, ClassifiedError>;

/// Handle to a dispatched request. Awaiting it yields the outcome.
pub struct PendingRequest {
    id: RequestId,
    cancel: CancellationToken,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Cancel this request; it resolves with Aborted
    pub fn cancel(&self) -> bool {
        cancel_once(&self.cancel)
    }
}

impl Future for PendingRequest {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(ClassifiedError::aborted("Request task ended without a result"))))
    }
}

/// Client-level defaults merged beneath every request
#[derive(Debug, Clone)]
struct Defaults {
    base_url: Option<String>,
    headers: IndexMap<String, String>,
    timeout: Duration,
    retry: RetryPolicy,
}

struct Inner {
    transport: Arc<dyn Transport>,
    pipeline: InterceptorPipeline,
    registry: Arc<RequestRegistry>,
    auth: Option<Arc<AuthTokenManager>>,
    events: EventBus,
    defaults: Defaults,
    limits: ConcurrencyConfig,
    schedulers: DashMap<String, Arc<ConcurrencyScheduler>>,
    /// Leaders of deduplicated requests, keyed by dedupe key
    inflight: DashMap<String, broadcast::Sender<Outcome>>,
    offline: AtomicBool,
}

/// Cloneable dispatcher; every clone shares one registry and auth state
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn builder(transport: Arc<dyn Transport>) -> DispatcherBuilder {
        DispatcherBuilder::new(transport)
    }

    /// Start a request and return its handle. Must be called within a tokio runtime.
    pub fn dispatch(&self, config: RequestConfig) -> PendingRequest {
        let config = self.inner.merge_defaults(config);
        let guard = self.inner.registry.register(&config);
        let id = guard.id();
        let cancel = guard.cancel_token().clone();
        let (tx, rx) = oneshot::channel();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner.run(config, guard).await;
            let _ = tx.send(outcome);
        });

        PendingRequest { id, cancel, rx }
    }

    pub async fn request(&self, config: RequestConfig) -> Outcome {
        self.dispatch(config).await
    }

    /// Abort a tracked request. Returns false for unknown or finished ids.
    pub fn cancel(&self, id: RequestId) -> bool {
        let cancelled = self.inner.registry.cancel(id);
        if cancelled {
            debug!(request_id = %id, "Cancelled request");
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let count = self.inner.registry.cancel_all();
        if count > 0 {
            info!(count, "Cancelled all active requests");
        }
        count
    }

    pub fn active_requests(&self) -> Vec<ActiveRequestInfo> {
        self.inner.registry.snapshot()
    }

    pub fn is_active(&self, id: RequestId) -> bool {
        self.inner.registry.contains(id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Run a batch of requests with at most `limit` in flight
    pub async fn parallel(&self, configs: Vec<RequestConfig>, limit: usize) -> Vec<Outcome> {
        scheduler::parallel(self.batch_ops(configs), limit).await
    }

    pub async fn parallel_with(
        &self,
        configs: Vec<RequestConfig>,
        options: BatchOptions,
    ) -> Result<Vec<Outcome>, BatchFailure<ClassifiedError>> {
        scheduler::parallel_with(self.batch_ops(configs), options).await
    }

    fn batch_ops(
        &self,
        configs: Vec<RequestConfig>,
    ) -> Vec<impl FnOnce() -> futures::future::BoxFuture<'static, Outcome>> {
        configs
            .into_iter()
            .map(|config| {
                let this = self.clone();
                move || async move { this.request(config).await }.boxed()
            })
            .collect()
    }

    pub fn interceptors(&self) -> &InterceptorPipeline {
        &self.inner.pipeline
    }

    pub fn add_request_interceptor(&self, interceptor: RequestInterceptor) {
        self.inner.pipeline.add_request(interceptor);
    }

    pub fn add_response_interceptor(&self, interceptor: ResponseInterceptor) {
        self.inner.pipeline.add_response(interceptor);
    }

    pub fn auth(&self) -> Option<&Arc<AuthTokenManager>> {
        self.inner.auth.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn scheduler_stats(&self) -> Vec<SchedulerStats> {
        let mut stats: Vec<SchedulerStats> =
            self.inner.schedulers.iter().map(|s| s.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Cancel everything in flight and drop the session
    pub async fn logout(&self) {
        self.cancel_all();
        if let Some(auth) = &self.inner.auth {
            if let Err(e) = auth.logout().await {
                warn!(error = %e, "Failed to clear token during logout");
            }
        }
    }
}

impl Inner {
    fn merge_defaults(&self, mut config: RequestConfig) -> RequestConfig {
        config.url = join_url(self.defaults.base_url.as_deref(), &config.url);
        for (key, value) in &self.defaults.headers {
            if config.header(key).is_none() {
                config.headers.insert(key.clone(), value.clone());
            }
        }
        if config.timeout.is_none() {
            config.timeout = Some(self.defaults.timeout);
        }
        if config.retry_policy.is_none() {
            config.retry_policy = Some(self.defaults.retry.clone());
        }
        config
    }

    fn scheduler_for(&self, group: Option<&str>) -> Arc<ConcurrencyScheduler> {
        let name = group.unwrap_or(DEFAULT_GROUP);
        self.schedulers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ConcurrencyScheduler::new(name, self.limits.limit_for(name))))
            .value()
            .clone()
    }

    async fn run(self: Arc<Self>, config: RequestConfig, guard: RegistrationGuard) -> Outcome {
        let id = guard.id();
        let cancel = guard.cancel_token().clone();
        let entry = guard.entry().clone();
        let started = Instant::now();
        let budget = config.timeout.unwrap_or(self.defaults.timeout);
        let original = Arc::new(config.clone());
        let admitted: OnceLock<Arc<RequestConfig>> = OnceLock::new();

        metrics::counter!("apiflow_requests_total", "method" => config.method.as_str()).increment(1);

        let work = async {
            let config = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClassifiedError::aborted("Request cancelled")),
                result = self.pipeline.run_request(config) => result?,
            };
            let config = Arc::new(config);
            let _ = admitted.set(config.clone());

            match config.dedupe_key.clone() {
                Some(key) => self.deduplicated(key, id, &config, &cancel, &entry).await,
                None => self.execute(id, &config, &cancel, &entry).await,
            }
        };

        let outcome = match tokio::time::timeout(budget, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(request_id = %id, timeout_ms = budget.as_millis() as u64, "Request timed out");
                Err(ClassifiedError::timeout(budget))
            }
        };

        let config = admitted.get().cloned().unwrap_or(original);
        drop(guard);

        if let Err(err) = &outcome {
            if err.kind == ErrorKind::Authorization {
                self.events.emit(ApiEvent::AuthForbidden {
                    request_id: id,
                    url: config.url.clone(),
                });
            }
        }

        let ctx = Arc::new(ResponseContext {
            request_id: id,
            config,
            elapsed: started.elapsed(),
        });
        let outcome = self.pipeline.run_response(outcome, ctx).await;

        let elapsed = started.elapsed();
        metrics::histogram!("apiflow_request_duration_seconds").record(elapsed.as_secs_f64());

        match &outcome {
            Ok(response) => {
                debug!(
                    request_id = %id,
                    status = response.status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request completed"
                );
            }
            Err(err) if err.is_aborted() => {
                debug!(request_id = %id, "Request aborted");
            }
            Err(err) => {
                metrics::counter!("apiflow_request_failures_total", "kind" => err.kind.as_str()).increment(1);
                warn!(
                    request_id = %id,
                    kind = %err.kind,
                    status = ?err.http_status,
                    attempts = err.attempts,
                    error = %err.message,
                    "Request failed"
                );
                self.events.emit(ApiEvent::ApiRequestFailed {
                    request_id: id,
                    error: err.clone(),
                });
            }
        }

        outcome
    }

    /// Share one execution between every request carrying `key`. A follower
    /// whose leader was cancelled or timed out takes the key over itself.
    async fn deduplicated(
        self: &Arc<Self>,
        key: String,
        id: RequestId,
        config: &Arc<RequestConfig>,
        cancel: &CancellationToken,
        entry: &ActiveRequest,
    ) -> Outcome {
        loop {
            let leader = match self.inflight.entry(key.clone()) {
                Entry::Occupied(existing) => Err(existing.get().subscribe()),
                Entry::Vacant(vacant) => {
                    let (tx, _) = broadcast::channel(1);
                    vacant.insert(tx.clone());
                    Ok(tx)
                }
            };

            match leader {
                Err(mut rx) => {
                    debug!(request_id = %id, dedupe_key = %key, "Joining in-flight request");
                    let shared = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ClassifiedError::aborted("Request cancelled")),
                        shared = rx.recv() => shared.ok(),
                    };
                    match shared {
                        Some(Err(err)) if err.is_aborted() => {}
                        Some(outcome) => return outcome,
                        None => {}
                    }
                    if cancel.is_cancelled() {
                        return Err(ClassifiedError::aborted("Request cancelled"));
                    }
                    debug!(request_id = %id, dedupe_key = %key, "Shared request abandoned, retrying");
                }
                Ok(tx) => {
                    let slot = DedupeSlot { map: &self.inflight, key };
                    let outcome = self.execute(id, config, cancel, entry).await;
                    // Unregister before publishing so later requests start fresh
                    drop(slot);
                    let _ = tx.send(outcome.clone());
                    return outcome;
                }
            }
        }
    }

    async fn execute(
        self: &Arc<Self>,
        id: RequestId,
        config: &Arc<RequestConfig>,
        cancel: &CancellationToken,
        entry: &ActiveRequest,
    ) -> Outcome {
        let policy = config
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.defaults.retry.clone());
        let scheduler = self.scheduler_for(config.concurrency_group.as_deref());
        let scheduler = &scheduler;

        let result = execute_with_retry(&policy, cancel, move |attempt| {
            self.attempt(id, config, attempt, scheduler, cancel, entry)
        })
        .await;
        entry.set_phase(RequestPhase::Waiting);
        result
    }

    async fn attempt(
        self: &Arc<Self>,
        id: RequestId,
        config: &Arc<RequestConfig>,
        attempt: u32,
        scheduler: &Arc<ConcurrencyScheduler>,
        cancel: &CancellationToken,
        entry: &ActiveRequest,
    ) -> Outcome {
        entry.set_phase(RequestPhase::Queued);
        let permit = scheduler.acquire(cancel).await?;

        entry.set_phase(RequestPhase::InFlight);
        debug!(request_id = %id, attempt, scheduler = scheduler.name(), "Sending");
        let outcome = self.send_once(config, cancel).await;
        drop(permit);
        entry.set_phase(RequestPhase::Waiting);

        match (outcome, &self.auth) {
            (Err(err), Some(auth)) if err.kind == ErrorKind::Authentication => {
                debug!(request_id = %id, "Unauthorized, handing to token manager");
                let sent = config.bearer_token().map(String::from);
                let replay = self.replay(config.clone(), scheduler.clone(), cancel.clone());
                auth.recover(sent, replay).await
            }
            (outcome, _) => outcome,
        }
    }

    /// Re-send with a fresh token. A replay never recovers from its own 401.
    fn replay(
        self: &Arc<Self>,
        config: Arc<RequestConfig>,
        scheduler: Arc<ConcurrencyScheduler>,
        cancel: CancellationToken,
    ) -> ReplayFn {
        let this = self.clone();
        Box::new(move |token: String| {
            async move {
                let mut config = (*config).clone();
                config.set_header("Authorization", format!("Bearer {}", token));
                let permit = scheduler.acquire(&cancel).await?;
                let outcome = this.send_once(&config, &cancel).await;
                drop(permit);
                outcome
            }
            .boxed()
        })
    }

    /// One transport call, raced against cancellation, then classified
    async fn send_once(&self, config: &RequestConfig, cancel: &CancellationToken) -> Outcome {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClassifiedError::aborted("Request cancelled in flight")),
            result = self.transport.send(config) => result,
        };

        let outcome = match result {
            Ok(response) => match classify_response(&response, config.response_type) {
                None => Ok(response),
                Some(err) => Err(err),
            },
            Err(err) => Err(classify_transport_error(&err)),
        };

        self.track_connectivity(&outcome);
        outcome
    }

    fn track_connectivity(&self, outcome: &Outcome) {
        let unreachable = matches!(outcome, Err(err) if err.kind == ErrorKind::Network);
        let reached = match outcome {
            Ok(_) => true,
            Err(err) => err.http_status.is_some(),
        };

        if unreachable && !self.offline.swap(true, Ordering::SeqCst) {
            warn!("Network unreachable, marking offline");
            self.events.emit(ApiEvent::NetworkOffline);
        } else if reached && self.offline.swap(false, Ordering::SeqCst) {
            info!("Network reachable again");
            self.events.emit(ApiEvent::NetworkOnline);
        }
    }
}

/// Releases a dedupe key when the leader finishes or is dropped
struct DedupeSlot<'a> {
    map: &'a DashMap<String, broadcast::Sender<Outcome>>,
    key: String,
}

impl Drop for DedupeSlot<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct DispatcherBuilder {
    transport: Arc<dyn Transport>,
    defaults: Defaults,
    limits: ConcurrencyConfig,
    auth: Option<Arc<AuthTokenManager>>,
    events: EventBus,
    request_interceptors: Vec<RequestInterceptor>,
    response_interceptors: Vec<ResponseInterceptor>,
    builtin_interceptors: bool,
}

impl DispatcherBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let http = af_config::HttpConfig::default();
        Self {
            transport,
            defaults: Defaults {
                base_url: None,
                headers: IndexMap::new(),
                timeout: http.timeout(),
                retry: RetryPolicy::default(),
            },
            limits: ConcurrencyConfig::default(),
            auth: None,
            events: EventBus::default(),
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
            builtin_interceptors: true,
        }
    }

    /// Defaults for base URL, headers, timeout, retry and concurrency
    pub fn from_config(config: &ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let mut headers: Vec<(&String, &String)> = config.http.headers.iter().collect();
        headers.sort();

        let mut builder = Self::new(transport);
        builder.defaults = Defaults {
            base_url: config.http.base_url.clone(),
            headers: headers.into_iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            timeout: config.http.timeout(),
            retry: RetryPolicy::from_config(&config.retry),
        };
        builder.limits = config.concurrency.clone();
        builder
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.defaults.base_url = Some(base_url.into());
        self
    }

    pub fn with_default_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.defaults.retry = policy;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.limits.limit = limit.max(1);
        self
    }

    pub fn with_group_limit(mut self, group: impl Into<String>, limit: usize) -> Self {
        self.limits.groups.insert(group.into(), limit.max(1));
        self
    }

    pub fn with_auth(mut self, auth: Arc<AuthTokenManager>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_request_interceptor(mut self, interceptor: RequestInterceptor) -> Self {
        self.request_interceptors.push(interceptor);
        self
    }

    pub fn with_response_interceptor(mut self, interceptor: ResponseInterceptor) -> Self {
        self.response_interceptors.push(interceptor);
        self
    }

    /// Skip the auth header injector and server error logger
    pub fn without_builtin_interceptors(mut self) -> Self {
        self.builtin_interceptors = false;
        self
    }

    pub fn build(self) -> Dispatcher {
        let pipeline = InterceptorPipeline::new();
        if self.builtin_interceptors {
            if let Some(auth) = &self.auth {
                pipeline.add_request(auth_header(auth.clone()));
            }
            pipeline.add_response(server_error_logger(self.events.clone()));
        }
        for interceptor in self.request_interceptors {
            pipeline.add_request(interceptor);
        }
        for interceptor in self.response_interceptors {
            pipeline.add_response(interceptor);
        }

        info!(
            base_url = ?self.defaults.base_url,
            timeout_ms = self.defaults.timeout.as_millis() as u64,
            max_attempts = self.defaults.retry.max_attempts,
            concurrency = self.limits.limit,
            auth = self.auth.is_some(),
            "Dispatcher ready"
        );

        Dispatcher {
            inner: Arc::new(Inner {
                transport: self.transport,
                pipeline,
                registry: Arc::new(RequestRegistry::new()),
                auth: self.auth,
                events: self.events,
                defaults: self.defaults,
                limits: self.limits,
                schedulers: DashMap::new(),
                inflight: DashMap::new(),
                offline: AtomicBool::new(false),
            }),
        }
    }
}
