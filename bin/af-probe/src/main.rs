//! apiflow probe
//!
//! Loads client configuration, dispatches every URL given on the command
//! line through the full stack (interceptors, retry, scheduling, auth
//! refresh) and prints per-request outcomes plus the notifications a UI
//! would have shown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use af_client::{AuthTokenManager, BatchOptions, DispatcherBuilder, MemoryTokenStore, RequestConfig, TokenStore};
use af_common::{EventBus, Method};
use af_config::ClientConfig;
use af_feedback::{spawn_error_reporter, LoadingOptions, LoadingStateManager, NotificationQueue};
use af_transport::{FileTokenStore, HttpTokenRefresher, HttpTransport};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const LOADING_KEY: &str = "probe";

#[derive(Parser, Debug)]
#[command(name = "af-probe")]
#[command(about = "Dispatch requests through apiflow and report outcomes")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "APIFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Request URLs, absolute or relative to the configured base URL
    #[arg(required = true)]
    urls: Vec<String>,

    /// HTTP method used for every request
    #[arg(long, default_value = "GET")]
    method: String,

    /// Batch concurrency; defaults to the configured limit
    #[arg(long)]
    limit: Option<usize>,

    /// Stop admitting requests after the first failure
    #[arg(long, default_value = "false")]
    fail_fast: bool,

    /// Initial bearer token
    #[arg(long, env = "APIFLOW_TOKEN")]
    token: Option<String>,

    /// Persist the auth token in this JSON file instead of memory
    #[arg(long, env = "APIFLOW_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "APIFLOW_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[derive(Debug, Serialize)]
struct Outcome {
    url: String,
    status: Option<u16>,
    error_kind: Option<af_common::ErrorKind>,
    message: Option<String>,
    attempts: Option<u32>,
}

fn parse_method(raw: &str) -> Result<Method> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::Get),
        "POST" => Ok(Method::Post),
        "PUT" => Ok(Method::Put),
        "PATCH" => Ok(Method::Patch),
        "DELETE" => Ok(Method::Delete),
        "HEAD" => Ok(Method::Head),
        "OPTIONS" => Ok(Method::Options),
        other => anyhow::bail!("unsupported method: {}", other),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_auth(args: &Args, config: &ClientConfig, http: &HttpTransport, events: &EventBus) -> Result<Option<Arc<AuthTokenManager>>> {
    if args.token.is_none() && args.token_file.is_none() {
        return Ok(None);
    }

    let store: Arc<dyn TokenStore> = match &args.token_file {
        Some(path) => Arc::new(FileTokenStore::new(path)),
        None => Arc::new(MemoryTokenStore::new()),
    };
    let refresher = HttpTokenRefresher::from_config(http, config);
    info!(refresh_url = %refresher.refresh_url(), store = store.name(), "Auth enabled");

    let auth = Arc::new(
        AuthTokenManager::new(Arc::new(refresher), store, events.clone())
            .with_storage_key(config.auth.storage_key.clone()),
    );

    match &args.token {
        Some(token) => auth.set_token(token.clone()).await.context("storing initial token")?,
        None => {
            if !auth.restore().await.context("restoring token")? {
                warn!("No stored token found; requests will go out unauthenticated");
            }
        }
    }
    Ok(Some(auth))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = ClientConfig::load_with_env(args.config.as_deref())?;
    let method = parse_method(&args.method)?;
    info!(
        base_url = ?config.http.base_url,
        requests = args.urls.len(),
        "Starting apiflow probe"
    );

    let events = EventBus::new(config.events.capacity);
    let http = HttpTransport::from_config(&config)?;
    let auth = build_auth(&args, &config, &http, &events).await?;

    let mut builder = DispatcherBuilder::from_config(&config, Arc::new(http)).with_events(events.clone());
    if let Some(auth) = &auth {
        builder = builder.with_auth(auth.clone());
    }
    let dispatcher = builder.build();

    let loading = LoadingStateManager::from_config(&config.loading, events.clone());
    let notifications = NotificationQueue::from_config(config.notifications.clone(), events.clone());
    let reporter = spawn_error_reporter(notifications.clone(), &events, config.auth.login_route.clone());

    let mut event_log = events.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match event_log.recv().await {
                Ok(event) => debug!(event = event.name(), "Event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let requests: Vec<RequestConfig> = args
        .urls
        .iter()
        .map(|url| RequestConfig::new(method, url.clone()))
        .collect();
    let limit = args.limit.unwrap_or(config.concurrency.limit);

    loading.show(LOADING_KEY, LoadingOptions::default());
    let results: Vec<(String, _)> = if args.fail_fast {
        match dispatcher
            .parallel_with(requests, BatchOptions::new(limit).fail_fast())
            .await
        {
            Ok(results) => args.urls.iter().cloned().zip(results).collect(),
            Err(failure) => {
                loading.error(LOADING_KEY, &failure.error.user_message);
                warn!(index = failure.index, kind = %failure.error.kind, "Batch halted");
                vec![(args.urls[failure.index].clone(), Err(failure.error))]
            }
        }
    } else {
        let results = dispatcher.parallel(requests, limit).await;
        args.urls.iter().cloned().zip(results).collect()
    };
    loading.hide(LOADING_KEY);

    let outcomes: Vec<Outcome> = results
        .into_iter()
        .map(|(url, result)| match result {
            Ok(response) => Outcome {
                url,
                status: Some(response.status),
                error_kind: None,
                message: None,
                attempts: None,
            },
            Err(err) => Outcome {
                url,
                status: err.http_status,
                error_kind: Some(err.kind),
                message: Some(err.message.clone()),
                attempts: Some(err.attempts),
            },
        })
        .collect();

    // Let the reporter drain the final failures before reading the queue
    tokio::time::sleep(Duration::from_millis(50)).await;

    let failed = outcomes.iter().filter(|o| o.error_kind.is_some()).count();
    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    for notice in notifications.entries() {
        println!("[{:?}] {} (x{})", notice.kind, notice.message, notice.repeat);
    }
    info!(total = outcomes.len(), failed, "Probe complete");

    reporter.abort();
    event_logger.abort();
    Ok(())
}
