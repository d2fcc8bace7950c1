use std::time::Duration;

use af_client::{classify_response, RequestConfig, TokenRefresher, Transport};
use af_common::{ClassifiedError, ErrorKind, Method, Response, ResponseType, TransportError};
use af_config::ClientConfig;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, warn};

/// reqwest client settings
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub connect_timeout: Duration,
    /// Per-attempt ceiling; the dispatcher enforces the overall budget
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("apiflow/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// `Transport` backed by a pooled `reqwest::Client`
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .build()?;

        Ok(Self { client })
    }

    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        Self::new(HttpTransportConfig {
            request_timeout: config.http.timeout(),
            ..HttpTransportConfig::default()
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

/// Drain a reqwest response into the transport-neutral shape
async fn read_response(response: reqwest::Response) -> Result<Response, TransportError> {
    let status = response.status().as_u16();
    let headers: IndexMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response.bytes().await.map_err(map_error)?;

    Ok(Response::new(status, headers, body))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &RequestConfig) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        debug!(method = %request.method.as_str(), url = %request.url, "Sending HTTP request");

        let response = builder.send().await.map_err(map_error)?;
        read_response(response).await
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "access_token", alias = "accessToken")]
    token: Option<String>,
}

/// Exchanges the rejected token for a fresh one at `refresh_url`
#[derive(Clone)]
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    refresh_url: String,
}

impl HttpTokenRefresher {
    pub fn new(transport: &HttpTransport, refresh_url: impl Into<String>) -> Self {
        Self {
            client: transport.client().clone(),
            refresh_url: refresh_url.into(),
        }
    }

    /// Refresh endpoint resolved against the configured base URL
    pub fn from_config(transport: &HttpTransport, config: &ClientConfig) -> Self {
        let url = af_client::request::join_url(config.http.base_url.as_deref(), &config.auth.refresh_path);
        Self::new(transport, url)
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, rejected: Option<&str>) -> Result<String, ClassifiedError> {
        let mut request = self.client.post(&self.refresh_url);
        if let Some(token) = rejected {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| ClassifiedError::from(map_error(e)))?;
        let response = read_response(response).await?;

        if let Some(err) = classify_response(&response, ResponseType::Json) {
            warn!(status = response.status, kind = %err.kind, "Token refresh rejected");
            return Err(err);
        }

        let parsed: RefreshResponse = response.json().map_err(|e| {
            ClassifiedError::new(ErrorKind::Authentication, format!("Malformed refresh response: {}", e))
        })?;

        match parsed.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ClassifiedError::authentication("Refresh response carried no token")),
        }
    }
}
