//! HTTP client with retry logic for provider API communication

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::ProviderConfiguration;

use super::errors::{ProviderError, ProviderResult};
use super::rate_limit::RateLimiter;
use super::types::{ProviderRunner, RegistrationToken, RunnerPage};

/// Initial backoff delay; doubled with jitter on each retry
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay between retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Retries stop once this much time has elapsed
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(60);

/// Runners fetched per listing page
const RUNNERS_PER_PAGE: u32 = 100;

/// Capability interface to the source-control provider
///
/// The daemon core only ever sees this trait; tests substitute an in-memory
/// fake.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// List all runners the provider knows for the repository scope
    async fn list_runners(&self, repo: &str) -> ProviderResult<Vec<ProviderRunner>>;

    /// Mint a one-shot, short-lived registration token
    async fn mint_registration_token(&self, repo: &str) -> ProviderResult<RegistrationToken>;

    /// Delete a runner by provider id; absent runners count as success
    async fn delete_runner(&self, repo: &str, provider_runner_id: i64) -> ProviderResult<()>;
}

/// HTTP implementation of [`ProviderClient`]
pub struct HttpProviderClient {
    client: Client,
    base_url: String,
    org: String,
    token: String,
    limiter: RateLimiter,
}

impl HttpProviderClient {
    /// Create a new client with the given configuration
    pub fn new(config: &ProviderConfiguration) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(ProviderError::Request)?;

        let base_url = config.url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ProviderError::InvalidUrl(
                "URL must start with http:// or https://".to_string(),
            ));
        }

        Ok(Self {
            client,
            base_url,
            org: config.org.clone(),
            token: config.token.clone(),
            limiter: RateLimiter::new(&config.rate_limit),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Build a full URL for a repository-scoped runner path
    fn url(&self, repo: &str, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            format!(
                "{}/repos/{}/{}/actions/runners",
                self.base_url, self.org, repo
            )
        } else {
            format!(
                "{}/repos/{}/{}/actions/runners/{}",
                self.base_url, self.org, repo, path
            )
        }
    }

    /// Make a request, retrying transient failures with jittered backoff
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        accept_not_found: bool,
    ) -> ProviderResult<Option<T>> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(BASE_RETRY_DELAY)
            .with_max_interval(MAX_RETRY_DELAY)
            .with_max_elapsed_time(Some(MAX_RETRY_ELAPSED))
            .build();

        let result = backoff::future::retry(policy, || async {
            self.limiter.acquire().await.map_err(classify)?;

            let request = self
                .client
                .request(method.clone(), url)
                .header("Authorization", self.auth_header())
                .header("Accept", "application/json")
                .header("User-Agent", concat!("fleet-daemon/", env!("CARGO_PKG_VERSION")));

            match self.execute_request(request).await {
                Ok(response) => {
                    if accept_not_found && response.status() == StatusCode::NO_CONTENT {
                        return Ok(None);
                    }
                    self.parse_response(response).await.map(Some).map_err(classify)
                }
                Err(ProviderError::NotFound(_)) if accept_not_found => Ok(None),
                Err(e) => {
                    if e.is_retryable() {
                        warn!("provider request to {} failed, will retry: {}", url, e);
                    }
                    Err(classify(e))
                }
            }
        })
        .await;

        match result {
            Ok(v) => Ok(v),
            Err(e) if e.is_retryable() => Err(ProviderError::RetryExhausted(e.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Execute a single request, mapping status codes to typed errors
    async fn execute_request(&self, request: RequestBuilder) -> ProviderResult<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Request(e)
            }
        })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(ProviderError::RateLimited { retry_after });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Unauthorized(
                "provider rejected credentials".to_string(),
            ));
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound("resource not found".to_string()));
        }

        if status.is_server_error() || status.is_client_error() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    /// Parse a successful response body
    async fn parse_response<T: DeserializeOwned>(&self, response: Response) -> ProviderResult<T> {
        let text = response.text().await.map_err(ProviderError::Request)?;
        serde_json::from_str(&text).map_err(ProviderError::Parse)
    }
}

/// Map a provider error into the backoff retry classification.
///
/// 429 responses honor the indicated delay; other retryables use the
/// policy's jittered schedule; the rest are permanent.
fn classify(e: ProviderError) -> backoff::Error<ProviderError> {
    let indicated = match &e {
        ProviderError::RateLimited {
            retry_after: Some(secs),
        } => Some(Duration::from_secs(*secs)),
        _ => None,
    };

    if let Some(delay) = indicated {
        backoff::Error::retry_after(e, delay)
    } else if e.is_retryable() {
        backoff::Error::transient(e)
    } else {
        backoff::Error::permanent(e)
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn list_runners(&self, repo: &str) -> ProviderResult<Vec<ProviderRunner>> {
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let url = format!(
                "{}?per_page={}&page={}",
                self.url(repo, ""),
                RUNNERS_PER_PAGE,
                page
            );
            let body: RunnerPage = self
                .request(Method::GET, &url, false)
                .await?
                .ok_or_else(|| ProviderError::NotFound("runner listing".to_string()))?;

            let fetched = body.runners.len();
            all.extend(body.runners);

            if all.len() as u64 >= body.total_count || fetched == 0 {
                break;
            }
            page += 1;
        }

        debug!("fetched {} runners from provider for {}", all.len(), repo);
        Ok(all)
    }

    async fn mint_registration_token(&self, repo: &str) -> ProviderResult<RegistrationToken> {
        let url = self.url(repo, "registration-token");
        self.request(Method::POST, &url, false)
            .await?
            .ok_or_else(|| ProviderError::NotFound("registration token".to_string()))
    }

    async fn delete_runner(&self, repo: &str, provider_runner_id: i64) -> ProviderResult<()> {
        let url = self.url(repo, &provider_runner_id.to_string());
        // 404 means the runner is already gone, which is what we wanted
        self.request::<serde_json::Value>(Method::DELETE, &url, true)
            .await?;
        Ok(())
    }
}
