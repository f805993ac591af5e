use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use finsync_core::{ProviderAccount, ProviderBill, ProviderTransaction, SyncContext, UserCredential};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{ProviderClient, ProviderError};

/// What the client does after a provider call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 401/403: the item's credential was rejected.
    Reauthenticate,
    /// Try again; carries the server's `Retry-After` hint when it sent one.
    Retry(Option<Duration>),
    GiveUp,
}

pub fn classify_response(status: StatusCode, headers: &HeaderMap) -> RetryDecision {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RetryDecision::Reauthenticate,
        StatusCode::TOO_MANY_REQUESTS => RetryDecision::Retry(retry_after(headers)),
        s if s.is_server_error() => RetryDecision::Retry(None),
        _ => RetryDecision::GiveUp,
    }
}

pub fn classify_transport(err: &reqwest::Error) -> RetryDecision {
    if err.is_timeout() || err.is_connect() {
        RetryDecision::Retry(None)
    } else {
        RetryDecision::GiveUp
    }
}

/// Delta-seconds form only; HTTP-date values fall back to the policy delay.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Upper bound for both computed delays and server hints.
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): the server hint when
    /// present, else `initial_delay * 2^retry`, never above `ceiling`.
    pub fn delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        hint.unwrap_or_else(|| self.initial_delay.saturating_mul(1u32 << retry.min(16)))
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub page_size: u32,
    pub retry: RetryPolicy,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: "finsync/0.1".to_string(),
            page_size: 500,
            retry: RetryPolicy::default(),
        }
    }
}

impl HttpProviderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("PROVIDER_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("PROVIDER_API_KEY").unwrap_or(defaults.api_key),
            timeout: std::env::var("PROVIDER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("PROVIDER_USER_AGENT").unwrap_or(defaults.user_agent),
            page_size: std::env::var("PROVIDER_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            retry: defaults.retry,
        }
    }
}

/// Paged envelope every list endpoint answers with.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    results: Vec<T>,
    #[serde(default = "first_page")]
    page: u32,
    #[serde(default = "first_page")]
    total_pages: u32,
}

fn first_page() -> u32 {
    1
}

#[derive(Debug)]
pub struct HttpProviderClient {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpProviderClient {
    pub fn new(config: HttpProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = self.url(path);
        let policy = self.config.retry;
        let mut retry = 0u32;

        loop {
            let request = self
                .client
                .get(&url)
                .header("X-API-KEY", &self.config.api_key)
                .query(query);

            let (decision, failure) = match ctx.run(request.send()).await? {
                Ok(resp) if resp.status().is_success() => {
                    let body = ctx.run(resp.bytes()).await??;
                    return serde_json::from_slice(&body)
                        .map_err(|e| ProviderError::Decode(format!("{path}: {e}")));
                }
                Ok(resp) => {
                    let status = resp.status();
                    (
                        classify_response(status, resp.headers()),
                        ProviderError::HttpStatus {
                            status: status.as_u16(),
                            url: url.clone(),
                        },
                    )
                }
                Err(err) => (classify_transport(&err), ProviderError::Request(err)),
            };

            match decision {
                RetryDecision::Reauthenticate => {
                    return Err(ProviderError::InvalidCredential {
                        item_id: credential.item_id.clone(),
                    });
                }
                RetryDecision::Retry(hint) if retry < policy.max_retries => {
                    let delay = policy.delay(retry, hint);
                    warn!(
                        %url,
                        error = %failure,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider request"
                    );
                    ctx.run(tokio::time::sleep(delay)).await?;
                    retry += 1;
                }
                _ => return Err(failure),
            }
        }
    }

    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
        path: &str,
        mut query: Vec<(&str, String)>,
    ) -> Result<Vec<T>, ProviderError> {
        query.push(("itemId", credential.item_id.clone()));
        query.push(("pageSize", self.config.page_size.to_string()));

        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let mut page_query = query.clone();
            page_query.push(("page", page.to_string()));
            let body: Page<T> = self.get_json(ctx, credential, path, &page_query).await?;
            debug!(path, page = body.page, total_pages = body.total_pages, items = body.results.len(), "fetched provider page");
            out.extend(body.results);
            if body.page >= body.total_pages {
                return Ok(out);
            }
            page = body.page + 1;
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn fetch_accounts(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        self.get_all_pages(ctx, credential, "accounts", Vec::new()).await
    }

    async fn fetch_transactions(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
        since: Option<NaiveDate>,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        let mut query = Vec::new();
        if let Some(since) = since {
            query.push(("from", since.format("%Y-%m-%d").to_string()));
        }
        self.get_all_pages(ctx, credential, "transactions", query).await
    }

    async fn fetch_bills(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<Vec<ProviderBill>, ProviderError> {
        self.get_all_pages(ctx, credential, "bills", Vec::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use rust_decimal_macros::dec;

    #[test]
    fn retry_delay_doubles_until_the_ceiling() {
        let policy = RetryPolicy {
            max_retries: 4,
            initial_delay: Duration::from_millis(200),
            ceiling: Duration::from_secs(1),
        };
        let delays: Vec<_> = (0..4).map(|n| policy.delay(n, None)).collect();
        assert_eq!(
            delays,
            [200, 400, 800, 1000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.delay(40, None), Duration::from_secs(1));
    }

    #[test]
    fn throttling_honours_retry_after_within_the_ceiling() {
        let policy = RetryPolicy::default();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        let decision = classify_response(StatusCode::TOO_MANY_REQUESTS, &headers);
        assert_eq!(decision, RetryDecision::Retry(Some(Duration::from_secs(2))));
        let RetryDecision::Retry(hint) = decision else {
            unreachable!()
        };
        assert_eq!(policy.delay(0, hint), Duration::from_secs(2));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        let RetryDecision::Retry(hint) = classify_response(StatusCode::TOO_MANY_REQUESTS, &headers)
        else {
            unreachable!()
        };
        assert_eq!(policy.delay(0, hint), policy.ceiling);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, &headers),
            RetryDecision::Retry(None)
        );
    }

    #[test]
    fn statuses_map_to_decisions() {
        let none = HeaderMap::new();
        assert_eq!(classify_response(StatusCode::BAD_GATEWAY, &none), RetryDecision::Retry(None));
        assert_eq!(classify_response(StatusCode::FORBIDDEN, &none), RetryDecision::Reauthenticate);
        assert_eq!(classify_response(StatusCode::UNAUTHORIZED, &none), RetryDecision::Reauthenticate);
        assert_eq!(classify_response(StatusCode::NOT_FOUND, &none), RetryDecision::GiveUp);
    }

    #[test]
    fn page_envelope_defaults_to_single_page() {
        let page: Page<ProviderAccount> = serde_json::from_str(
            r#"{"results":[{"id":"acc-1","itemId":"item-1","name":"Nubank","type":"CREDIT","subtype":"CREDIT_CARD","balance":-310.5}]}"#,
        )
        .expect("parse");
        assert_eq!((page.page, page.total_pages), (1, 1));
        assert_eq!(page.results[0].balance, dec!(-310.5));
        assert_eq!(page.results[0].currency_code, "BRL");
    }

    #[test]
    fn url_joins_without_double_slash() {
        let client = HttpProviderClient::new(HttpProviderConfig {
            base_url: "https://provider.example/v1/".into(),
            ..HttpProviderConfig::default()
        })
        .expect("client");
        assert_eq!(client.url("accounts"), "https://provider.example/v1/accounts");
    }
}
