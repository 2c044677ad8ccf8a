//! Audiobookshelf adapter. Pagination, auth, and ABS-side rate limiting
//! live here; callers see plain Rust items.

use crate::concurrency::rate_limiter::RateLimiter;
use crate::concurrency::semaphore::SharedSemaphore;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 200;
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct AbsLibrary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AbsItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub progress_percentage: Option<f64>,
    #[serde(default)]
    pub is_finished: bool,
    #[serde(default)]
    pub current_time: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub current_page: Option<f64>,
    #[serde(default)]
    pub total_pages: Option<f64>,
}

/// Abstraction over the ABS API so the sync pipeline is testable
/// without a live server.
#[async_trait]
pub trait AbsSource: Send + Sync {
    async fn list_libraries(&self) -> Result<Vec<AbsLibrary>>;
    async fn list_items(&self, library_id: &str, page_size: u32, max: Option<u32>) -> Result<Vec<AbsItem>>;
    async fn get_item(&self, item_id: &str) -> Result<AbsItem>;
}

pub struct AbsClient {
    client: Client,
    base_url: String,
    token: String,
    rate_limiter: Arc<RateLimiter>,
    semaphore: SharedSemaphore,
}

impl AbsClient {
    pub fn new(base_url: String, token: String, rate_limiter: Arc<RateLimiter>, semaphore: SharedSemaphore) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("shelfbridge/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            rate_limiter,
            semaphore,
        }
    }

    async fn get_with_retry<T: for<'de> Deserialize<'de>>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.rate_limiter
            .wait_if_needed(crate::concurrency::ENDPOINT_AUDIOBOOKSHELF)
            .await;
        let _permit = self.semaphore.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..=MAX_RETRIES {
            let resp = timeout(
                Duration::from_secs(REQUEST_TIMEOUT_SECS),
                self.client
                    .get(&url)
                    .bearer_auth(&self.token)
                    .query(query)
                    .send(),
            )
            .await
            .context("abs request timed out")?;

            match resp {
                Ok(r) if r.status().is_success() => {
                    return r.json::<T>().await.context("decoding abs response");
                }
                Ok(r) if r.status() == StatusCode::UNAUTHORIZED || r.status() == StatusCode::FORBIDDEN => {
                    bail!("abs auth failed: {}", r.status());
                }
                Ok(r) if r.status().is_server_error() || r.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!(status = %r.status(), attempt, "abs transient error, retrying");
                }
                Ok(r) => {
                    bail!("abs request failed: {}", r.status());
                }
                Err(e) => {
                    warn!(error = %e, attempt, "abs request error, retrying");
                }
            }

            if attempt < MAX_RETRIES {
                sleep(Duration::from_millis(backoff)).await;
                backoff *= 2;
            }
        }
        bail!("abs request exhausted retries: {}", path)
    }
}

#[async_trait]
impl AbsSource for AbsClient {
    async fn list_libraries(&self) -> Result<Vec<AbsLibrary>> {
        self.get_with_retry("/api/libraries", &[]).await
    }

    async fn list_items(&self, library_id: &str, page_size: u32, max: Option<u32>) -> Result<Vec<AbsItem>> {
        let mut out = Vec::new();
        let mut page = 0u32;
        loop {
            let path = format!("/api/libraries/{}/items", library_id);
            let query = [
                ("limit", page_size.to_string()),
                ("page", page.to_string()),
            ];
            let batch: Vec<AbsItem> = self.get_with_retry(&path, &query).await?;
            let got = batch.len();
            out.extend(batch);
            debug!(library_id, page, got, "fetched abs item page");

            if let Some(max) = max {
                if out.len() as u32 >= max {
                    out.truncate(max as usize);
                    break;
                }
            }
            if got < page_size as usize {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    async fn get_item(&self, item_id: &str) -> Result<AbsItem> {
        let path = format!("/api/items/{}", item_id);
        self.get_with_retry(&path, &[]).await
    }
}
