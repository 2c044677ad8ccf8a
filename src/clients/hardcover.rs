//! Hardcover GraphQL adapter.

use crate::concurrency::rate_limiter::RateLimiter;
use crate::concurrency::semaphore::SharedSemaphore;
use crate::matcher::index::LibraryEntry;
use crate::matcher::TitleAuthorCandidate;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 300;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const HARDCOVER_GRAPHQL_URL: &str = "https://api.hardcover.app/v1/graphql";

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub edition_id: i64,
    pub title: String,
    pub author: String,
    pub format: Option<String>,
}

/// Page-based or seconds-based reading progress, selected by edition format.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProgressPayload {
    Pages { current_page: f64, total_pages: f64 },
    Seconds { current_seconds: f64, total_seconds: f64 },
}

#[async_trait]
pub trait HardcoverSink: Send + Sync {
    async fn get_user_library(&self) -> Result<Vec<LibraryEntry>>;
    async fn search_by_asin(&self, asin: &str) -> Result<Option<SearchHit>>;
    async fn search_by_isbn(&self, isbn: &str) -> Result<Option<SearchHit>>;
    async fn search_for_matching(&self, title: &str, author: &str) -> Result<Vec<TitleAuthorCandidate>>;
    async fn add_book_to_library(&self, book_id: i64, edition_id: i64) -> Result<i64>;
    async fn update_reading_progress(&self, user_book_id: i64, edition_id: i64, payload: ProgressPayload) -> Result<()>;
    async fn mark_read(&self, user_book_id: i64) -> Result<()>;
    async fn start_new_reading_session(&self, user_book_id: i64, edition_id: i64) -> Result<()>;
}

pub struct HardcoverClient {
    client: Client,
    token: String,
    rate_limiter: Arc<RateLimiter>,
    semaphore: SharedSemaphore,
}

impl HardcoverClient {
    pub fn new(token: String, rate_limiter: Arc<RateLimiter>, semaphore: SharedSemaphore) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("shelfbridge/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            token,
            rate_limiter,
            semaphore,
        }
    }

    async fn execute(&self, query: &str, variables: Value) -> Result<Value> {
        self.rate_limiter
            .wait_if_needed(crate::concurrency::ENDPOINT_HARDCOVER)
            .await;
        let _permit = self.semaphore.acquire().await;

        let body = json!({ "query": query, "variables": variables });
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..=MAX_RETRIES {
            let resp = timeout(
                Duration::from_secs(REQUEST_TIMEOUT_SECS),
                self.client
                    .post(HARDCOVER_GRAPHQL_URL)
                    .bearer_auth(&self.token)
                    .json(&body)
                    .send(),
            )
            .await
            .context("hardcover request timed out")?;

            match resp {
                Ok(r) if r.status().is_success() => {
                    let value: Value = r.json().await.context("decoding hardcover response")?;
                    if let Some(errors) = value.get("errors") {
                        bail!("hardcover graphql errors: {}", errors);
                    }
                    return Ok(value);
                }
                Ok(r) if r.status() == StatusCode::UNAUTHORIZED || r.status() == StatusCode::FORBIDDEN => {
                    bail!("hardcover auth failed: {}", r.status());
                }
                Ok(r) if r.status().is_server_error() || r.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!(status = %r.status(), attempt, "hardcover transient error, retrying");
                }
                Ok(r) => bail!("hardcover request failed: {}", r.status()),
                Err(e) => warn!(error = %e, attempt, "hardcover request error, retrying"),
            }

            if attempt < MAX_RETRIES {
                sleep(Duration::from_millis(backoff)).await;
                backoff *= 2;
            }
        }
        bail!("hardcover request exhausted retries")
    }
}

#[async_trait]
impl HardcoverSink for HardcoverClient {
    async fn get_user_library(&self) -> Result<Vec<LibraryEntry>> {
        let value = self
            .execute(
                "query GetUserLibrary { me { user_books { id book { editions { id asin isbn_10 isbn_13 reading_format { format } } } } } }",
                json!({}),
            )
            .await?;
        let editions = value
            .pointer("/data/me/0/user_books")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for ub in editions {
            let user_book_id = ub.get("id").and_then(|v| v.as_i64());
            let eds = ub
                .pointer("/book/editions")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for ed in eds {
                let Some(edition_id) = ed.get("id").and_then(|v| v.as_i64()) else {
                    continue;
                };
                out.push(LibraryEntry {
                    asin: ed.get("asin").and_then(|v| v.as_str()).map(str::to_string),
                    isbn10: ed.get("isbn_10").and_then(|v| v.as_str()).map(str::to_string),
                    isbn13: ed.get("isbn_13").and_then(|v| v.as_str()).map(str::to_string),
                    edition_id,
                    user_book_id,
                    format: ed
                        .pointer("/reading_format/format")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                });
            }
        }
        Ok(out)
    }

    async fn search_by_asin(&self, asin: &str) -> Result<Option<SearchHit>> {
        let value = self
            .execute(
                "query SearchByAsin($asin: String!) { editions(where: {asin: {_eq: $asin}}, limit: 1) { id book { title contributions { author { name } } } reading_format { format } } }",
                json!({ "asin": asin }),
            )
            .await?;
        Ok(parse_first_edition_hit(&value))
    }

    async fn search_by_isbn(&self, isbn: &str) -> Result<Option<SearchHit>> {
        let value = self
            .execute(
                "query SearchByIsbn($isbn: String!) { editions(where: {_or: [{isbn_10: {_eq: $isbn}}, {isbn_13: {_eq: $isbn}}]}, limit: 1) { id book { title contributions { author { name } } } reading_format { format } } }",
                json!({ "isbn": isbn }),
            )
            .await?;
        Ok(parse_first_edition_hit(&value))
    }

    async fn search_for_matching(&self, title: &str, author: &str) -> Result<Vec<TitleAuthorCandidate>> {
        let value = self
            .execute(
                "query SearchForMatching($title: String!) { editions(where: {book: {title: {_ilike: $title}}}, limit: 10) { id book { title contributions { author { name } } } reading_format { format } } }",
                json!({ "title": format!("%{}%", title) }),
            )
            .await?;
        let _ = author;
        let rows = value
            .pointer("/data/editions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let edition_id = row.get("id").and_then(|v| v.as_i64())?;
                let title = row.pointer("/book/title")?.as_str()?.to_string();
                let author = row
                    .pointer("/book/contributions/0/author/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown Author")
                    .to_string();
                let format = row
                    .pointer("/reading_format/format")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                Some(TitleAuthorCandidate {
                    edition_id,
                    title,
                    author,
                    format,
                })
            })
            .collect())
    }

    async fn add_book_to_library(&self, book_id: i64, edition_id: i64) -> Result<i64> {
        let value = self
            .execute(
                "mutation AddBook($bookId: Int!, $editionId: Int!) { insert_user_book(object: {book_id: $bookId, edition_id: $editionId, status_id: 2}) { id } }",
                json!({ "bookId": book_id, "editionId": edition_id }),
            )
            .await?;
        value
            .pointer("/data/insert_user_book/id")
            .and_then(|v| v.as_i64())
            .context("hardcover add_book_to_library returned no id")
    }

    async fn update_reading_progress(&self, user_book_id: i64, edition_id: i64, payload: ProgressPayload) -> Result<()> {
        self.execute(
            "mutation UpdateProgress($userBookId: Int!, $editionId: Int!, $payload: jsonb!) { update_user_book_read(user_book_id: $userBookId, edition_id: $editionId, payload: $payload) { id } }",
            json!({ "userBookId": user_book_id, "editionId": edition_id, "payload": payload }),
        )
        .await?;
        Ok(())
    }

    async fn mark_read(&self, user_book_id: i64) -> Result<()> {
        self.execute(
            "mutation MarkRead($userBookId: Int!) { update_user_book(id: $userBookId, object: {status_id: 3}) { id } }",
            json!({ "userBookId": user_book_id }),
        )
        .await?;
        Ok(())
    }

    async fn start_new_reading_session(&self, user_book_id: i64, edition_id: i64) -> Result<()> {
        self.execute(
            "mutation StartSession($userBookId: Int!, $editionId: Int!) { insert_user_book_read(object: {user_book_id: $userBookId, edition_id: $editionId}) { id } }",
            json!({ "userBookId": user_book_id, "editionId": edition_id }),
        )
        .await?;
        Ok(())
    }
}

/// Adapts [`HardcoverSink::search_for_matching`] to the matcher's
/// title-only search trait; the matcher scores candidates against the
/// author separately, so the search call itself only needs a title.
pub struct HardcoverSearchAdapter {
    sink: Arc<dyn HardcoverSink>,
}

impl HardcoverSearchAdapter {
    pub fn new(sink: Arc<dyn HardcoverSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl crate::matcher::TitleAuthorSearchSource for HardcoverSearchAdapter {
    async fn search_by_title(&self, title: &str) -> Result<Vec<TitleAuthorCandidate>> {
        self.sink.search_for_matching(title, "").await
    }
}

#[async_trait]
impl crate::matcher::IdSearchSource for HardcoverSearchAdapter {
    async fn search_by_asin(&self, asin: &str) -> Result<Option<crate::matcher::IdSearchHit>> {
        Ok(self.sink.search_by_asin(asin).await?.map(|hit| crate::matcher::IdSearchHit {
            edition_id: hit.edition_id,
            format: hit.format,
        }))
    }

    async fn search_by_isbn(&self, isbn: &str) -> Result<Option<crate::matcher::IdSearchHit>> {
        Ok(self.sink.search_by_isbn(isbn).await?.map(|hit| crate::matcher::IdSearchHit {
            edition_id: hit.edition_id,
            format: hit.format,
        }))
    }
}

fn parse_first_edition_hit(value: &Value) -> Option<SearchHit> {
    let row = value.pointer("/data/editions/0")?;
    let edition_id = row.get("id")?.as_i64()?;
    let title = row.pointer("/book/title")?.as_str()?.to_string();
    let author = row
        .pointer("/book/contributions/0/author/name")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown Author")
        .to_string();
    let format = row
        .pointer("/reading_format/format")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(SearchHit {
        edition_id,
        title,
        author,
        format,
    })
}
