//! Three-tier book matcher: ASIN, then ISBN, then fuzzy title/author.
//!
//! Strategies are a sealed set of variants behind a common trait
//! (design note §9) rather than a class hierarchy: adding a fourth tier
//! means adding a variant, not subclassing. Each tier must not throw
//! across the `find_match` boundary — internal errors are caught,
//! logged, and treated as "no match from this strategy."

pub mod index;

use async_trait::async_trait;
use index::{Index, LibraryEntry};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Asin,
    Isbn,
    TitleAuthor,
}

#[derive(Debug, Clone)]
pub struct MatchContext {
    pub asin: Option<String>,
    pub isbn10: Option<String>,
    pub isbn13: Option<String>,
    pub title: String,
    pub author: String,
}

#[derive(Debug, Clone)]
pub struct UserBookRef {
    pub user_book_id: i64,
}

/// A match outcome. `user_book` is intentionally nullable: ASIN/ISBN
/// exact hits served from the Hardcover *search* endpoint carry no
/// `UserBook` until the title is actually added to the user's library.
/// Callers must not assume it is present.
#[derive(Debug, Clone)]
pub struct Match {
    pub user_book: Option<UserBookRef>,
    pub edition_id: i64,
    pub match_type: MatchType,
    pub tier: u8,
    pub is_search_result: bool,
    pub needs_book_id_lookup: bool,
    pub matching_score: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedMetadata {
    pub title_normalized: String,
    pub author_normalized: String,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub match_: Option<Match>,
    pub extracted_metadata: ExtractedMetadata,
}

/// A title/author search candidate as returned by the Hardcover search
/// adapter (§6.3 `searchBooksForMatching`).
#[derive(Debug, Clone)]
pub struct TitleAuthorCandidate {
    pub edition_id: i64,
    pub title: String,
    pub author: String,
    pub format: Option<String>,
}

/// Abstraction over the Hardcover search call so the matcher can be
/// tested without a network client.
#[async_trait]
pub trait TitleAuthorSearchSource: Send + Sync {
    async fn search_by_title(&self, title: &str) -> anyhow::Result<Vec<TitleAuthorCandidate>>;
}

/// A single exact-identifier hit from Hardcover's search endpoint, as
/// needed by the ASIN/ISBN tiers when the id isn't already in the
/// user's library.
#[derive(Debug, Clone)]
pub struct IdSearchHit {
    pub edition_id: i64,
    pub format: Option<String>,
}

/// Abstraction over Hardcover's ASIN/ISBN search calls (§4.5: an exact
/// id hit outside the user's existing library is a search-result match,
/// not a miss). Tested via fakes the same way as `TitleAuthorSearchSource`.
#[async_trait]
pub trait IdSearchSource: Send + Sync {
    async fn search_by_asin(&self, asin: &str) -> anyhow::Result<Option<IdSearchHit>>;
    async fn search_by_isbn(&self, isbn: &str) -> anyhow::Result<Option<IdSearchHit>>;
}

#[async_trait]
trait MatchTierStrategy: Send + Sync {
    fn tier(&self) -> u8;
    fn name(&self) -> &'static str;
    async fn find_match(&self, ctx: &MatchContext, index: &Index) -> Option<Match>;
}

struct AsinTier {
    search: Arc<dyn IdSearchSource>,
}

#[async_trait]
impl MatchTierStrategy for AsinTier {
    fn tier(&self) -> u8 {
        1
    }
    fn name(&self) -> &'static str {
        "asin"
    }
    async fn find_match(&self, ctx: &MatchContext, index: &Index) -> Option<Match> {
        let asin = ctx.asin.as_deref()?;
        if let Some(edition) = index.lookup_asin(asin) {
            return Some(Match {
                user_book: edition.user_book_id.map(|id| UserBookRef { user_book_id: id }),
                edition_id: edition.edition_id,
                match_type: MatchType::Asin,
                tier: self.tier(),
                is_search_result: false,
                needs_book_id_lookup: false,
                matching_score: None,
            });
        }
        // Not in the user's library snapshot. An exact ASIN hit from
        // Hardcover's own search is still a match, just one that needs
        // a library add before it can be pushed to.
        match self.search.search_by_asin(asin).await {
            Ok(Some(hit)) => Some(Match {
                user_book: None,
                edition_id: hit.edition_id,
                match_type: MatchType::Asin,
                tier: self.tier(),
                is_search_result: true,
                needs_book_id_lookup: true,
                matching_score: None,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "asin search failed, treating as no match");
                None
            }
        }
    }
}

struct IsbnTier {
    search: Arc<dyn IdSearchSource>,
}

#[async_trait]
impl MatchTierStrategy for IsbnTier {
    fn tier(&self) -> u8 {
        2
    }
    fn name(&self) -> &'static str {
        "isbn"
    }
    async fn find_match(&self, ctx: &MatchContext, index: &Index) -> Option<Match> {
        for isbn in [ctx.isbn13.as_deref(), ctx.isbn10.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some(edition) = index.lookup_isbn(isbn) {
                return Some(Match {
                    user_book: edition.user_book_id.map(|id| UserBookRef { user_book_id: id }),
                    edition_id: edition.edition_id,
                    match_type: MatchType::Isbn,
                    tier: self.tier(),
                    is_search_result: false,
                    needs_book_id_lookup: false,
                    matching_score: None,
                });
            }
        }
        for isbn in [ctx.isbn13.as_deref(), ctx.isbn10.as_deref()]
            .into_iter()
            .flatten()
        {
            match self.search.search_by_isbn(isbn).await {
                Ok(Some(hit)) => {
                    return Some(Match {
                        user_book: None,
                        edition_id: hit.edition_id,
                        match_type: MatchType::Isbn,
                        tier: self.tier(),
                        is_search_result: true,
                        needs_book_id_lookup: true,
                        matching_score: None,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "isbn search failed, treating as no match");
                    return None;
                }
            }
        }
        None
    }
}

/// Tier-3 scoring weights. Source does not fix an exact formula (Open
/// Question, §9); these defaults are the implementer's choice and are
/// intentionally configurable.
#[derive(Debug, Clone, Copy)]
pub struct TitleAuthorScoringWeights {
    pub title_weight: f64,
    pub author_weight: f64,
    pub format_weight: f64,
    pub accept_threshold: f64,
}

impl Default for TitleAuthorScoringWeights {
    fn default() -> Self {
        Self {
            title_weight: 0.5,
            author_weight: 0.4,
            format_weight: 0.1,
            accept_threshold: 0.72,
        }
    }
}

struct TitleAuthorTier {
    enabled: bool,
    weights: TitleAuthorScoringWeights,
    search: Arc<dyn TitleAuthorSearchSource>,
}

#[async_trait]
impl MatchTierStrategy for TitleAuthorTier {
    fn tier(&self) -> u8 {
        3
    }
    fn name(&self) -> &'static str {
        "title_author"
    }
    async fn find_match(&self, ctx: &MatchContext, _index: &Index) -> Option<Match> {
        if !self.enabled {
            return None;
        }
        let candidates = match self.search.search_by_title(&ctx.title).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "title/author search failed, treating as no match");
                return None;
            }
        };

        let mut best: Option<(f64, &TitleAuthorCandidate)> = None;
        for candidate in &candidates {
            let score = score_candidate(ctx, candidate, &self.weights);
            if best.map(|(b, _)| score > b).unwrap_or(true) {
                best = Some((score, candidate));
            }
        }

        let (score, candidate) = best?;
        if score < self.weights.accept_threshold {
            debug!(score, "best title/author candidate below acceptance threshold");
            return None;
        }

        Some(Match {
            user_book: None,
            edition_id: candidate.edition_id,
            match_type: MatchType::TitleAuthor,
            tier: self.tier(),
            is_search_result: true,
            needs_book_id_lookup: true,
            matching_score: Some(score),
        })
    }
}

fn score_candidate(
    ctx: &MatchContext,
    candidate: &TitleAuthorCandidate,
    weights: &TitleAuthorScoringWeights,
) -> f64 {
    let title_sim = strsim::normalized_levenshtein(
        &ctx.title.to_lowercase(),
        &candidate.title.to_lowercase(),
    );
    let author_sim = strsim::normalized_levenshtein(
        &ctx.author.to_lowercase(),
        &candidate.author.to_lowercase(),
    );
    let format_fit = if candidate.format.is_some() { 1.0 } else { 0.5 };

    title_sim * weights.title_weight + author_sim * weights.author_weight + format_fit * weights.format_weight
}

pub struct BookMatcher {
    index: index::IdentifierIndex,
    tiers: Vec<Box<dyn MatchTierStrategy>>,
}

impl BookMatcher {
    pub fn new(
        title_author_enabled: bool,
        search_source: Arc<dyn TitleAuthorSearchSource>,
        id_search_source: Arc<dyn IdSearchSource>,
        weights: TitleAuthorScoringWeights,
    ) -> Self {
        Self {
            index: index::IdentifierIndex::new(),
            tiers: vec![
                Box::new(AsinTier {
                    search: id_search_source.clone(),
                }),
                Box::new(IsbnTier {
                    search: id_search_source,
                }),
                Box::new(TitleAuthorTier {
                    enabled: title_author_enabled,
                    weights,
                    search: search_source,
                }),
            ],
        }
    }

    pub fn set_user_library(&self, entries: &[LibraryEntry], has_format_mapper: bool) {
        self.index.set_user_library(entries, has_format_mapper);
    }

    pub fn invalidate_index(&self) {
        self.index.invalidate();
    }

    /// True if `id` (an ASIN or ISBN) already resolves to an edition in
    /// the published library snapshot. Used to decide whether a
    /// below-threshold book should still sync because it is already
    /// part of the user's Hardcover library.
    pub fn has_cached_identifier(&self, id: &str, kind: crate::cache::models::IdentifierType) -> bool {
        use crate::cache::models::IdentifierType;
        let snapshot = self.index.snapshot();
        match kind {
            IdentifierType::Asin => snapshot.lookup_asin(id).is_some(),
            IdentifierType::Isbn => snapshot.lookup_isbn(id).is_some(),
            IdentifierType::TitleAuthor => false,
        }
    }

    /// Tries each tier in order; the first non-`None` result wins. A
    /// tier that errors internally is treated as "no match," not
    /// propagated, so later tiers still run.
    pub async fn find_match(&self, ctx: &MatchContext) -> MatchResult {
        let snapshot = self.index.snapshot();
        let extracted_metadata = ExtractedMetadata {
            title_normalized: ctx.title.trim().to_lowercase(),
            author_normalized: ctx.author.trim().to_lowercase(),
        };

        for tier in &self.tiers {
            let found = tier.find_match(ctx, &snapshot).await;
            if let Some(m) = found {
                debug!(tier = tier.name(), edition_id = m.edition_id, "match found");
                return MatchResult {
                    match_: Some(m),
                    extracted_metadata,
                };
            }
        }

        MatchResult {
            match_: None,
            extracted_metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::LibraryEntry;

    struct FakeSearch(Vec<TitleAuthorCandidate>);

    #[async_trait]
    impl TitleAuthorSearchSource for FakeSearch {
        async fn search_by_title(&self, _title: &str) -> anyhow::Result<Vec<TitleAuthorCandidate>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeIdSearch {
        asin_hit: Option<IdSearchHit>,
        isbn_hit: Option<IdSearchHit>,
    }

    #[async_trait]
    impl IdSearchSource for FakeIdSearch {
        async fn search_by_asin(&self, _asin: &str) -> anyhow::Result<Option<IdSearchHit>> {
            Ok(self.asin_hit.clone())
        }
        async fn search_by_isbn(&self, _isbn: &str) -> anyhow::Result<Option<IdSearchHit>> {
            Ok(self.isbn_hit.clone())
        }
    }

    fn no_id_search() -> Arc<dyn IdSearchSource> {
        Arc::new(FakeIdSearch::default())
    }

    fn ctx(asin: Option<&str>, isbn13: Option<&str>, title: &str, author: &str) -> MatchContext {
        MatchContext {
            asin: asin.map(str::to_string),
            isbn10: None,
            isbn13: isbn13.map(str::to_string),
            title: title.to_string(),
            author: author.to_string(),
        }
    }

    #[tokio::test]
    async fn asin_is_preferred_over_isbn_when_both_present() {
        let matcher = BookMatcher::new(
            true,
            Arc::new(FakeSearch(vec![])),
            no_id_search(),
            TitleAuthorScoringWeights::default(),
        );
        matcher.set_user_library(
            &[
                LibraryEntry {
                    asin: Some("B000ASIN".into()),
                    isbn10: None,
                    isbn13: Some("9781111111111".into()),
                    edition_id: 1,
                    user_book_id: Some(1),
                    format: None,
                },
                LibraryEntry {
                    asin: None,
                    isbn10: None,
                    isbn13: Some("9782222222222".into()),
                    edition_id: 2,
                    user_book_id: Some(2),
                    format: None,
                },
            ],
            false,
        );
        let result = matcher
            .find_match(&ctx(Some("B000ASIN"), Some("9782222222222"), "Book", "Author"))
            .await;
        let m = result.match_.unwrap();
        assert_eq!(m.match_type, MatchType::Asin);
        assert_eq!(m.edition_id, 1);
    }

    #[tokio::test]
    async fn falls_through_to_title_author_when_no_identifier_matches() {
        let candidates = vec![TitleAuthorCandidate {
            edition_id: 99,
            title: "Cleopatra and Frankenstein".into(),
            author: "Coco Mellors".into(),
            format: Some("audiobook".into()),
        }];
        let matcher = BookMatcher::new(
            true,
            Arc::new(FakeSearch(candidates)),
            no_id_search(),
            TitleAuthorScoringWeights::default(),
        );
        let result = matcher
            .find_match(&ctx(None, None, "Cleopatra and Frankenstein", "Coco Mellors"))
            .await;
        let m = result.match_.unwrap();
        assert_eq!(m.match_type, MatchType::TitleAuthor);
        assert!(m.user_book.is_none());
        assert!(m.needs_book_id_lookup);
    }

    #[tokio::test]
    async fn title_author_disabled_never_matches() {
        let candidates = vec![TitleAuthorCandidate {
            edition_id: 99,
            title: "Some Book".into(),
            author: "Some Author".into(),
            format: None,
        }];
        let matcher = BookMatcher::new(
            false,
            Arc::new(FakeSearch(candidates)),
            no_id_search(),
            TitleAuthorScoringWeights::default(),
        );
        let result = matcher.find_match(&ctx(None, None, "Some Book", "Some Author")).await;
        assert!(result.match_.is_none());
    }

    #[tokio::test]
    async fn no_match_anywhere_returns_none() {
        let matcher = BookMatcher::new(
            true,
            Arc::new(FakeSearch(vec![])),
            no_id_search(),
            TitleAuthorScoringWeights::default(),
        );
        let result = matcher.find_match(&ctx(None, None, "Unknown", "Nobody")).await;
        assert!(result.match_.is_none());
    }

    #[tokio::test]
    async fn asin_search_result_is_reachable_when_not_in_library() {
        let id_search = Arc::new(FakeIdSearch {
            asin_hit: Some(IdSearchHit {
                edition_id: 42,
                format: Some("audiobook".into()),
            }),
            isbn_hit: None,
        });
        let matcher = BookMatcher::new(true, Arc::new(FakeSearch(vec![])), id_search, TitleAuthorScoringWeights::default());
        let result = matcher
            .find_match(&ctx(Some("B000NEW"), None, "Unlisted Book", "Unlisted Author"))
            .await;
        let m = result.match_.unwrap();
        assert_eq!(m.match_type, MatchType::Asin);
        assert_eq!(m.edition_id, 42);
        assert!(m.user_book.is_none());
        assert!(m.is_search_result);
        assert!(m.needs_book_id_lookup);
    }

    #[tokio::test]
    async fn isbn_search_result_is_reachable_when_not_in_library() {
        let id_search = Arc::new(FakeIdSearch {
            asin_hit: None,
            isbn_hit: Some(IdSearchHit {
                edition_id: 43,
                format: None,
            }),
        });
        let matcher = BookMatcher::new(true, Arc::new(FakeSearch(vec![])), id_search, TitleAuthorScoringWeights::default());
        let result = matcher
            .find_match(&ctx(None, Some("9783333333333"), "Unlisted Book", "Unlisted Author"))
            .await;
        let m = result.match_.unwrap();
        assert_eq!(m.match_type, MatchType::Isbn);
        assert_eq!(m.edition_id, 43);
        assert!(m.user_book.is_none());
        assert!(m.is_search_result);
    }

    #[tokio::test]
    async fn asin_search_miss_falls_through_to_isbn_then_title_author() {
        let candidates = vec![TitleAuthorCandidate {
            edition_id: 7,
            title: "Some Book".into(),
            author: "Some Author".into(),
            format: None,
        }];
        let matcher = BookMatcher::new(
            true,
            Arc::new(FakeSearch(candidates)),
            no_id_search(),
            TitleAuthorScoringWeights::default(),
        );
        let result = matcher
            .find_match(&ctx(Some("B000GONE"), None, "Some Book", "Some Author"))
            .await;
        let m = result.match_.unwrap();
        assert_eq!(m.match_type, MatchType::TitleAuthor);
    }
}
