//! The sync engine: the eight-step per-book pipeline, race prevention,
//! force-sync, and deep-scan cadence.
//!
//! Grounded on the teacher's `main.rs` orchestration style (per-user
//! work broken into a pipeline of small async steps, each one logging
//! its own outcome) generalized from trade execution to a progress
//! projection pipeline.

use crate::cache::models::IdentifierType;
use crate::cache::BookCache;
use crate::clients::abs::AbsItem;
use crate::clients::hardcover::{HardcoverSink, ProgressPayload};
use crate::config::AppConfig;
use crate::matcher::{BookMatcher, MatchContext, MatchType};
use crate::progress::{
    self, AbsProgressInput, CompletionOptions, RereadThresholds, TransitionVerdict,
};
use crate::session::{DecisionAction, SessionManager};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    Completed,
    AutoAdded,
    Delayed,
    Skipped,
    Error,
}

#[derive(Debug, Clone)]
pub struct BookSyncResult {
    pub identifier: String,
    pub title: String,
    pub status: SyncStatus,
    pub reason: String,
    pub actions: Vec<String>,
}

impl BookSyncResult {
    fn skipped(identifier: &str, title: &str, reason: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            title: title.to_string(),
            status: SyncStatus::Skipped,
            reason: reason.to_string(),
            actions: Vec::new(),
        }
    }

    fn error(identifier: &str, title: &str, reason: String) -> Self {
        Self {
            identifier: identifier.to_string(),
            title: title.to_string(),
            status: SyncStatus::Error,
            reason,
            actions: Vec::new(),
        }
    }
}

/// Extracted, defensive view of an ABS item's identity and progress.
struct BookIdentity {
    asin: Option<String>,
    isbn10: Option<String>,
    isbn13: Option<String>,
    title: String,
    author: String,
}

fn extract_identity(item: &AbsItem) -> BookIdentity {
    let isbn = item.isbn.clone();
    let (isbn10, isbn13) = match isbn {
        Some(raw) if raw.len() == 10 => (Some(raw), None),
        Some(raw) if raw.len() == 13 => (None, Some(raw)),
        Some(raw) => (None, Some(raw)),
        None => (None, None),
    };
    BookIdentity {
        asin: item.asin.clone(),
        isbn10,
        isbn13,
        title: item
            .title
            .clone()
            .unwrap_or_else(|| "Unknown Title".to_string()),
        author: item
            .author
            .clone()
            .unwrap_or_else(|| "Unknown Author".to_string()),
    }
}

fn to_abs_progress_input(item: &AbsItem) -> AbsProgressInput {
    AbsProgressInput {
        progress_percentage: item.progress_percentage,
        is_finished: item.is_finished,
        current_time_secs: item.current_time,
        duration_secs: item.duration,
        current_page: item.current_page,
        total_pages: item.total_pages,
    }
}

/// Candidate cache lookup keys for the early fast-path, in priority order.
fn candidate_keys(identity: &BookIdentity) -> Vec<(String, IdentifierType)> {
    let mut keys = Vec::new();
    if let Some(asin) = &identity.asin {
        keys.push((asin.clone(), IdentifierType::Asin));
    }
    if let Some(isbn) = &identity.isbn13 {
        keys.push((isbn.clone(), IdentifierType::Isbn));
    }
    if let Some(isbn) = &identity.isbn10 {
        keys.push((isbn.clone(), IdentifierType::Isbn));
    }
    keys.push((
        BookCache::generate_title_author_identifier(&identity.title, &identity.author),
        IdentifierType::TitleAuthor,
    ));
    keys
}

pub struct SyncManager {
    cache: Arc<BookCache>,
    matcher: Arc<BookMatcher>,
    session_manager: Arc<SessionManager>,
    hardcover: Arc<dyn HardcoverSink>,
    config: AppConfig,
    completion_options: CompletionOptions,
    reread_thresholds: RereadThresholds,
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl SyncManager {
    pub fn new(
        cache: Arc<BookCache>,
        matcher: Arc<BookMatcher>,
        session_manager: Arc<SessionManager>,
        hardcover: Arc<dyn HardcoverSink>,
        config: AppConfig,
    ) -> Self {
        let reread_thresholds = RereadThresholds {
            high_progress_threshold: config.reread_detection.high_progress_threshold,
            reread_threshold: config.reread_detection.reread_threshold,
            regression_block_threshold: config.reread_detection.regression_block_threshold,
            regression_warn_threshold: config.reread_detection.regression_warn_threshold,
        };
        Self {
            cache,
            matcher,
            session_manager,
            hardcover,
            config,
            completion_options: CompletionOptions::default(),
            reread_thresholds,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Runs the pipeline over every item for one user, honoring deep-scan
    /// cadence bookkeeping around the batch.
    pub async fn sync_user(&self, user_id: &str, items: &[AbsItem]) -> Vec<BookSyncResult> {
        let deep_scan = self
            .cache
            .should_perform_deep_scan(user_id, 7)
            .await;
        if deep_scan {
            if let Ok(library) = self.hardcover.get_user_library().await {
                self.matcher.set_user_library(&library, false);
            }
        }

        // A pool of `workers` processes this user's books; each book still
        // goes through the full pipeline (matching, session decision, HC
        // write) independently. `in_flight` still guards against the same
        // (user, identifier) pair running twice at once.
        let workers = self.config.workers.max(1);
        let results: Vec<BookSyncResult> = stream::iter(items)
            .map(|item| self.sync_single_book(user_id, item))
            .buffer_unordered(workers)
            .collect()
            .await;

        if let Err(e) = self.cache.increment_sync_count(user_id).await {
            warn!(error = %e, user_id, "failed to increment sync count");
        }
        if deep_scan {
            if let Err(e) = self.cache.record_deep_scan(user_id).await {
                warn!(error = %e, user_id, "failed to record deep scan");
            }
        }
        results
    }

    /// Startup recovery: flushes any session left pending past its
    /// timeout (e.g. a process restart mid-session) straight to
    /// Hardcover, then clears the session.
    pub async fn recover_expired_sessions(&self, user_id: &str) {
        let hardcover = self.hardcover.clone();
        self.session_manager
            .process_expired_sessions(&self.cache, user_id, |session| {
                let hardcover = hardcover.clone();
                async move {
                    // A session opened against a search-result match (not
                    // yet in the user's library) carries no user_book_id;
                    // recovering it here would need to redo the match/add
                    // flow, not just replay a write. Leave it for the next
                    // full sync pass instead of guessing an id.
                    let user_book_id = match session.user_book_id {
                        Some(id) => id,
                        None => {
                            warn!(
                                user_id,
                                identifier = %session.identifier,
                                "expired session has no user_book_id, leaving it for the next full sync"
                            );
                            anyhow::bail!("no user_book_id recorded for session");
                        }
                    };
                    // The session row only carries a percentage, not the
                    // duration/page totals needed for a page- or
                    // seconds-based payload; recovery writes progress as a
                    // percentage-of-100 seconds payload until the session
                    // table threads through the original format totals.
                    let payload = ProgressPayload::Seconds {
                        current_seconds: session.session_pending_progress,
                        total_seconds: 100.0,
                    };
                    hardcover
                        .update_reading_progress(user_book_id, session.edition_id.unwrap_or(0), payload)
                        .await
                }
            })
            .await;
    }

    async fn sync_single_book(&self, user_id: &str, item: &AbsItem) -> BookSyncResult {
        let identity = extract_identity(item);
        let title_normalized = crate::cache::models::normalize_title(&identity.title);
        let in_flight_key = (user_id.to_string(), title_normalized.clone());

        {
            let mut guard = self.in_flight.lock();
            if guard.contains(&in_flight_key) {
                return BookSyncResult::skipped(&identity.title, &identity.title, "race_condition_prevented");
            }
            guard.insert(in_flight_key.clone());
        }

        let result = self.run_pipeline(user_id, &identity, item).await;

        self.in_flight.lock().remove(&in_flight_key);
        result
    }

    async fn run_pipeline(&self, user_id: &str, identity: &BookIdentity, item: &AbsItem) -> BookSyncResult {
        // Step 2: progress validation.
        let abs_progress = to_abs_progress_input(item);
        let Some(current_progress) = progress::get_validated_progress(&abs_progress, true) else {
            return BookSyncResult::skipped(&identity.title, &identity.title, "no_progress");
        };

        let keys = candidate_keys(identity);
        let already_in_hc_library = keys
            .iter()
            .any(|(id, kind)| self.matcher.has_cached_identifier(id, *kind));

        if current_progress < self.config.min_progress_threshold && !already_in_hc_library {
            return BookSyncResult::skipped(&identity.title, &identity.title, "below_threshold");
        }

        let is_completed = progress::is_complete(current_progress, &abs_progress, &self.completion_options);

        // Step 3: early fast-path over every candidate key.
        if !self.config.force_sync {
            for (key, kind) in &keys {
                let cached = self
                    .cache
                    .get_cached_book_info(user_id, key, &identity.title, *kind)
                    .await;
                if !cached.exists {
                    continue;
                }
                let changed = self
                    .cache
                    .has_progress_changed(user_id, key, &identity.title, current_progress, *kind)
                    .await;
                let at_completion_without_finish =
                    current_progress >= self.completion_options.threshold && cached.finished_at.is_none();
                if !changed && !at_completion_without_finish {
                    return BookSyncResult::skipped(key, &identity.title, "progress_unchanged");
                }
            }
        }

        // Reread/regression decision uses the best cached previous progress found, if any.
        let mut prev_progress: Option<f64> = None;
        let mut cached_edition_id: Option<i64> = None;
        let mut resolved_identifier_type: Option<IdentifierType> = None;
        let mut resolved_identifier = String::new();
        for (key, kind) in &keys {
            let cached = self
                .cache
                .get_cached_book_info(user_id, key, &identity.title, *kind)
                .await;
            if cached.exists {
                prev_progress = cached.progress_percent;
                cached_edition_id = cached.edition_id;
                resolved_identifier_type = Some(*kind);
                resolved_identifier = key.clone();
                break;
            }
        }

        // Step 4: matching, if no cached edition_id is reusable.
        let mut needs_add = false;
        let mut is_search_result = false;
        let mut user_book_id: Option<i64> = None;
        let edition_id = if let Some(id) = cached_edition_id {
            id
        } else {
            let ctx = MatchContext {
                asin: identity.asin.clone(),
                isbn10: identity.isbn10.clone(),
                isbn13: identity.isbn13.clone(),
                title: identity.title.clone(),
                author: identity.author.clone(),
            };
            let match_result = self.matcher.find_match(&ctx).await;
            match match_result.match_ {
                Some(m) if m.user_book.is_some() || self.config.auto_add_books => {
                    resolved_identifier_type = Some(match_type_to_identifier(m.match_type));
                    resolved_identifier = match identity_for_match_type(m.match_type, identity) {
                        Some(id) => id,
                        None => BookCache::generate_title_author_identifier(&identity.title, &identity.author),
                    };
                    needs_add = m.user_book.is_none();
                    is_search_result = m.is_search_result;
                    user_book_id = m.user_book.map(|u| u.user_book_id);
                    m.edition_id
                }
                // A search-result match with no library entry and
                // auto-add disabled is the same as no match: nothing to
                // write to without creating a library entry.
                Some(_) => return BookSyncResult::skipped(&identity.title, &identity.title, "no_match"),
                // No tier matched. Auto-add only ever fires from a
                // title/author search hit (handled in the `Some(m)` arm
                // above); with no candidate at all there is nothing to add.
                None => return BookSyncResult::skipped(&identity.title, &identity.title, "no_match"),
            }
        };

        let identifier_type = resolved_identifier_type.unwrap_or(IdentifierType::TitleAuthor);
        if resolved_identifier.is_empty() {
            resolved_identifier = BookCache::generate_title_author_identifier(&identity.title, &identity.author);
        }

        // Step 5: reread/regression classification.
        let mut actions = Vec::new();
        if self.config.prevent_progress_regression {
            if let Some(prev) = prev_progress {
                match progress::classify_progress_transition(prev, current_progress, is_completed, &self.reread_thresholds) {
                    TransitionVerdict::Block => {
                        return BookSyncResult::skipped(&resolved_identifier, &identity.title, "regression_blocked");
                    }
                    TransitionVerdict::NewSession => {
                        if let Err(e) = self
                            .hardcover
                            .start_new_reading_session(user_book_id.unwrap_or(0), edition_id)
                            .await
                        {
                            warn!(error = %e, "failed to start new hardcover reading session");
                        }
                        actions.push("started_new_session".to_string());
                    }
                    TransitionVerdict::Warn => {
                        warn!(identifier = %resolved_identifier, prev, current_progress, "progress regression warning");
                        actions.push("regression_warning".to_string());
                    }
                    TransitionVerdict::Ok => {}
                }
            }
        }

        // Step 6: delay decision.
        let last_hc_sync = self
            .cache
            .get_cached_book_info(user_id, &resolved_identifier, &identity.title, identifier_type)
            .await
            .last_sync;
        let decision = self.session_manager.should_delay_update(
            prev_progress,
            current_progress,
            &abs_progress,
            is_completed,
            last_hc_sync,
        );
        if decision.action == DecisionAction::DelayUpdate {
            if let Err(e) = self
                .session_manager
                .update_session(
                    &self.cache,
                    user_id,
                    &resolved_identifier,
                    &identity.title,
                    identifier_type,
                    current_progress,
                    user_book_id,
                )
                .await
            {
                return BookSyncResult::error(&resolved_identifier, &identity.title, e.to_string());
            }
            return BookSyncResult::skipped(&resolved_identifier, &identity.title, "delayed");
        }

        if self.config.dry_run {
            return BookSyncResult {
                identifier: resolved_identifier,
                title: identity.title.clone(),
                status: if is_completed { SyncStatus::Completed } else { SyncStatus::Synced },
                reason: "dry_run".to_string(),
                actions,
            };
        }

        // Step 7: HC write. A search-tier match or a fresh auto-add both
        // arrive with no `user_book_id` yet; `add_book_to_library` creates
        // the library entry and returns the id to write progress against.
        // The adapter's search results key off `edition_id`, not a separate
        // book id, so that id doubles as the `book_id` argument here.
        let user_book_id = match user_book_id {
            Some(id) => id,
            None => {
                match self.hardcover.add_book_to_library(edition_id, edition_id).await {
                    Ok(id) => {
                        needs_add = true;
                        id
                    }
                    Err(e) => {
                        return BookSyncResult::error(&resolved_identifier, &identity.title, e.to_string());
                    }
                }
            }
        };
        if needs_add {
            actions.push("auto_added".to_string());
        }

        let payload = if let Some(pages) = identity_page_payload(item) {
            pages
        } else {
            ProgressPayload::Seconds {
                current_seconds: item.current_time.unwrap_or(0.0),
                total_seconds: item.duration.unwrap_or(0.0),
            }
        };

        if let Err(e) = self
            .hardcover
            .update_reading_progress(user_book_id, edition_id, payload)
            .await
        {
            return BookSyncResult::error(&resolved_identifier, &identity.title, e.to_string());
        }
        if is_completed {
            if let Err(e) = self.hardcover.mark_read(user_book_id).await {
                warn!(error = %e, "hardcover mark_read failed, progress write already committed");
            }
        }

        // If a new Hardcover library entry or edition write was just made
        // (`needs_add`) and the local record of it then fails to commit,
        // the published identifier index would keep pointing at stale
        // state. Compensate by invalidating it so the next library fetch
        // rebuilds from scratch rather than trusting a snapshot the cache
        // no longer agrees with.
        let rollback_matcher = self.matcher.clone();
        let rollbacks: Vec<crate::cache::RollbackFn> = if needs_add {
            vec![Box::new(move || {
                rollback_matcher.invalidate_index();
                Ok(())
            })]
        } else {
            Vec::new()
        };

        let author = Some(identity.author.as_str());
        let persisted = if is_completed {
            self.cache
                .store_book_completion_data(user_id, &resolved_identifier, &identity.title, identifier_type, rollbacks)
                .await
        } else {
            self.cache
                .store_book_sync_data(
                    user_id,
                    &resolved_identifier,
                    &identity.title,
                    identifier_type,
                    edition_id,
                    author,
                    current_progress,
                    None,
                    None,
                    rollbacks,
                )
                .await
        };

        if let Err(e) = persisted {
            return BookSyncResult::error(&resolved_identifier, &identity.title, e.to_string());
        }

        info!(identifier = %resolved_identifier, title = %identity.title, current_progress, is_completed, "book synced");
        actions.push("hardcover_updated".to_string());

        BookSyncResult {
            identifier: resolved_identifier,
            title: identity.title.clone(),
            status: if is_completed {
                SyncStatus::Completed
            } else if needs_add {
                SyncStatus::AutoAdded
            } else {
                SyncStatus::Synced
            },
            reason: if is_search_result {
                "matched_by_search".to_string()
            } else {
                "synced".to_string()
            },
            actions,
        }
    }
}

fn match_type_to_identifier(match_type: MatchType) -> IdentifierType {
    match match_type {
        MatchType::Asin => IdentifierType::Asin,
        MatchType::Isbn => IdentifierType::Isbn,
        MatchType::TitleAuthor => IdentifierType::TitleAuthor,
    }
}

fn identity_for_match_type(match_type: MatchType, identity: &BookIdentity) -> Option<String> {
    match match_type {
        MatchType::Asin => identity.asin.clone(),
        MatchType::Isbn => identity.isbn13.clone().or_else(|| identity.isbn10.clone()),
        MatchType::TitleAuthor => None,
    }
}

fn identity_page_payload(item: &AbsItem) -> Option<ProgressPayload> {
    match (item.current_page, item.total_pages) {
        (Some(current_page), Some(total_pages)) if total_pages > 0.0 => Some(ProgressPayload::Pages {
            current_page,
            total_pages,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::hardcover::SearchHit;
    use crate::clock::SystemClock;
    use crate::matcher::index::LibraryEntry;
    use crate::matcher::{IdSearchHit, IdSearchSource, TitleAuthorCandidate, TitleAuthorScoringWeights, TitleAuthorSearchSource};
    use crate::session::{SessionManager, SessionManagerConfig};
    use async_trait::async_trait;

    struct FakeSearch;

    #[async_trait]
    impl TitleAuthorSearchSource for FakeSearch {
        async fn search_by_title(&self, _title: &str) -> anyhow::Result<Vec<TitleAuthorCandidate>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl IdSearchSource for FakeSearch {
        async fn search_by_asin(&self, _asin: &str) -> anyhow::Result<Option<IdSearchHit>> {
            Ok(None)
        }
        async fn search_by_isbn(&self, _isbn: &str) -> anyhow::Result<Option<IdSearchHit>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct FakeHardcover {
        library: Vec<LibraryEntry>,
    }

    #[async_trait]
    impl HardcoverSink for FakeHardcover {
        async fn get_user_library(&self) -> anyhow::Result<Vec<LibraryEntry>> {
            Ok(self.library.clone())
        }
        async fn search_by_asin(&self, _asin: &str) -> anyhow::Result<Option<SearchHit>> {
            Ok(None)
        }
        async fn search_by_isbn(&self, _isbn: &str) -> anyhow::Result<Option<SearchHit>> {
            Ok(None)
        }
        async fn search_for_matching(&self, _title: &str, _author: &str) -> anyhow::Result<Vec<TitleAuthorCandidate>> {
            Ok(vec![])
        }
        async fn add_book_to_library(&self, book_id: i64, _edition_id: i64) -> anyhow::Result<i64> {
            Ok(book_id)
        }
        async fn update_reading_progress(&self, _user_book_id: i64, _edition_id: i64, _payload: ProgressPayload) -> anyhow::Result<()> {
            Ok(())
        }
        async fn mark_read(&self, _user_book_id: i64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn start_new_reading_session(&self, _user_book_id: i64, _edition_id: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn temp_manager(library: Vec<LibraryEntry>, config: AppConfig) -> (tempfile::TempDir, Arc<SyncManager>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let cache = Arc::new(BookCache::connect(&path).await.unwrap());
        let matcher = Arc::new(BookMatcher::new(
            config.title_author_matching.enabled,
            Arc::new(FakeSearch),
            Arc::new(FakeSearch),
            TitleAuthorScoringWeights::default(),
        ));
        matcher.set_user_library(&library, false);
        let hardcover: Arc<dyn HardcoverSink> = Arc::new(FakeHardcover { library });
        let session_manager = Arc::new(
            SessionManager::new(
                SessionManagerConfig {
                    enabled: config.delayed_updates.enabled,
                    session_timeout_secs: config.delayed_updates.session_timeout,
                    max_delay_secs: config.delayed_updates.max_delay,
                    immediate_completion: config.delayed_updates.immediate_completion,
                },
                Arc::new(SystemClock),
            )
            .unwrap(),
        );
        let manager = Arc::new(SyncManager::new(cache, matcher, session_manager, hardcover, config));
        (dir, manager)
    }

    fn item(asin: &str, title: &str, author: &str, progress: f64) -> AbsItem {
        AbsItem {
            id: "item-1".to_string(),
            title: Some(title.to_string()),
            author: Some(author.to_string()),
            asin: Some(asin.to_string()),
            isbn: None,
            progress_percentage: Some(progress),
            is_finished: false,
            current_time: Some(progress * 10.0),
            duration: Some(1000.0),
            current_page: None,
            total_pages: None,
        }
    }

    fn library_entry(asin: &str, edition_id: i64) -> LibraryEntry {
        LibraryEntry {
            asin: Some(asin.to_string()),
            isbn10: None,
            isbn13: None,
            edition_id,
            user_book_id: Some(edition_id),
            format: None,
        }
    }

    #[tokio::test]
    async fn below_threshold_book_not_in_library_is_skipped() {
        let mut config = AppConfig::default();
        config.min_progress_threshold = 10.0;
        let (_dir, manager) = temp_manager(vec![], config).await;

        let book = item("B000UNKNOWN", "Some Book", "Some Author", 2.0);
        let results = manager.sync_user("u1", &[book]).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, SyncStatus::Skipped);
        assert_eq!(results[0].reason, "below_threshold");
    }

    #[tokio::test]
    async fn below_threshold_book_already_in_library_still_syncs() {
        let mut config = AppConfig::default();
        config.min_progress_threshold = 10.0;
        let library = vec![library_entry("B000KNOWN", 42)];
        let (_dir, manager) = temp_manager(library, config).await;

        let book = item("B000KNOWN", "Known Book", "Known Author", 2.0);
        let results = manager.sync_user("u1", &[book]).await;

        assert_eq!(results.len(), 1);
        assert_ne!(results[0].reason, "below_threshold");
    }

    #[tokio::test]
    async fn p5_concurrent_sync_of_same_book_is_race_prevented() {
        let config = AppConfig::default();
        let library = vec![library_entry("B000RACE", 7)];
        let (_dir, manager) = temp_manager(library, config).await;

        let book_a = item("B000RACE", "Race Book", "Race Author", 40.0);
        let book_b = book_a.clone();

        let m1 = manager.clone();
        let m2 = manager.clone();
        let (r1, r2) = tokio::join!(
            async move { m1.sync_single_book("u1", &book_a).await },
            async move { m2.sync_single_book("u1", &book_b).await },
        );

        let skipped = [&r1, &r2].into_iter().filter(|r| r.reason == "race_condition_prevented").count();
        assert_eq!(skipped, 1, "exactly one of the two concurrent runs must be race-prevented");
    }

    #[tokio::test]
    async fn force_sync_bypasses_step_three_but_not_threshold() {
        let mut config = AppConfig::default();
        config.min_progress_threshold = 50.0;
        config.force_sync = true;
        let (_dir, manager) = temp_manager(vec![], config).await;

        let book = item("B000FORCE", "Force Book", "Force Author", 5.0);
        let results = manager.sync_user("u1", &[book]).await;

        assert_eq!(results[0].status, SyncStatus::Skipped);
        assert_eq!(results[0].reason, "below_threshold");
    }

    #[tokio::test]
    async fn dry_run_does_not_call_hardcover_but_reports_synced() {
        let mut config = AppConfig::default();
        config.dry_run = true;
        let library = vec![library_entry("B000DRY", 9)];
        let (_dir, manager) = temp_manager(library, config).await;

        let book = item("B000DRY", "Dry Book", "Dry Author", 40.0);
        let results = manager.sync_user("u1", &[book]).await;

        assert_eq!(results[0].status, SyncStatus::Synced);
        assert_eq!(results[0].reason, "dry_run");
    }
}
