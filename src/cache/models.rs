//! Row and value types for the book cache. Pure data, no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Isbn,
    Asin,
    TitleAuthor,
}

impl IdentifierType {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierType::Isbn => "isbn",
            IdentifierType::Asin => "asin",
            IdentifierType::TitleAuthor => "title_author",
        }
    }

    /// I3: reject anything outside the closed set.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "isbn" => Some(IdentifierType::Isbn),
            "asin" => Some(IdentifierType::Asin),
            "title_author" => Some(IdentifierType::TitleAuthor),
            _ => None,
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full book record as stored, keyed by `(user_id, identifier, title_normalized)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRecord {
    pub user_id: String,
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub title_normalized: String,
    pub edition_id: Option<i64>,
    pub author: Option<String>,
    pub progress_percent: f64,
    pub last_sync: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_listened_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub session_is_active: bool,
    pub session_pending_progress: Option<f64>,
    pub session_last_change: Option<DateTime<Utc>>,
    pub last_hardcover_sync: Option<DateTime<Utc>>,
}

/// Result of `get_cached_book_info`. Read paths never throw; a miss or
/// internal error both collapse to `exists: false` (fail-open per §4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachedBookInfo {
    pub exists: bool,
    pub edition_id: Option<i64>,
    pub progress_percent: Option<f64>,
    pub author: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_listened_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncTrackingRecord {
    pub sync_count: i64,
    pub total_syncs: i64,
    pub last_deep_scan_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryStatsRecord {
    pub total_books: i64,
    pub matched_books: i64,
    pub completed_books: i64,
    pub captured_at: Option<DateTime<Utc>>,
}

/// A session row needed to replay a pending update, used by both
/// `get_active_sessions`/`get_expired_sessions` and the recovery path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub user_id: String,
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub title_normalized: String,
    pub edition_id: Option<i64>,
    pub session_pending_progress: f64,
    pub session_last_change: DateTime<Utc>,
    /// Hardcover's `user_book_id` for this entry at the time the session
    /// was opened, if the book was already in the user's library. `None`
    /// for a book that was only a search-result match; recovery can't
    /// safely push progress for one of those without redoing the match.
    pub user_book_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_books: i64,
    pub active_sessions: i64,
    pub users: i64,
}

/// Canonical title/author identifier derivation (§3). Pure, deterministic,
/// independent of any running process so the same book produces the same
/// cache key everywhere.
pub fn generate_title_author_identifier(title: &str, author: &str) -> String {
    format!(
        "title_author:{}|{}",
        normalize_for_identifier(title),
        normalize_for_identifier(author)
    )
}

pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

fn normalize_for_identifier(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_space = false;
    for ch in lowered.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push('_');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out
}

/// Legacy title/author identifier shapes tolerated on read but never
/// written by this implementation (open question, §9).
pub fn is_legacy_title_author_identifier(identifier: &str) -> bool {
    if identifier.starts_with("title_author:") {
        return false; // already canonical
    }
    if identifier.starts_with("title_author_") {
        return true;
    }
    // bare "title:author" colon form, distinct from the canonical
    // "title_author:t|a" which always carries the "title_author:" prefix.
    identifier.contains(':') && identifier.matches(':').count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_derivation_is_deterministic_and_normalizes() {
        let a = generate_title_author_identifier("The Hobbit", "J.R.R. Tolkien");
        let b = generate_title_author_identifier("the hobbit  ", "  j.r.r. tolkien");
        assert_eq!(a, b);
        assert_eq!(a, "title_author:the_hobbit|j.r.r._tolkien");
    }

    #[test]
    fn identifier_type_rejects_unknown_values() {
        assert!(IdentifierType::parse("isbn").is_some());
        assert!(IdentifierType::parse("ISBN").is_none());
        assert!(IdentifierType::parse("bogus").is_none());
    }

    #[test]
    fn legacy_identifier_patterns_are_recognized() {
        assert!(is_legacy_title_author_identifier("title_author_42_7"));
        assert!(is_legacy_title_author_identifier("the hobbit:tolkien"));
        assert!(!is_legacy_title_author_identifier(
            "title_author:the_hobbit|tolkien"
        ));
        assert!(!is_legacy_title_author_identifier("9781234567890"));
    }
}
