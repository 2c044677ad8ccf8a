//! Identifier lookup index over a user's cached Hardcover library.
//!
//! Built lazily, memoized by a content hash of the library snapshot, and
//! published behind an `ArcSwap` so readers never block on a writer
//! (grounded on the teacher's `arc-swap` usage for lock-free config/state
//! publication throughout `main.rs`).

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct EditionRef {
    pub edition_id: i64,
    pub user_book_id: Option<i64>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    by_asin: HashMap<String, EditionRef>,
    by_isbn: HashMap<String, EditionRef>,
    content_hash: u64,
}

impl Index {
    pub fn lookup_asin(&self, asin: &str) -> Option<&EditionRef> {
        self.by_asin.get(asin)
    }

    pub fn lookup_isbn(&self, isbn: &str) -> Option<&EditionRef> {
        self.by_isbn.get(isbn)
    }
}

/// One row of the user's Hardcover library, as needed to build the index.
#[derive(Debug, Clone)]
pub struct LibraryEntry {
    pub asin: Option<String>,
    pub isbn10: Option<String>,
    pub isbn13: Option<String>,
    pub edition_id: i64,
    pub user_book_id: Option<i64>,
    pub format: Option<String>,
}

fn content_hash(entries: &[LibraryEntry], has_format_mapper: bool) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    entries.len().hash(&mut hasher);
    has_format_mapper.hash(&mut hasher);
    for entry in entries.iter().take(16) {
        entry.asin.hash(&mut hasher);
        entry.isbn13.hash(&mut hasher);
    }
    hasher.finish()
}

/// Lazily-built, hash-memoized identifier index for one user's library.
pub struct IdentifierIndex {
    current: ArcSwap<Index>,
}

impl Default for IdentifierIndex {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(Index::default()),
        }
    }
}

impl IdentifierIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Index> {
        self.current.load_full()
    }

    /// Rebuilds the index if `entries`' content hash differs from what is
    /// currently published; otherwise this is a no-op. Readers that
    /// already hold a snapshot from `snapshot()` are unaffected by a
    /// concurrent rebuild.
    pub fn set_user_library(&self, entries: &[LibraryEntry], has_format_mapper: bool) {
        let hash = content_hash(entries, has_format_mapper);
        if self.current.load().content_hash == hash {
            return;
        }

        let mut by_asin = HashMap::new();
        let mut by_isbn = HashMap::new();
        for entry in entries {
            let edition_ref = EditionRef {
                edition_id: entry.edition_id,
                user_book_id: entry.user_book_id,
                format: entry.format.clone(),
            };
            if let Some(asin) = &entry.asin {
                by_asin.insert(asin.clone(), edition_ref.clone());
            }
            if let Some(isbn10) = &entry.isbn10 {
                by_isbn.insert(isbn10.clone(), edition_ref.clone());
            }
            if let Some(isbn13) = &entry.isbn13 {
                by_isbn.insert(isbn13.clone(), edition_ref.clone());
            }
        }

        self.current.store(Arc::new(Index {
            by_asin,
            by_isbn,
            content_hash: hash,
        }));
    }

    /// Explicit invalidation: forces the next `set_user_library` call to
    /// rebuild even if the content hash happens to match.
    pub fn invalidate(&self) {
        self.current.store(Arc::new(Index::default()));
    }
}
