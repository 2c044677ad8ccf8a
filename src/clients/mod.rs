//! Consumed-interface adapters for Audiobookshelf and Hardcover.
//!
//! Both clients are exposed behind traits so the sync pipeline can be
//! exercised against fakes in tests without a network client, the same
//! separation the teacher keeps between `scrapers::HashdiveScraper` and
//! the trait it could be mocked behind in `signals`.

pub mod abs;
pub mod hardcover;

pub use abs::{AbsClient, AbsItem, AbsLibrary, AbsSource};
pub use hardcover::{HardcoverClient, HardcoverSearchAdapter, HardcoverSink, ProgressPayload, SearchHit};
