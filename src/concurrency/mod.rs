pub mod rate_limiter;
pub mod semaphore;

pub use rate_limiter::RateLimiter;
pub use semaphore::{EndpointSemaphore, SharedSemaphore};

/// Logical endpoint keys used by both the rate limiter and the semaphores.
pub const ENDPOINT_HARDCOVER: &str = "hardcover.graphql";
pub const ENDPOINT_AUDIOBOOKSHELF: &str = "audiobookshelf.api";
