pub mod client;
pub mod error;

pub use client::{HttpFetcher, RateLimiter, cached_artifact};
pub use error::RemoteError;
