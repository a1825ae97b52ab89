//! Extraction interface driven by the worker pool.
//!
//! The worker only ever sees [`Extractor`]; upstream search, crawl and
//! parse clients plug in through the contracts in [`adapters`].

pub mod adapters;
mod error;
pub mod mock;
mod request;

use async_trait::async_trait;

pub use adapters::{
    ContentCrawler, CrawlFailure, Parser, Record, ResultSet, SearchError, SearchHit,
    SearchProvider, StructuredContent, UpstreamExtractor,
};
pub use error::{ExtractError, TransientKind};
pub use mock::ScriptedExtractor;
pub use request::{CrawlOptions, ExtractRequest, Extracted, ExtractionMode, Fingerprint};

/// The external operation a work item performs.
///
/// Implementations must be safe to call concurrently. Timeouts, retries,
/// rate limiting and caching are applied by the caller.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn run(&self, request: &ExtractRequest) -> Result<Extracted, ExtractError>;
}
