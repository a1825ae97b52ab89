//! Upstream collaborator contracts and the extractor that composes them.
//!
//! Concrete search and crawl clients live outside this crate; they only
//! need to implement [`SearchProvider`], [`ContentCrawler`] and [`Parser`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::ExtractError;
use super::request::{CrawlOptions, ExtractRequest, Extracted, ExtractionMode};
use super::Extractor;

/// Parsed record produced by a [`Parser`].
pub type Record = serde_json::Map<String, serde_json::Value>;

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub query: String,
    pub locale: String,
    pub page: u32,
    pub hits: Vec<SearchHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Crawled page content handed to the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredContent {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("search provider rate limited the request")]
    RateLimited,
    #[error("search request timed out")]
    Timeout,
    #[error("search provider error: {0}")]
    Transient(String),
    #[error("no results for {0:?}")]
    NotFound(String),
    #[error("search provider rejected the query: {0}")]
    Rejected(String),
}

impl From<SearchError> for ExtractError {
    fn from(err: SearchError) -> Self {
        let message = err.to_string();
        match err {
            SearchError::RateLimited => ExtractError::rate_limited(message),
            SearchError::Timeout => ExtractError::timeout(message),
            SearchError::Transient(_) => ExtractError::network(message),
            SearchError::NotFound(_) | SearchError::Rejected(_) => ExtractError::permanent(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("crawl of {url} failed: {message}")]
pub struct CrawlFailure {
    pub url: String,
    /// HTTP status of the failed fetch, if the server answered.
    pub status: Option<u16>,
    pub message: String,
}

impl CrawlFailure {
    /// Client errors other than 408 and 429 will not go away on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self.status, Some(s) if (400..500).contains(&s) && s != 408 && s != 429)
    }
}

impl From<CrawlFailure> for ExtractError {
    fn from(err: CrawlFailure) -> Self {
        let message = err.to_string();
        match err.status {
            _ if err.is_permanent() => ExtractError::permanent(message),
            Some(429) => ExtractError::rate_limited(message),
            Some(408) => ExtractError::timeout(message),
            _ => ExtractError::network(message),
        }
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, locale: &str, page: u32) -> Result<ResultSet, SearchError>;
}

#[async_trait]
pub trait ContentCrawler: Send + Sync {
    async fn crawl(&self, url: &str, options: &CrawlOptions) -> Result<StructuredContent, CrawlFailure>;
}

/// Pure, synchronous content parser.
pub trait Parser: Send + Sync {
    /// Returns the parsed record and a confidence in `[0, 1]`.
    fn parse(&self, content: &StructuredContent) -> (Record, f64);
}

/// Extractor backed by a search provider, a crawler and a parser.
pub struct UpstreamExtractor<S, C, P> {
    search: S,
    crawler: C,
    parser: P,
    default_locale: String,
}

impl<S, C, P> UpstreamExtractor<S, C, P>
where
    S: SearchProvider,
    C: ContentCrawler,
    P: Parser,
{
    pub fn new(search: S, crawler: C, parser: P) -> Self {
        Self { search, crawler, parser, default_locale: "en-us".to_string() }
    }

    /// Locale used for company lookups that do not name one.
    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = locale.into();
        self
    }

    async fn crawl_and_parse(&self, url: &str, options: &CrawlOptions) -> Result<Extracted, ExtractError> {
        let content = self.crawler.crawl(url, options).await?;
        let (record, confidence) = self.parser.parse(&content);
        Ok(Extracted::new(serde_json::Value::Object(record)).with_confidence(confidence))
    }

    async fn lookup_company(
        &self,
        name: &str,
        locale: Option<&str>,
        mode: ExtractionMode,
    ) -> Result<Extracted, ExtractError> {
        let locale = locale.unwrap_or(&self.default_locale);
        let results = self.search.search(name, locale, 1).await?;
        let Some(top) = results.hits.into_iter().next() else {
            return Err(ExtractError::permanent(format!("no match for company {name:?}")));
        };
        match mode {
            ExtractionMode::Basic => Ok(Extracted::new(to_json(&top)?)),
            ExtractionMode::Full => self.crawl_and_parse(&top.url, &CrawlOptions::default()).await,
        }
    }
}

#[async_trait]
impl<S, C, P> Extractor for UpstreamExtractor<S, C, P>
where
    S: SearchProvider,
    C: ContentCrawler,
    P: Parser,
{
    async fn run(&self, request: &ExtractRequest) -> Result<Extracted, ExtractError> {
        match request {
            ExtractRequest::SearchPage { query, locale, page } => {
                let results = self.search.search(query, locale, *page).await?;
                Ok(Extracted::new(to_json(&results)?))
            }
            ExtractRequest::Crawl { url, options } => self.crawl_and_parse(url, options).await,
            ExtractRequest::CompanyLookup { name, locale, mode } => {
                self.lookup_company(name, locale.as_deref(), *mode).await
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, ExtractError> {
    serde_json::to_value(value)
        .map_err(|e| ExtractError::permanent(format!("result is not serializable: {e}")))
}
