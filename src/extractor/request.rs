//! Extraction requests and their cache fingerprints.
//!
//! A fingerprint is a pure function of the normalized request parameters:
//! names and queries are NFKC-normalized, case-folded and whitespace
//! collapsed, URLs are parsed and re-serialized, so semantically identical
//! requests always map to the same key.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use url::Url;

use super::error::ExtractError;

/// Longest accepted company name or search query, in characters.
const MAX_TEXT_CHARS: usize = 512;

/// Field separator inside the fingerprint preimage.
const SEP: u8 = 0x1f;

/// How much work a company lookup performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Return the best search hit.
    #[default]
    Basic,
    /// Crawl the best hit and parse it into a record.
    Full,
}

impl ExtractionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Full => "full",
        }
    }
}

/// Options forwarded to the content crawler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOptions {
    pub max_depth: u32,
    pub render_js: bool,
    pub include_links: bool,
}

/// Opaque request parameters carried by a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractRequest {
    CompanyLookup {
        name: String,
        #[serde(default)]
        locale: Option<String>,
        #[serde(default)]
        mode: ExtractionMode,
    },
    SearchPage {
        query: String,
        #[serde(default = "default_locale")]
        locale: String,
        #[serde(default = "first_page")]
        page: u32,
    },
    Crawl {
        url: String,
        #[serde(default)]
        options: CrawlOptions,
    },
}

fn default_locale() -> String {
    "en-us".to_string()
}

fn first_page() -> u32 {
    1
}

impl ExtractRequest {
    pub fn company(name: impl Into<String>, mode: ExtractionMode) -> Self {
        Self::CompanyLookup { name: name.into(), locale: None, mode }
    }

    pub fn search(query: impl Into<String>, locale: impl Into<String>, page: u32) -> Self {
        Self::SearchPage { query: query.into(), locale: locale.into(), page }
    }

    pub fn crawl(url: impl Into<String>) -> Self {
        Self::Crawl { url: url.into(), options: CrawlOptions::default() }
    }

    /// Short request kind, used for spans and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CompanyLookup { .. } => "company_lookup",
            Self::SearchPage { .. } => "search_page",
            Self::Crawl { .. } => "crawl",
        }
    }

    /// Human-readable subject of the request (name, query or URL).
    pub fn subject(&self) -> &str {
        match self {
            Self::CompanyLookup { name, .. } => name,
            Self::SearchPage { query, .. } => query,
            Self::Crawl { url, .. } => url,
        }
    }

    /// Reject malformed requests before they are scheduled.
    pub fn validate(&self) -> Result<(), ExtractError> {
        match self {
            Self::CompanyLookup { name, .. } => validate_text("company name", name),
            Self::SearchPage { query, page, .. } => {
                validate_text("search query", query)?;
                if *page == 0 {
                    return Err(ExtractError::validation("search pages start at 1"));
                }
                Ok(())
            }
            Self::Crawl { url, .. } => validate_url(url),
        }
    }

    /// Deterministic cache key for this request.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().as_bytes());
        match self {
            Self::CompanyLookup { name, locale, mode } => {
                field(&mut hasher, &normalize_text(name));
                field(&mut hasher, &locale.as_deref().map(normalize_locale).unwrap_or_default());
                field(&mut hasher, mode.as_str());
            }
            Self::SearchPage { query, locale, page } => {
                field(&mut hasher, &normalize_text(query));
                field(&mut hasher, &normalize_locale(locale));
                field(&mut hasher, &page.to_string());
            }
            Self::Crawl { url, options } => {
                field(&mut hasher, &normalize_url(url));
                field(&mut hasher, &options.max_depth.to_string());
                field(&mut hasher, if options.render_js { "js" } else { "static" });
                field(&mut hasher, if options.include_links { "links" } else { "nolinks" });
            }
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

fn field(hasher: &mut Sha256, value: &str) {
    hasher.update([SEP]);
    hasher.update(value.as_bytes());
}

fn validate_text(what: &str, value: &str) -> Result<(), ExtractError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::validation(format!("{what} is empty")));
    }
    let chars = trimmed.chars().count();
    if chars > MAX_TEXT_CHARS {
        return Err(ExtractError::validation(format!(
            "{what} is {chars} characters (max {MAX_TEXT_CHARS})"
        )));
    }
    Ok(())
}

fn validate_url(raw: &str) -> Result<(), ExtractError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ExtractError::validation(format!("invalid crawl URL {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ExtractError::validation(format!("unsupported URL scheme: {other}")));
        }
    }
    if url.host_str().is_none() {
        return Err(ExtractError::validation(format!("crawl URL has no host: {raw}")));
    }
    Ok(())
}

/// NFKC, lower-case, single spaces.
pub(crate) fn normalize_text(value: &str) -> String {
    let folded: String = value.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_locale(locale: &str) -> String {
    locale.trim().to_ascii_lowercase().replace('_', "-")
}

fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return normalize_text(raw);
    };
    url.set_fragment(None);
    let mut out = url.to_string();
    if url.path().len() > 1 && url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Hex-encoded SHA-256 of a normalized request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Successful extraction output. Cached and shared between callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extracted {
    pub data: serde_json::Value,
    /// Parser confidence in `[0, 1]`, when a parser produced the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Extracted {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data, confidence: None }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}
