use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, error, instrument, warn};

use crate::{
    code_generator::{CodeGenerator, ShortCode, code_generator_capsule},
    url_repo::{
        IncrementClicksError, SaveUrlError, UrlRecord, UrlRepository, url_repository_capsule,
    },
};

/// How many candidate codes [`UrlShortenerService::shorten`] tries before giving up.
pub const MAX_GENERATION_ATTEMPTS: u32 = 10;

const DEFAULT_SCHEME: &str = "http://";
const RECOGNIZED_SCHEMES: [&str; 2] = ["http://", "https://"];

#[derive(Deserialize)]
pub struct ShortenUrlPayload {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ShortenedUrl {
    pub short_code: String,
    pub normalized_url: String,
    pub clicks: u64,
}

#[derive(Debug, Serialize)]
pub struct UrlStats {
    pub short_code: String,
    pub normalized_url: String,
    pub clicks: u64,
    /// Timestamp in ISO-8601 format
    pub created_at: String,
}

pub fn url_shortener_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn UrlShortenerService> {
    let url_repo = Arc::clone(get.as_ref(url_repository_capsule));
    let code_generator = Arc::clone(get.as_ref(code_generator_capsule));
    Arc::new(UrlShortenerServiceImpl {
        url_repo,
        code_generator,
    })
}

#[async_trait]
pub trait UrlShortenerService: Send + Sync {
    /// Stores `raw_url` under a newly generated, unique short code.
    async fn shorten(&self, raw_url: &str) -> Result<ShortenedUrl, ShortenError>;

    /// Returns the URL stored under `code`, counting one click on the way.
    async fn resolve(&self, code: &str) -> Result<String, ResolveError>;

    /// Returns what is stored under `code` without counting a click.
    async fn stats(&self, code: &str) -> Result<UrlStats, ResolveError>;
}

#[derive(Debug, Error)]
pub enum ShortenError {
    #[error("URL cannot be empty")]
    InvalidInput,
    #[error("could not generate a unique short code; please try again")]
    GenerationExhausted,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("short code not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

/// Trims `raw_url` and prefixes [`DEFAULT_SCHEME`] unless it already starts
/// with one of the recognized schemes.
///
/// Returns [`None`] for empty or whitespace-only input.
#[must_use]
pub fn normalize_url(raw_url: &str) -> Option<String> {
    let trimmed = raw_url.trim();
    if trimmed.is_empty() {
        return None;
    }

    let has_scheme = RECOGNIZED_SCHEMES.iter().any(|scheme| {
        trimmed
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    });

    Some(if has_scheme {
        trimmed.to_owned()
    } else {
        format!("{DEFAULT_SCHEME}{trimmed}")
    })
}

struct UrlShortenerServiceImpl {
    url_repo: Arc<dyn UrlRepository>,
    code_generator: Arc<dyn CodeGenerator>,
}

#[async_trait]
impl UrlShortenerService for UrlShortenerServiceImpl {
    #[instrument(skip(self))]
    async fn shorten(&self, raw_url: &str) -> Result<ShortenedUrl, ShortenError> {
        let normalized_url = normalize_url(raw_url).ok_or(ShortenError::InvalidInput)?;

        for attempt in 0..MAX_GENERATION_ATTEMPTS {
            // NOTE: every attempt salts the normalized URL, never the raw input
            let code = self.code_generator.generate(&normalized_url, attempt);

            match self.url_repo.save_url(&normalized_url, &code).await {
                Ok(record) => return Ok(record.into()),
                Err(SaveUrlError::CodeTaken) => {
                    warn!(attempt, %code, "Generated short code that was already taken");
                }
                Err(SaveUrlError::StorageUnavailable(err)) => {
                    error!(?err, "Failed to save shortened URL");
                    return Err(ShortenError::StorageUnavailable(err));
                }
            }
        }

        warn!(normalized_url, "Exhausted short code generation attempts");
        Err(ShortenError::GenerationExhausted)
    }

    #[instrument(skip(self))]
    async fn resolve(&self, code: &str) -> Result<String, ResolveError> {
        let record = self.find_record(code).await?;

        // NOTE: click accounting is best-effort; the redirect succeeds regardless
        match self.url_repo.increment_clicks(&record.short_code).await {
            Ok(()) => {}
            Err(IncrementClicksError::NotFound) => {
                warn!(%record.short_code, "URL vanished before its click could be counted");
            }
            Err(IncrementClicksError::StorageUnavailable(err)) => {
                error!(?err, %record.short_code, "Failed to count click");
            }
        }

        Ok(record.original_url)
    }

    #[instrument(skip(self))]
    async fn stats(&self, code: &str) -> Result<UrlStats, ResolveError> {
        let record = self.find_record(code).await?;
        let created_at = record.created_at.format(&Rfc3339).map_err(|err| {
            error!(?err, created_at = ?record.created_at, "Failed to format creation time");
            ResolveError::Internal(
                anyhow::Error::new(err).context("Failed to format creation time"),
            )
        })?;

        Ok(UrlStats {
            short_code: record.short_code.into_inner(),
            normalized_url: record.original_url,
            clicks: record.clicks,
            created_at,
        })
    }
}

impl UrlShortenerServiceImpl {
    async fn find_record(&self, code: &str) -> Result<UrlRecord, ResolveError> {
        let Ok(code) = ShortCode::new(code.to_owned()) else {
            debug!(code, "Requested short code is malformed");
            return Err(ResolveError::NotFound);
        };

        match self.url_repo.retrieve_url(&code).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(ResolveError::NotFound),
            Err(err) => {
                error!(?err, "Failed to retrieve URL");
                Err(ResolveError::StorageUnavailable(err))
            }
        }
    }
}

impl From<UrlRecord> for ShortenedUrl {
    fn from(
        UrlRecord {
            original_url,
            short_code,
            clicks,
            ..
        }: UrlRecord,
    ) -> Self {
        Self {
            short_code: short_code.into_inner(),
            normalized_url: original_url,
            clicks,
        }
    }
}
