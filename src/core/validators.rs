//! Freshness metadata of a remote document.
//!
//! A byte-range cache keeps the entity tag, last-modified stamp and
//! cache-control directives of the response that established its file
//! identity. On reopen they decide whether the cached bytes can be trusted,
//! must be revalidated with a conditional request, or must be thrown away.

use chrono::{DateTime, Duration, Utc};

/// `max-age` values are clamped to roughly a century.
const MAX_AGE_CAP_SECS: i64 = 100 * 365 * 24 * 3600;

/// Parsed `Cache-Control` directives relevant to revalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    /// `max-age` in seconds
    pub max_age: Option<u64>,
}

impl CacheControl {
    /// Parses a `Cache-Control` header value. Unknown directives are ignored.
    pub fn parse(value: &str) -> Self {
        let mut cc = CacheControl::default();
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim().to_string(), Some(arg.trim().trim_matches('"').to_string())),
                None => (directive.clone(), None),
            };
            match name.as_str() {
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "must-revalidate" | "proxy-revalidate" => cc.must_revalidate = true,
                "max-age" => cc.max_age = arg.and_then(|a| a.parse().ok()),
                _ => {}
            }
        }
        cc
    }

    /// Formats the directives back into a header value.
    pub fn to_header_value(&self) -> String {
        let mut parts = Vec::new();
        if self.no_cache {
            parts.push("no-cache".to_string());
        }
        if self.no_store {
            parts.push("no-store".to_string());
        }
        if self.must_revalidate {
            parts.push("must-revalidate".to_string());
        }
        if let Some(age) = self.max_age {
            parts.push(format!("max-age={}", age));
        }
        parts.join(", ")
    }
}

/// Validators and expiry of a cached remote resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheValidators {
    pub etag: Option<String>,
    /// Raw `Last-Modified` header, replayed as `If-Modified-Since`
    pub last_modified: Option<String>,
    pub cache_control: CacheControl,
    /// When the response was generated (`Date`, or the local fetch time)
    pub date: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
}

impl CacheValidators {
    /// Builds validators from response headers. `now` stands in for a missing
    /// or unparsable `Date` header.
    pub fn from_headers(
        etag: Option<&str>,
        last_modified: Option<&str>,
        cache_control: Option<&str>,
        expires: Option<&str>,
        date: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            etag: etag.map(str::to_string),
            last_modified: last_modified.map(str::to_string),
            cache_control: cache_control.map(CacheControl::parse).unwrap_or_default(),
            date: Some(date.and_then(parse_http_date).unwrap_or(now)),
            expires: expires.and_then(parse_http_date),
        }
    }

    /// True if a conditional request can be made.
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Instant until which the cached content is fresh, if known.
    pub fn fresh_until(&self) -> Option<DateTime<Utc>> {
        match (self.cache_control.max_age, self.date) {
            (Some(age), Some(date)) => {
                let secs = i64::try_from(age).unwrap_or(i64::MAX).min(MAX_AGE_CAP_SECS);
                date.checked_add_signed(Duration::seconds(secs))
            }
            _ => self.expires,
        }
    }

    /// Decides whether cached content must be revalidated before use.
    ///
    /// `no-cache`/`no-store` always revalidate. Otherwise content is stale
    /// once past `max-age` (or `Expires`). Without any expiry information the
    /// content is trusted unless `must-revalidate` is set.
    pub fn needs_revalidation(&self, now: DateTime<Utc>) -> bool {
        if self.cache_control.no_cache || self.cache_control.no_store {
            return true;
        }
        match self.fresh_until() {
            Some(until) => now >= until,
            None => self.cache_control.must_revalidate,
        }
    }

    /// Applies the headers of a `304 Not Modified` answer.
    pub fn refresh(
        &mut self,
        cache_control: Option<&str>,
        expires: Option<&str>,
        date: Option<&str>,
        now: DateTime<Utc>,
    ) {
        if let Some(cc) = cache_control {
            self.cache_control = CacheControl::parse(cc);
        }
        if let Some(exp) = expires.and_then(parse_http_date) {
            self.expires = Some(exp);
        }
        self.date = Some(date.and_then(parse_http_date).unwrap_or(now));
    }

    /// Serializes to the compact blob stored in a cache file header.
    pub fn to_blob(&self) -> String {
        let mut blob = String::new();
        if let Some(etag) = &self.etag {
            blob.push_str(&format!("etag={}\n", etag));
        }
        if let Some(lm) = &self.last_modified {
            blob.push_str(&format!("last-modified={}\n", lm));
        }
        let cc = self.cache_control.to_header_value();
        if !cc.is_empty() {
            blob.push_str(&format!("cache-control={}\n", cc));
        }
        if let Some(date) = self.date {
            blob.push_str(&format!("date={}\n", date.to_rfc3339()));
        }
        if let Some(expires) = self.expires {
            blob.push_str(&format!("expires={}\n", expires.to_rfc3339()));
        }
        blob
    }

    /// Parses a blob written by [`to_blob`](Self::to_blob). Malformed lines are
    /// skipped.
    pub fn from_blob(blob: &str) -> Self {
        let mut validators = CacheValidators::default();
        for line in blob.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "etag" => validators.etag = Some(value.to_string()),
                "last-modified" => validators.last_modified = Some(value.to_string()),
                "cache-control" => validators.cache_control = CacheControl::parse(value),
                "date" => validators.date = parse_rfc3339(value),
                "expires" => validators.expires = parse_rfc3339(value),
                _ => {}
            }
        }
        validators
    }
}

/// Parses an HTTP date (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Formats an HTTP date for request headers.
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
