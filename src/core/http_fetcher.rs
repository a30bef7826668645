//! HTTP range fetcher built on reqwest.

use super::chunked_source::{BlockFetcher, RangeRequest, RangeResponse, ResponseHeaders};
use super::error::{PDFError, PDFResult};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{self, HeaderMap};
use std::time::Duration;

/// Fetches ranges of one URL with HTTP range requests.
pub struct HttpBlockFetcher {
    url: String,
    client: Client,
    extra_headers: HeaderMap,
}

impl HttpBlockFetcher {
    /// Creates a fetcher with a 30 second request timeout.
    pub fn new(url: impl Into<String>) -> PDFResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PDFError::NetworkFailure(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(url, client))
    }

    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
            extra_headers: HeaderMap::new(),
        }
    }

    /// Headers sent with every request (authorization, for instance).
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.extra_headers = headers;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl BlockFetcher for HttpBlockFetcher {
    async fn fetch(&self, request: RangeRequest) -> PDFResult<RangeResponse> {
        let mut builder = self
            .client
            .get(&self.url)
            .headers(self.extra_headers.clone())
            .header(header::RANGE, format!("bytes={}-{}", request.start, request.end));
        if let Some(etag) = &request.if_none_match {
            builder = builder.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(since) = &request.if_modified_since {
            builder = builder.header(header::IF_MODIFIED_SINCE, since);
        }

        let response = builder.send().await.map_err(|e| {
            PDFError::NetworkFailure(format!(
                "Failed to fetch bytes {}-{}: {}",
                request.start, request.end, e
            ))
        })?;

        let status = response.status().as_u16();
        let h = response.headers();
        let headers = ResponseHeaders {
            content_range: header_string(h, header::CONTENT_RANGE),
            etag: header_string(h, header::ETAG),
            last_modified: header_string(h, header::LAST_MODIFIED),
            cache_control: header_string(h, header::CACHE_CONTROL),
            expires: header_string(h, header::EXPIRES),
            date: header_string(h, header::DATE),
        };

        let body = if status == 304 {
            Vec::new()
        } else {
            response
                .bytes()
                .await
                .map_err(|e| PDFError::NetworkFailure(format!("Failed to read response: {}", e)))?
                .to_vec()
        };

        Ok(RangeResponse {
            status,
            headers,
            body,
        })
    }
}
