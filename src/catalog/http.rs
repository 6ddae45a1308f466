//! HTTP client for a JSON search endpoint.

use crate::catalog::Catalog;
use crate::data::models::MatchCandidate;
use crate::error::CatalogError;
use crate::json::parse_json_with_context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tracing::{debug, trace};

/// Longest error body quoted in a [`CatalogError::Rejected`].
const MAX_ERROR_BODY: usize = 200;

/// Catalog served over HTTP.
///
/// Issues `GET {base_url}/search?q=<name>` and expects a JSON array of
/// candidates.
pub struct HttpCatalog {
    http: reqwest::Client,
    search_url: Url,
}

impl HttpCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("Invalid catalog base URL {base_url:?}: {e}"))?;
        let search_url = Url::parse(&format!("{}/search", base.as_str().trim_end_matches('/')))?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("canonry/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self { http, search_url })
    }

    pub fn search_url(&self) -> &Url {
        &self.search_url
    }
}

/// Map a non-success status to a catalog error.
fn status_error(status: StatusCode, name: &str, body: &str) -> CatalogError {
    match status {
        StatusCode::NOT_FOUND => CatalogError::NotFound(name.to_string()),
        StatusCode::TOO_MANY_REQUESTS => CatalogError::RateLimitExceeded,
        s if s.is_server_error() => CatalogError::Transient(format!("server returned {s}")),
        s => {
            let mut message: String = body.chars().take(MAX_ERROR_BODY).collect();
            if message.len() < body.len() {
                message.push_str("...");
            }
            CatalogError::Rejected {
                status: s.as_u16(),
                message,
            }
        }
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn search(&self, name: &str) -> Result<Vec<MatchCandidate>, CatalogError> {
        trace!(url = %self.search_url, name, "Searching catalog");

        let mut url = self.search_url.clone();
        url.query_pairs_mut().append_pair("q", name);

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CatalogError::Transient(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| CatalogError::Transient(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            debug!(%status, name, "Catalog search failed");
            return Err(status_error(status, name, &body));
        }

        parse_json_with_context::<Vec<MatchCandidate>>(&body)
            .map_err(|e| CatalogError::Decode(e.to_string()))
    }
}
