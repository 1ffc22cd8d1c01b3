//! Network context sources: Google Custom Search and page fetching.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::collaborators::{SearchHit, UrlFetch, WebSearch, FETCH_ERROR_PREFIX};
use crate::context::truncate_with_ellipsis;
use crate::http_client::build_http_client_with_timeout;

const GOOGLE_SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
const GITHUB_RAW_BASE: &str = "https://raw.githubusercontent.com";
const FETCH_TIMEOUT_SECS: u64 = 10;
const SEARCH_TIMEOUT_SECS: u64 = 15;
const BROWSER_USER_AGENT: &str = "Mozilla/5.0";

pub struct GoogleSearch {
    api_key: Option<String>,
    cse_id: Option<String>,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    snippet: Option<String>,
    #[serde(rename = "displayLink")]
    display_link: Option<String>,
}

impl GoogleSearch {
    pub fn new(api_key: Option<String>, cse_id: Option<String>) -> Result<Self> {
        Ok(Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            cse_id: cse_id.filter(|c| !c.trim().is_empty()),
            endpoint: GOOGLE_SEARCH_ENDPOINT.to_string(),
            client: build_http_client_with_timeout(Some(Duration::from_secs(
                SEARCH_TIMEOUT_SECS,
            )))?,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn query(&self, api_key: &str, cse_id: &str, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let num = limit.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("key", api_key), ("cx", cse_id), ("q", query), ("num", num.as_str())])
            .send()
            .await
            .context("Failed to send search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Search API returned error {}: {}", status, body);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;

        Ok(parsed
            .items
            .into_iter()
            .take(limit)
            .map(|item| SearchHit {
                snippet: item
                    .snippet
                    .unwrap_or_else(|| "No snippet available.".to_string()),
                source: item.display_link.unwrap_or_else(|| "N/A".to_string()),
            })
            .collect())
    }
}

#[async_trait]
impl WebSearch for GoogleSearch {
    fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.cse_id.is_some()
    }

    async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let (Some(api_key), Some(cse_id)) = (&self.api_key, &self.cse_id) else {
            return Vec::new();
        };
        match self.query(api_key, cse_id, query, limit).await {
            Ok(hits) => {
                tracing::info!("Web search returned {} result(s)", hits.len());
                hits
            }
            Err(e) => {
                tracing::warn!("Web search failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// Fetches a page and reduces it to readable text.
///
/// GitHub repository links are read through their raw `README.md` first.
pub struct HttpUrlFetch {
    client: reqwest::Client,
    github_raw_base: String,
}

impl HttpUrlFetch {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_http_client_with_timeout(Some(Duration::from_secs(FETCH_TIMEOUT_SECS)))?,
            github_raw_base: GITHUB_RAW_BASE.to_string(),
        })
    }

    pub fn with_github_raw_base(mut self, base: impl Into<String>) -> Self {
        self.github_raw_base = base.into();
        self
    }

    async fn github_readme(&self, owner: &str, repo: &str, max_chars: usize) -> Option<String> {
        let raw_url = format!(
            "{}/{}/{}/main/README.md",
            self.github_raw_base.trim_end_matches('/'),
            owner,
            repo
        );
        let response = self.client.get(&raw_url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let text = response.text().await.ok()?;
        if text.trim().is_empty() {
            return None;
        }
        Some(format!(
            "README.md content from {} repository:\n\n{}",
            repo,
            truncate_with_ellipsis(&text, max_chars)
        ))
    }

    async fn fetch_page(&self, url: &str, max_chars: usize) -> Result<String> {
        if let Some((owner, repo)) = github_repo(url) {
            if let Some(readme) = self.github_readme(&owner, &repo, max_chars).await {
                return Ok(readme);
            }
        }

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await
            .context("request failed")?
            .error_for_status()?;
        let html = response.text().await.context("failed to read body")?;
        Ok(truncate_with_ellipsis(&clean_html(&html), max_chars))
    }
}

#[async_trait]
impl UrlFetch for HttpUrlFetch {
    async fn fetch(&self, url: &str, max_chars: usize) -> String {
        match self.fetch_page(url, max_chars).await {
            Ok(text) => text,
            Err(e) => format!("{} Failed to read page {}: {:#}", FETCH_ERROR_PREFIX, url, e),
        }
    }
}

/// `(owner, repo)` for `http(s)://github.com/<owner>/<repo>...` links.
pub fn github_repo(url: &str) -> Option<(String, String)> {
    let re = regex_lite::Regex::new(r"^https?://github\.com/([^/]+)/([^/]+)").ok()?;
    let caps = re.captures(url)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Drop script/style/noscript blocks and markup, decode common entities and
/// keep only non-blank, trimmed lines.
pub fn clean_html(html: &str) -> String {
    let mut text = html.to_string();
    for pattern in [
        r"(?is)<script\b.*?</script\s*>",
        r"(?is)<style\b.*?</style\s*>",
        r"(?is)<noscript\b.*?</noscript\s*>",
        r"(?s)<!--.*?-->",
    ] {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            text = re.replace_all(&text, "\n").into_owned();
        }
    }
    if let Ok(tags) = regex_lite::Regex::new(r"(?s)<[^>]*>") {
        text = tags.replace_all(&text, "\n").into_owned();
    }

    let decoded = decode_entities(&text);
    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
