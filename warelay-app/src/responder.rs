//! Gemini-backed responder with an optional web-grounding step.
//!
//! If a tenant's grounding context contains a URL, the page is fetched,
//! stripped to plain text, truncated, and appended to the prompt. Fetched
//! content is cached per URL with a TTL and a bounded entry count.
//!
//! `answer` upholds the `Responder` contract: it never fails, degrading to
//! fixed Spanish fallback strings on any upstream problem.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use warelay_gateway::dispatch::Responder;

use crate::config::{ResponderConfig, WebCacheConfig};

/// Returned when the model produced no usable candidate.
pub const EMPTY_REPLY_FALLBACK: &str =
    "No pude generar una respuesta. Por favor, inténtalo de nuevo.";
/// Returned when the generation request itself failed.
pub const ERROR_REPLY_FALLBACK: &str =
    "Hubo un error al procesar el mensaje. Por favor, inténtalo de nuevo más tarde.";

// ── Gemini wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

// ── Web-content cache ───────────────────────────────────────────────────────

struct CacheEntry {
    content: String,
    fetched_at: Instant,
}

/// TTL cache of scraped page text, keyed by URL. Bounded: when full, the
/// stalest entry is dropped to make room.
struct WebContentCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl WebContentCache {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn get(&self, url: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(url)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.content.clone())
    }

    fn insert(&self, url: &str, content: String) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.max_entries && !entries.contains_key(url) {
            if let Some(stalest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.fetched_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&stalest);
            }
        }
        entries.insert(
            url.to_string(),
            CacheEntry {
                content,
                fetched_at: Instant::now(),
            },
        );
    }
}

/// Strip HTML tags and collapse whitespace, truncating to `max_chars`.
fn html_to_text(html: &str, max_chars: usize) -> String {
    let tags = Regex::new(r"<[^>]+>").unwrap();
    let stripped = tags.replace_all(html, " ");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

/// First http(s) URL embedded in the grounding context, if any.
fn extract_url(context: &str) -> Option<&str> {
    let pattern = Regex::new(r"https?://\S+").unwrap();
    pattern.find(context).map(|m| m.as_str())
}

// ── Responder ───────────────────────────────────────────────────────────────

pub struct GeminiResponder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    cache: WebContentCache,
    max_content_chars: usize,
}

impl GeminiResponder {
    pub fn new(responder: &ResponderConfig, web_cache: &WebCacheConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(responder.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: responder.api_key.clone(),
            model: responder.model.clone(),
            base_url: responder.base_url.trim_end_matches('/').to_string(),
            cache: WebContentCache::new(
                Duration::from_secs(web_cache.ttl_secs),
                web_cache.max_entries,
            ),
            max_content_chars: web_cache.max_content_chars,
        })
    }

    /// Fetch (or reuse cached) page text for a URL found in the context.
    /// A failed fetch costs nothing but the missing grounding.
    async fn web_content(&self, url: &str) -> Option<String> {
        if let Some(cached) = self.cache.get(url) {
            debug!(%url, "Web grounding served from cache");
            return Some(cached);
        }

        debug!(%url, "Fetching web grounding");
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(%url, error = %e, "Web grounding fetch failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(%url, status = %response.status(), "Web grounding fetch rejected");
            return None;
        }
        let html = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(%url, error = %e, "Web grounding body read failed");
                return None;
            }
        };

        let text = html_to_text(&html, self.max_content_chars);
        let section = format!("\n\nContenido de la web de la tienda ({}):\n{}\n\n", url, text);
        self.cache.insert(url, section.clone());
        Some(section)
    }

    async fn generate(&self, prompt: String) -> anyhow::Result<Option<String>> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.model
        );
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("X-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: GenerateContentResponse = response.json().await?;

        Ok(body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text))
    }
}

#[async_trait]
impl Responder for GeminiResponder {
    async fn answer(&self, message: &str, context: &str) -> String {
        let web = match extract_url(context) {
            Some(url) => self.web_content(url).await.unwrap_or_default(),
            None => String::new(),
        };

        let prompt = format!("Contexto: {}{}\nMensaje: {}", context, web, message);
        match self.generate(prompt).await {
            Ok(Some(text)) if !text.is_empty() => text,
            Ok(_) => EMPTY_REPLY_FALLBACK.to_string(),
            Err(e) => {
                warn!(error = %e, "Generation request failed");
                ERROR_REPLY_FALLBACK.to_string()
            }
        }
    }
}
