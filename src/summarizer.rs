use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/";
/// READMEs shorter than this are not worth summarising.
const MIN_README_CHARS: usize = 50;
const MAX_README_CHARS: usize = 15_000;
const MAX_PREVIEW_MEDIA: usize = 3;

/// Optional README enrichment used by the notifier.
#[async_trait]
pub trait Summarize: Send + Sync {
    /// A short prose summary, or `None` when the README is too short.
    async fn summarize_readme(&self, readme: &str) -> Result<Option<String>>;

    /// Pick the most representative entries of `candidates` for a preview.
    /// Only URLs from `candidates` are ever returned.
    async fn select_preview_media(
        &self,
        readme: &str,
        candidates: &[String],
    ) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct GeminiSummarizer {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for GeminiSummarizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiSummarizer")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiSummarizer {
    pub fn from_config(cfg: &config::Gemini) -> Result<Self> {
        let base_url = Url::parse(GEMINI_API_BASE).context("invalid Gemini base URL")?;
        Self::with_base_url(cfg.api_key.clone(), cfg.model.clone(), base_url)
    }

    pub fn with_base_url(api_key: String, model: String, base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("tg-starbot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build Gemini client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
            model,
        })
    }

    async fn generate(&self, prompt: String) -> Result<String> {
        let endpoint = self
            .base_url
            .join(&format!("v1beta/models/{}:generateContent", self.model))
            .context("invalid Gemini endpoint")?;
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let res = self
            .http
            .post(endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to reach Gemini")?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Gemini request failed");
            return Err(anyhow!("Gemini returned {}: {}", status, text));
        }

        let parsed: GenerateResponse = res.json().await.context("invalid Gemini response")?;
        let text = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(anyhow!("Gemini returned no text"));
        }
        Ok(text.trim().to_string())
    }
}

fn truncate_readme(readme: &str) -> &str {
    match readme.char_indices().nth(MAX_README_CHARS) {
        Some((idx, _)) => &readme[..idx],
        None => readme,
    }
}

/// Parse a JSON array of URLs out of a model reply, tolerating a code fence.
fn parse_media_selection(reply: &str, candidates: &[String]) -> Vec<String> {
    let start = reply.find('[');
    let end = reply.rfind(']');
    let Some((start, end)) = start.zip(end).filter(|(s, e)| s < e) else {
        return Vec::new();
    };
    let urls: Vec<String> = match serde_json::from_str(&reply[start..=end]) {
        Ok(urls) => urls,
        Err(err) => {
            debug!(?err, "unparseable media selection");
            return Vec::new();
        }
    };
    let mut out = Vec::new();
    for url in urls {
        if candidates.contains(&url) && !out.contains(&url) {
            out.push(url);
        }
        if out.len() == MAX_PREVIEW_MEDIA {
            break;
        }
    }
    out
}

#[async_trait]
impl Summarize for GeminiSummarizer {
    async fn summarize_readme(&self, readme: &str) -> Result<Option<String>> {
        if readme.trim().chars().count() < MIN_README_CHARS {
            return Ok(None);
        }
        let prompt = format!(
            "As a senior software developer, analyze the following README.md content. \
             Write a concise, engaging summary in plain English prose of what the project \
             does and its main features. Ignore installation, usage examples, licensing \
             and contribution sections. Reply with the summary only.\n\n---\n{}\n---",
            truncate_readme(readme)
        );
        info!("requesting README summary");
        self.generate(prompt).await.map(Some)
    }

    async fn select_preview_media(
        &self,
        readme: &str,
        candidates: &[String],
    ) -> Result<Vec<String>> {
        if candidates.len() <= 1 {
            return Ok(candidates.to_vec());
        }
        let list = serde_json::to_string(candidates)?;
        let prompt = format!(
            "Below is a README and the media URLs it references. Choose at most {} URLs \
             that best show what the project looks like or does (screenshots, demos). \
             Skip badges, logos and sponsor images. Reply with a JSON array of URLs taken \
             verbatim from the list, or [] if none fit.\n\nURLs: {}\n\n---\n{}\n---",
            MAX_PREVIEW_MEDIA,
            list,
            truncate_readme(readme)
        );
        let reply = self.generate(prompt).await?;
        Ok(parse_media_selection(&reply, candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &mockito::Server) -> GeminiSummarizer {
        GeminiSummarizer::with_base_url(
            "k".into(),
            "gemini-test".into(),
            Url::parse(&server.url()).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn short_readme_is_not_sent() {
        let server = mockito::Server::new_async().await;
        let s = client(&server);
        assert_eq!(s.summarize_readme("tiny").await.unwrap(), None);
    }

    #[tokio::test]
    async fn summary_is_joined_from_parts() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .match_header("x-goog-api-key", "k")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "candidates": [{
                        "content": { "parts": [{ "text": "A fast " }, { "text": "runtime." }] }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let s = client(&server);
        let summary = s.summarize_readme(&"word ".repeat(40)).await.unwrap();
        assert_eq!(summary.as_deref(), Some("A fast runtime."));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn upstream_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .with_status(500)
            .create_async()
            .await;
        let s = client(&server);
        assert!(s.summarize_readme(&"word ".repeat(40)).await.is_err());
    }

    #[test]
    fn media_selection_keeps_known_urls_only() {
        let candidates = vec!["https://a/1.png".to_string(), "https://a/2.gif".to_string()];
        let reply = concat!(
            "```json\n",
            r#"["https://a/2.gif", "https://evil/x.png", "https://a/2.gif"]"#,
            "\n```"
        );
        assert_eq!(
            parse_media_selection(reply, &candidates),
            vec!["https://a/2.gif".to_string()]
        );
        assert!(parse_media_selection("no idea", &candidates).is_empty());
    }
}
