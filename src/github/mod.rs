use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config;
use crate::db::{self, Pool};
use crate::model::split_full_name;

pub mod cache;
pub mod error;
pub mod model;

pub use cache::{cache_key, CacheEntry, ResponseCache};
pub use error::GitHubError;
pub use model::{Languages, RateLimit, Release, Repository, StarEvent, User};

const GITHUB_API_BASE: &str = "https://api.github.com/";
const ACCEPT_JSON: &str = "application/vnd.github.v3+json";
/// Media type that annotates each starred item with `starred_at`.
const ACCEPT_STAR: &str = "application/vnd.github.star+json";

/// Client tuning, usually derived from the `github` config section.
#[derive(Debug, Clone)]
pub struct GitHubOptions {
    pub base_url: Url,
    pub timeout: Duration,
    /// Cached entries younger than this are served without any request.
    pub fast_ttl: Duration,
    /// Added on top of the reset time the API reports when rate limited.
    pub rate_limit_margin: Duration,
}

impl Default for GitHubOptions {
    fn default() -> Self {
        Self {
            base_url: Url::parse(GITHUB_API_BASE).expect("valid default GitHub URL"),
            timeout: Duration::from_secs(30),
            fast_ttl: Duration::from_secs(60),
            rate_limit_margin: Duration::from_secs(2),
        }
    }
}

impl GitHubOptions {
    pub fn from_config(cfg: &config::GitHub) -> Result<Self, GitHubError> {
        let base_url = Url::parse(&cfg.api_base)
            .map_err(|e| GitHubError::InvalidInput(format!("github.api_base: {}", e)))?;
        Ok(Self {
            base_url,
            timeout: Duration::from_secs(cfg.request_timeout_seconds),
            fast_ttl: Duration::from_secs(cfg.fast_cache_ttl_seconds),
            ..Self::default()
        })
    }
}

/// The upstream calls the monitor, the digest and the notifier depend on.
#[async_trait]
pub trait GitHubService: Send + Sync {
    /// Newest page of the authenticated user's stars, newest first. Never cached.
    async fn starred_feed(&self, per_page: u32) -> Result<Vec<StarEvent>, GitHubError>;

    async fn repository(&self, full_name: &str) -> Result<Repository, GitHubError>;

    /// `None` when the repository has no release yet.
    async fn latest_release(&self, full_name: &str) -> Result<Option<Release>, GitHubError>;

    async fn languages(&self, full_name: &str) -> Result<Languages, GitHubError>;

    /// Decoded README text, `None` when the repository has none.
    async fn readme(&self, full_name: &str) -> Result<Option<String>, GitHubError>;
}

#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    base_url: Url,
    pool: Pool,
    cache: Arc<ResponseCache>,
    fast_ttl: Duration,
    rate_limit_margin: Duration,
    shutdown: CancellationToken,
}

impl fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubClient")
            .field("base_url", &self.base_url)
            .field("fast_ttl", &self.fast_ttl)
            .finish_non_exhaustive()
    }
}

enum ApiResponse {
    NotModified,
    Fresh {
        validator: Option<String>,
        body: Value,
    },
}

impl GitHubClient {
    /// The token is read from `pool` on every request, so `/settoken` applies
    /// without a restart.
    pub fn new(
        pool: Pool,
        cache: Arc<ResponseCache>,
        options: GitHubOptions,
    ) -> Result<Self, GitHubError> {
        let http = Client::builder()
            .user_agent(concat!("tg-starbot/", env!("CARGO_PKG_VERSION")))
            .timeout(options.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: options.base_url,
            pool,
            cache,
            fast_ttl: options.fast_ttl,
            rate_limit_margin: options.rate_limit_margin,
            shutdown: CancellationToken::new(),
        })
    }

    /// Lets shutdown interrupt a rate-limit wait.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    async fn token(&self) -> Result<String, GitHubError> {
        let token = db::github_token(&self.pool)
            .await
            .map_err(|e| GitHubError::Network(format!("token lookup failed: {:#}", e)))?;
        token.ok_or_else(|| {
            GitHubError::status(StatusCode::UNAUTHORIZED, "GitHub token not configured")
        })
    }

    async fn send(
        &self,
        path: &str,
        query: &[(&str, String)],
        accept: &str,
        validator: Option<&str>,
    ) -> Result<ApiResponse, GitHubError> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| GitHubError::InvalidInput(format!("{}: {}", path, e)))?;
        let mut rate_limited_once = false;

        loop {
            let token = self.token().await?;
            let mut request = self
                .http
                .get(url.clone())
                .query(query)
                .header(ACCEPT, accept)
                .header(AUTHORIZATION, format!("Bearer {}", token));
            if let Some(v) = validator {
                request = request.header(IF_NONE_MATCH, v);
            }

            let res = request.send().await?;
            let status = res.status();

            if status == StatusCode::NOT_MODIFIED {
                debug!(path, "not modified");
                return Ok(ApiResponse::NotModified);
            }
            if status.is_success() {
                let validator = res
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let body = res.json::<Value>().await?;
                return Ok(ApiResponse::Fresh { validator, body });
            }

            let now = chrono::Utc::now().timestamp();
            if let Some(wait) = rate_limit_wait(status, res.headers(), self.rate_limit_margin, now)
            {
                if rate_limited_once {
                    let body = res.text().await.unwrap_or_default();
                    return Err(GitHubError::status(status, body));
                }
                warn!(path, wait_secs = wait.as_secs(), "rate limited; waiting for reset");
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(GitHubError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
                rate_limited_once = true;
                continue;
            }

            let body = res.text().await.unwrap_or_default();
            warn!(path, status = status.as_u16(), "GitHub API error");
            return Err(GitHubError::status(status, body));
        }
    }

    /// Cached GET. Fresh entries are served directly; older ones are
    /// revalidated with their validator. A 404 evicts the entry.
    #[instrument(skip(self))]
    pub async fn fetch_cached(&self, path: &str) -> Result<Value, GitHubError> {
        let key = cache_key(path, &[]);
        let cached = self.cache.get(&key).await;
        if let Some(entry) = &cached {
            if entry.is_fresh(self.fast_ttl) {
                debug!(key, "serving fresh cache entry");
                return Ok(entry.payload.clone());
            }
        }
        let validator = cached.and_then(|e| e.validator);

        match self.send(path, &[], ACCEPT_JSON, validator.as_deref()).await {
            Ok(ApiResponse::NotModified) => match self.cache.touch(&key).await {
                Some(payload) => Ok(payload),
                // Evicted between lookup and response; fetch it unconditionally.
                None => self.fetch_and_store(&key, path).await,
            },
            Ok(ApiResponse::Fresh { validator, body }) => {
                self.cache.store(&key, validator, body.clone()).await;
                Ok(body)
            }
            Err(err) => {
                if err.is_not_found() && self.cache.evict(&key).await {
                    info!(key, "resource gone; evicted cache entry");
                }
                Err(err)
            }
        }
    }

    async fn fetch_and_store(&self, key: &str, path: &str) -> Result<Value, GitHubError> {
        match self.send(path, &[], ACCEPT_JSON, None).await? {
            ApiResponse::Fresh { validator, body } => {
                self.cache.store(key, validator, body.clone()).await;
                Ok(body)
            }
            ApiResponse::NotModified => Err(GitHubError::Decode(format!(
                "{}: not modified without a validator",
                path
            ))),
        }
    }

    /// Uncached GET for data that drives security or ordering decisions.
    async fn fetch_fresh(
        &self,
        path: &str,
        query: &[(&str, String)],
        accept: &str,
    ) -> Result<Value, GitHubError> {
        match self.send(path, query, accept, None).await? {
            ApiResponse::Fresh { body, .. } => Ok(body),
            ApiResponse::NotModified => Err(GitHubError::Decode(format!(
                "{}: not modified without a validator",
                path
            ))),
        }
    }

    pub async fn get_repository(&self, full_name: &str) -> Result<Repository, GitHubError> {
        let body = self.fetch_cached(&repo_path(full_name, "")?).await?;
        decode(body)
    }

    pub async fn get_repository_languages(
        &self,
        full_name: &str,
    ) -> Result<Languages, GitHubError> {
        let body = self.fetch_cached(&repo_path(full_name, "/languages")?).await?;
        decode(body)
    }

    pub async fn get_latest_release(
        &self,
        full_name: &str,
    ) -> Result<Option<Release>, GitHubError> {
        match self
            .fetch_cached(&repo_path(full_name, "/releases/latest")?)
            .await
        {
            Ok(body) => decode(body).map(Some),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn get_readme(&self, full_name: &str) -> Result<Option<String>, GitHubError> {
        let body = match self.fetch_cached(&repo_path(full_name, "/readme")?).await {
            Ok(body) => body,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let readme: model::Readme = decode(body)?;
        decode_readme(&readme).map(Some)
    }

    /// Identity behind the stored token. Never cached.
    pub async fn get_authenticated_user(&self) -> Result<User, GitHubError> {
        decode(self.fetch_fresh("user", &[], ACCEPT_JSON).await?)
    }

    /// Never cached.
    pub async fn get_rate_limit(&self) -> Result<RateLimit, GitHubError> {
        decode(self.fetch_fresh("rate_limit", &[], ACCEPT_JSON).await?)
    }

    /// One page of the starred feed, newest star first. Never cached.
    #[instrument(skip(self))]
    pub async fn get_starred_page(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<StarEvent>, GitHubError> {
        let query = [
            ("page", page.to_string()),
            ("per_page", per_page.to_string()),
            ("sort", "created".to_string()),
            ("direction", "desc".to_string()),
        ];
        decode(self.fetch_fresh("user/starred", &query, ACCEPT_STAR).await?)
    }
}

#[async_trait]
impl GitHubService for GitHubClient {
    async fn starred_feed(&self, per_page: u32) -> Result<Vec<StarEvent>, GitHubError> {
        self.get_starred_page(1, per_page).await
    }

    async fn repository(&self, full_name: &str) -> Result<Repository, GitHubError> {
        self.get_repository(full_name).await
    }

    async fn latest_release(&self, full_name: &str) -> Result<Option<Release>, GitHubError> {
        self.get_latest_release(full_name).await
    }

    async fn languages(&self, full_name: &str) -> Result<Languages, GitHubError> {
        self.get_repository_languages(full_name).await
    }

    async fn readme(&self, full_name: &str) -> Result<Option<String>, GitHubError> {
        self.get_readme(full_name).await
    }
}

fn repo_path(full_name: &str, suffix: &str) -> Result<String, GitHubError> {
    let (owner, repo) = split_full_name(full_name).ok_or_else(|| {
        GitHubError::InvalidInput(format!("'{}' is not owner/repo", full_name))
    })?;
    Ok(format!("repos/{}/{}{}", owner, repo, suffix))
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, GitHubError> {
    Ok(serde_json::from_value(body)?)
}

fn decode_readme(readme: &model::Readme) -> Result<String, GitHubError> {
    if let Some(enc) = readme.encoding.as_deref() {
        if enc != "base64" {
            return Err(GitHubError::Decode(format!("unsupported readme encoding {}", enc)));
        }
    }
    // The API wraps the base64 payload at 60 columns.
    let compact: String = readme
        .content
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| GitHubError::Decode(format!("readme base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| GitHubError::Decode(format!("readme utf-8: {}", e)))
}

/// How long to back off, if the response is a rate-limit signal: `429`, or
/// `403` with an exhausted quota or a `Retry-After`. Prefers `Retry-After`,
/// then `X-RateLimit-Reset` (unix seconds), then one minute.
fn rate_limit_wait(
    status: StatusCode,
    headers: &HeaderMap,
    margin: Duration,
    now_unix: i64,
) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };
    let retry_after = header("retry-after").and_then(|v| v.parse::<u64>().ok());
    let exhausted = header("x-ratelimit-remaining") == Some("0");
    let limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (exhausted || retry_after.is_some()));
    if !limited {
        return None;
    }

    let secs = retry_after.unwrap_or_else(|| {
        header("x-ratelimit-reset")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|reset| (reset - now_unix).max(0) as u64)
            .unwrap_or(60)
    });
    Some(Duration::from_secs(secs) + margin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn rate_limit_detection() {
        let margin = Duration::from_secs(2);
        let now = 1_000;

        let h = headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1030")]);
        assert_eq!(
            rate_limit_wait(StatusCode::FORBIDDEN, &h, margin, now),
            Some(Duration::from_secs(32))
        );

        // Reset already passed: only the margin remains.
        let h = headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "900")]);
        assert_eq!(
            rate_limit_wait(StatusCode::FORBIDDEN, &h, margin, now),
            Some(margin)
        );

        let h = headers(&[("retry-after", "5")]);
        assert_eq!(
            rate_limit_wait(StatusCode::TOO_MANY_REQUESTS, &h, margin, now),
            Some(Duration::from_secs(7))
        );

        // A plain permission error carries quota headers too, but is not a limit.
        let h = headers(&[("x-ratelimit-remaining", "4999"), ("x-ratelimit-reset", "1030")]);
        assert_eq!(rate_limit_wait(StatusCode::FORBIDDEN, &h, margin, now), None);
        assert_eq!(
            rate_limit_wait(StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new(), margin, now),
            None
        );
    }

    #[test]
    fn readme_decoding_handles_wrapped_base64() {
        let readme = model::Readme {
            content: "SGVsbG8s\nIHdvcmxk\n".into(),
            encoding: Some("base64".into()),
        };
        assert_eq!(decode_readme(&readme).unwrap(), "Hello, world");

        let bad = model::Readme {
            content: "plain".into(),
            encoding: Some("utf-8".into()),
        };
        assert!(matches!(decode_readme(&bad), Err(GitHubError::Decode(_))));
    }

    #[test]
    fn repo_paths_validate_names() {
        assert_eq!(repo_path("a/b", "/readme").unwrap(), "repos/a/b/readme");
        assert!(matches!(
            repo_path("nope", ""),
            Err(GitHubError::InvalidInput(_))
        ));
    }
}
