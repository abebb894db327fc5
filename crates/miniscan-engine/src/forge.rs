//! Thread-safe client for the code-hosting API, with a rotating token pool
//! and rate-limit cooldowns.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, header};
use serde::Deserialize;
use tracing::warn;
use url::Url;

pub const DEFAULT_FORGE_BASE: &str = "https://api.github.com";

const MAX_ATTEMPTS: usize = 3;
const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_PATCH: &str = "application/vnd.github.v3.patch";

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("no forge tokens configured")]
    NoTokens,
    #[error("all forge tokens are rate limited until {until} UTC")]
    AllTokensRateLimited { until: DateTime<Utc> },
    #[error("forge api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("forge request to {0} failed after retries")]
    Exhausted(String),
    #[error("forge transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid forge url: {0}")]
    Url(String),
}

struct PoolState {
    /// Epoch seconds until which each token is cooling down.
    cooldowns: Vec<i64>,
    cursor: usize,
}

/// Rotating credential pool. `acquire` hands out the next token whose
/// cooldown has expired; rate-limited tokens cool down until the epoch the
/// server reported.
pub struct TokenPool {
    tokens: Vec<String>,
    state: Mutex<PoolState>,
}

impl TokenPool {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        let tokens: Vec<String> = tokens
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let cooldowns = vec![0i64; tokens.len()];
        Self { tokens, state: Mutex::new(PoolState { cooldowns, cursor: 0 }) }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn acquire(&self) -> Result<String, ForgeError> {
        if self.tokens.is_empty() {
            return Err(ForgeError::NoTokens);
        }
        let now = Utc::now().timestamp();
        let mut state = self.lock();
        for _ in 0..self.tokens.len() {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % self.tokens.len();
            if state.cooldowns[idx] <= now {
                return Ok(self.tokens[idx].clone());
            }
        }
        let earliest = state.cooldowns.iter().copied().min().unwrap_or(now);
        Err(ForgeError::AllTokensRateLimited { until: epoch_to_utc(earliest) })
    }

    pub fn mark_rate_limited(&self, token: &str, reset_epoch: Option<i64>) {
        let Some(idx) = self.tokens.iter().position(|t| t == token) else {
            return;
        };
        let now = Utc::now().timestamp();
        let cooldown = reset_epoch.unwrap_or(now + 60).max(now + 1);
        self.lock().cooldowns[idx] = cooldown;
        warn!("forge token exhausted, cooling down until {} UTC", epoch_to_utc(cooldown));
    }

    pub fn next_available_at(&self) -> DateTime<Utc> {
        let state = self.lock();
        let earliest = state.cooldowns.iter().copied().min().unwrap_or(0);
        epoch_to_utc(earliest.max(Utc::now().timestamp()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn epoch_to_utc(epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch, 0).unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRef {
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitBody {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitInfo {
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub parents: Vec<CommitRef>,
    #[serde(default)]
    pub commit: CommitBody,
}

pub struct ForgeClient {
    http: reqwest::Client,
    base: Url,
    pool: TokenPool,
}

impl ForgeClient {
    pub fn new(tokens: Vec<String>) -> Result<Self, ForgeError> {
        Self::with_base(DEFAULT_FORGE_BASE, tokens)
    }

    pub fn with_base(base: &str, tokens: Vec<String>) -> Result<Self, ForgeError> {
        let base = Url::parse(base).map_err(|e| ForgeError::Url(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("miniscan")
            .build()?;
        Ok(Self { http, base, pool: TokenPool::new(tokens) })
    }

    pub fn token_pool(&self) -> &TokenPool {
        &self.pool
    }

    /// Commit metadata: SHA, parents, message.
    pub async fn get_commit(&self, repo_slug: &str, sha: &str) -> Result<CommitInfo, ForgeError> {
        let res = self.get(self.commit_url(repo_slug, sha)?, ACCEPT_JSON).await?;
        if res.status() != StatusCode::OK {
            return Err(api_error(res).await);
        }
        Ok(res.json().await?)
    }

    /// The commit rendered as a patch, suitable for `git apply`.
    pub async fn get_commit_patch(&self, repo_slug: &str, sha: &str) -> Result<String, ForgeError> {
        let res = self.get(self.commit_url(repo_slug, sha)?, ACCEPT_PATCH).await?;
        if res.status() != StatusCode::OK {
            return Err(api_error(res).await);
        }
        Ok(res.text().await?)
    }

    /// Each slug segment is percent-encoded individually so the `/` between
    /// owner and repo survives.
    fn commit_url(&self, repo_slug: &str, sha: &str) -> Result<Url, ForgeError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ForgeError::Url(self.base.to_string()))?;
            segments.push("repos");
            for part in repo_slug.split('/') {
                segments.push(part);
            }
            segments.push("commits");
            segments.push(sha);
        }
        Ok(url)
    }

    async fn get(&self, url: Url, accept: &str) -> Result<reqwest::Response, ForgeError> {
        for _ in 0..MAX_ATTEMPTS {
            let token = self.pool.acquire()?;
            let res = self
                .http
                .get(url.clone())
                .header(header::ACCEPT, accept)
                .header(header::AUTHORIZATION, format!("token {token}"))
                .send()
                .await;
            let res = match res {
                Ok(res) => res,
                Err(err) => {
                    warn!("forge request to {url} failed, retrying: {err}");
                    continue;
                }
            };

            if res.status() == StatusCode::FORBIDDEN && remaining_quota(&res) == Some(0) {
                self.pool.mark_rate_limited(&token, header_i64(&res, "x-ratelimit-reset"));
                continue;
            }
            return Ok(res);
        }
        Err(ForgeError::Exhausted(url.to_string()))
    }
}

fn remaining_quota(res: &reqwest::Response) -> Option<i64> {
    header_i64(res, "x-ratelimit-remaining")
}

fn header_i64(res: &reqwest::Response, name: &str) -> Option<i64> {
    res.headers().get(name)?.to_str().ok()?.trim().parse().ok()
}

async fn api_error(res: reqwest::Response) -> ForgeError {
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    ForgeError::Api { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_refuses() {
        let pool = TokenPool::new(vec!["".to_string(), "  ".to_string()]);
        assert!(pool.is_empty());
        assert!(matches!(pool.acquire(), Err(ForgeError::NoTokens)));
    }

    #[test]
    fn acquire_rotates_round_robin() {
        let pool = TokenPool::new(vec!["one".to_string(), "two".to_string()]);
        assert_eq!(pool.acquire().unwrap(), "one");
        assert_eq!(pool.acquire().unwrap(), "two");
        assert_eq!(pool.acquire().unwrap(), "one");
    }

    #[test]
    fn cooling_tokens_are_skipped() {
        let pool = TokenPool::new(vec!["one".to_string(), "two".to_string()]);
        let far = Utc::now().timestamp() + 3600;
        pool.mark_rate_limited("one", Some(far));
        assert_eq!(pool.acquire().unwrap(), "two");
        assert_eq!(pool.acquire().unwrap(), "two");
    }

    #[test]
    fn all_cooling_reports_earliest_reset() {
        let pool = TokenPool::new(vec!["one".to_string(), "two".to_string()]);
        let now = Utc::now().timestamp();
        pool.mark_rate_limited("one", Some(now + 3600));
        pool.mark_rate_limited("two", Some(now + 120));
        match pool.acquire() {
            Err(ForgeError::AllTokensRateLimited { until }) => {
                assert_eq!(until.timestamp(), now + 120);
            }
            other => panic!("expected AllTokensRateLimited, got {other:?}"),
        }
    }

    #[test]
    fn missing_reset_defaults_to_a_minute() {
        let pool = TokenPool::new(vec!["one".to_string()]);
        let before = Utc::now().timestamp();
        pool.mark_rate_limited("one", None);
        match pool.acquire() {
            Err(ForgeError::AllTokensRateLimited { until }) => {
                assert!(until.timestamp() >= before + 60);
                assert!(until.timestamp() <= before + 62);
            }
            other => panic!("expected AllTokensRateLimited, got {other:?}"),
        }
    }

    #[test]
    fn slug_segments_are_encoded_but_slash_survives() {
        let client = ForgeClient::new(vec!["t".to_string()]).unwrap();
        let url = client.commit_url("acme/wid get", "abc123").unwrap();
        assert_eq!(url.path(), "/repos/acme/wid%20get/commits/abc123");
    }
}
