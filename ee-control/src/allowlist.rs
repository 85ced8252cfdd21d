//! Fetching and caching release allowlists.
//!
//! Allowlists are immutable per release, so a short TTL cache keeps
//! re-attestation cheap without a staleness story. Fetch failures are never
//! negatively cached; the next attestation round simply retries.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use ee_api::allowlist::Allowlist;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct AllowlistFetchError(pub String);

pub struct AllowlistStore {
    http: reqwest::Client,
    asset_name: String,
    github_token: Option<String>,
    ttl: Duration,
    cache: Mutex<HashMap<(String, String), (Instant, Allowlist)>>,
}

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

impl AllowlistStore {
    pub fn new(
        http: reqwest::Client,
        asset_name: impl Into<String>,
        github_token: Option<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            http,
            asset_name: asset_name.into(),
            github_token,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached allowlist for `(repo, release_tag)`, fetching on miss/expiry.
    pub async fn get(
        &self,
        repo: &str,
        release_tag: &str,
    ) -> Result<Allowlist, AllowlistFetchError> {
        let key = (repo.to_owned(), release_tag.to_owned());
        {
            let cache = self.cache.lock().expect("allowlist cache poisoned");
            if let Some((fetched_at, allowlist)) = cache.get(&key) {
                if fetched_at.elapsed() <= self.ttl {
                    return Ok(allowlist.clone());
                }
            }
        }

        let allowlist = self.fetch(repo, release_tag).await?;
        self.put(repo, release_tag, allowlist.clone());
        Ok(allowlist)
    }

    /// Insert an allowlist directly (tests, pre-seeding).
    pub fn put(&self, repo: &str, release_tag: &str, allowlist: Allowlist) {
        self.cache
            .lock()
            .expect("allowlist cache poisoned")
            .insert(
                (repo.to_owned(), release_tag.to_owned()),
                (Instant::now(), allowlist),
            );
    }

    async fn fetch(
        &self,
        repo: &str,
        release_tag: &str,
    ) -> Result<Allowlist, AllowlistFetchError> {
        let release_url =
            format!("https://api.github.com/repos/{repo}/releases/tags/{release_tag}");
        debug!(%release_url, "fetching release metadata");
        let release: Release = self
            .request(&release_url)
            .await?
            .json()
            .await
            .map_err(|e| AllowlistFetchError(format!("bad release metadata: {e}")))?;

        let asset_url = release
            .assets
            .iter()
            .find(|asset| asset.name == self.asset_name)
            .map(|asset| asset.browser_download_url.clone())
            .ok_or_else(|| {
                AllowlistFetchError(format!("allowlist asset not found: {}", self.asset_name))
            })?;

        let allowlist: Allowlist = self
            .request(&asset_url)
            .await?
            .json()
            .await
            .map_err(|e| AllowlistFetchError(format!("bad allowlist json: {e}")))?;

        allowlist
            .validate()
            .map_err(|e| AllowlistFetchError(e.to_string()))?;
        Ok(allowlist)
    }

    async fn request(
        &self,
        url: &str,
    ) -> Result<reqwest::Response, AllowlistFetchError> {
        let mut request = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "easy-enclave-control-plane");
        if let Some(token) = &self.github_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AllowlistFetchError(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AllowlistFetchError(format!(
                "http {} from {url}",
                response.status().as_u16()
            )));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn allowlist() -> Allowlist {
        serde_json::from_value(json!({
            "version": "1.0",
            "release_tag": "v1",
            "measurements": {"vm_image_id": "img-1", "sealed": true},
            "report_data": "ab".repeat(64),
            "quote_measurements": {"mrtd": "cc"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn cache_hit_avoids_network() {
        let store = AllowlistStore::new(
            reqwest::Client::new(),
            "agent-attestation-allowlist.json",
            None,
            DEFAULT_TTL,
        );
        store.put("acme/app", "v1", allowlist());
        let cached = store.get("acme/app", "v1").await.unwrap();
        assert_eq!(cached.measurements["vm_image_id"], "img-1");
    }

    #[tokio::test]
    async fn expired_entry_refetches_and_fails_loudly() {
        // Zero TTL forces a refetch, which hits an unroutable URL and must
        // surface as a fetch error, not a stale cache hit.
        let store = AllowlistStore::new(
            reqwest::Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .unwrap(),
            "agent-attestation-allowlist.json",
            None,
            Duration::ZERO,
        );
        store.put("acme/app", "v1", allowlist());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = store.get("acme/app", "v1").await.unwrap_err();
        assert!(err.0.contains("request failed") || err.0.contains("http"), "{err}");
    }
}
