use std::time::Duration;

use tr_core::release::Release;
use tr_core::version::Version;
use tracing::{debug, info, warn};

use crate::error::UpdateError;

/// Queries the release feed and picks the newest stable release.
#[derive(Debug, Clone)]
pub struct ReleaseLocator {
    client: reqwest::Client,
    feed_url: String,
}

impl ReleaseLocator {
    /// Build a locator with its own HTTP client.
    pub fn new(
        feed_url: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self::with_client(client, feed_url))
    }

    /// Share an existing client (timeout and user agent are taken from it).
    pub fn with_client(client: reqwest::Client, feed_url: impl Into<String>) -> Self {
        Self {
            client,
            feed_url: feed_url.into(),
        }
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    /// The newest stable release, or `None` when there is none or the feed
    /// cannot be read. Failures are logged, never returned.
    pub async fn find_latest_stable_release(&self) -> Option<Release> {
        match self.fetch_releases().await {
            Ok(releases) => {
                debug!(count = releases.len(), "release feed fetched");
                let latest = select_latest_stable(releases);
                match &latest {
                    Some(r) => info!(tag = %r.tag, published_at = ?r.published_at, "latest stable release"),
                    None => info!("release feed has no stable releases"),
                }
                latest
            }
            Err(e) => {
                warn!(feed = %self.feed_url, error = %e, "failed to query release feed");
                None
            }
        }
    }

    /// First page of the release feed.
    pub async fn fetch_releases(&self) -> Result<Vec<Release>, UpdateError> {
        let body = self
            .client
            .get(&self.feed_url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Highest-versioned non-prerelease entry. Ties keep the first one seen.
pub fn select_latest_stable(releases: Vec<Release>) -> Option<Release> {
    let mut best: Option<(Version, Release)> = None;
    for release in releases.into_iter().filter(|r| !r.is_prerelease) {
        let version = release.version();
        if version.is_sentinel() {
            debug!(tag = %release.tag, "release tag is not a version");
        }
        match &best {
            Some((best_version, _)) if version <= *best_version => {}
            _ => best = Some((version, release)),
        }
    }
    best.map(|(_, release)| release)
}
