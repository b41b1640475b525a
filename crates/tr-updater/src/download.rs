use std::io::Write;
use std::path::{Path, PathBuf};

use ring::digest::{Context, SHA256};
use tempfile::NamedTempFile;
use tr_core::release::{Asset, Release};
use tracing::debug;

use crate::error::UpdateError;

/// Result of looking for the `<asset>.sha256` companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumLookup {
    /// Lower-cased hex digest from the checksum file.
    Found(String),
    /// The release has no checksum asset.
    Missing,
    /// The checksum asset exists but could not be fetched or read.
    FetchFailed(String),
}

impl ChecksumLookup {
    pub fn digest(&self) -> Option<&str> {
        match self {
            ChecksumLookup::Found(digest) => Some(digest),
            ChecksumLookup::Missing | ChecksumLookup::FetchFailed(_) => None,
        }
    }
}

/// Name of the checksum companion for `asset`.
pub fn checksum_asset_name(asset: &Asset) -> String {
    format!("{}.sha256", asset.name)
}

/// Expected digest from a checksum file: its first whitespace-delimited token.
pub fn parse_checksum(body: &str) -> Option<String> {
    body.split_whitespace()
        .next()
        .map(|token| token.to_ascii_lowercase())
}

/// Look up and fetch the checksum companion of `asset`.
pub async fn fetch_checksum(
    client: &reqwest::Client,
    release: &Release,
    asset: &Asset,
) -> ChecksumLookup {
    let name = checksum_asset_name(asset);
    let Some(checksum_asset) = release.asset_named(&name) else {
        return ChecksumLookup::Missing;
    };

    let body = match fetch_text(client, &checksum_asset.download_url).await {
        Ok(body) => body,
        Err(e) => return ChecksumLookup::FetchFailed(e.to_string()),
    };
    match parse_checksum(&body) {
        Some(digest) => ChecksumLookup::Found(digest),
        None => ChecksumLookup::FetchFailed(format!("{name} is empty")),
    }
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, UpdateError> {
    Ok(client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

/// A fully downloaded payload in a temporary file.
///
/// The file is removed when this value is dropped or [`DownloadedAsset::discard`]ed.
#[derive(Debug)]
pub struct DownloadedAsset {
    file: NamedTempFile,
    sha256: String,
    len: u64,
}

impl DownloadedAsset {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Lower-cased hex SHA-256 of the payload.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Case-insensitive comparison against an expected hex digest.
    pub fn matches_digest(&self, expected: &str) -> bool {
        self.sha256.eq_ignore_ascii_case(expected.trim())
    }

    /// Delete the temporary file, reporting (not raising) failures.
    pub fn discard(self) {
        let path: PathBuf = self.file.path().to_path_buf();
        if let Err(e) = self.file.close() {
            debug!(path = %path.display(), error = %e, "failed to remove temporary download");
        }
    }
}

/// Stream `url` into a fresh temporary file, hashing as it arrives.
///
/// The temporary file lives in `temp_dir` when given, otherwise in the system
/// temp directory. A failed download leaves nothing behind.
pub async fn download_to_temp(
    client: &reqwest::Client,
    url: &str,
    temp_dir: Option<&Path>,
) -> Result<DownloadedAsset, UpdateError> {
    let mut response = client.get(url).send().await?.error_for_status()?;

    let mut builder = tempfile::Builder::new();
    builder.prefix("hasheous-taskrunner-").suffix(".download");
    let mut file = match temp_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };

    let mut digest = Context::new(&SHA256);
    let mut len = 0u64;
    while let Some(chunk) = response.chunk().await? {
        digest.update(&chunk);
        file.write_all(&chunk)?;
        len += chunk.len() as u64;
    }
    file.as_file().sync_all()?;

    Ok(DownloadedAsset {
        file,
        sha256: hex(digest.finish().as_ref()),
        len,
    })
}

/// SHA-256 of `bytes` as lower-case hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex(ring::digest::digest(&SHA256, bytes).as_ref())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
