use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::{strip_tag_prefix, Version};

/// A published release as returned by the release feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    #[serde(rename = "tag_name")]
    pub tag: String,
    #[serde(rename = "prerelease", default)]
    pub is_prerelease: bool,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
}

impl Release {
    /// Parsed version of the tag; unparsable tags rank as the sentinel.
    pub fn version(&self) -> Version {
        Version::parse(&self.tag)
    }

    /// The tag without its leading `v`, as used in asset file names.
    pub fn version_label(&self) -> &str {
        strip_tag_prefix(self.tag.trim())
    }

    /// Find an asset by exact (case-insensitive) name.
    pub fn asset_named(&self, name: &str) -> Option<&Asset> {
        self.assets
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }
}
