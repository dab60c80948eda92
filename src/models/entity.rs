// src/models/entity.rs

//! Provider platforms and catalog entries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CollectError;

/// A review provider targeted by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    AppStore,
    PlayStore,
}

impl Platform {
    /// All known platforms, in processing order.
    pub const ALL: [Platform; 2] = [Platform::AppStore, Platform::PlayStore];

    /// Stable identifier used in storage rows and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::AppStore => "app_store",
            Platform::PlayStore => "play_store",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app_store" => Ok(Platform::AppStore),
            "play_store" => Ok(Platform::PlayStore),
            other => Err(CollectError::validation(format!(
                "unknown platform '{other}' (expected app_store or play_store)"
            ))),
        }
    }
}

/// One unit of cycle work: an entity plus the remote review count observed
/// upstream by the metadata collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Provider entity id (e.g. "284882215" or "com.whatsapp")
    pub entity_id: String,

    /// Provider the entity belongs to
    pub platform: Platform,

    /// Total review count the provider reported for this entity
    pub remote_count: i64,
}

impl CatalogEntry {
    /// Short label for log lines.
    pub fn label(&self) -> String {
        format!("{} ({})", self.entity_id, self.platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_round_trip() {
        for platform in Platform::ALL {
            let parsed: Platform = platform.as_str().parse().unwrap();
            assert_eq!(parsed, platform);
        }
    }

    #[test]
    fn test_unknown_platform_rejected() {
        assert!("amazon_appstore".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_serde_uses_snake_case() {
        let json = serde_json::to_string(&Platform::AppStore).unwrap();
        assert_eq!(json, "\"app_store\"");
    }
}
