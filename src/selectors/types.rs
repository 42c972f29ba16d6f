use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

/// One CSS candidate for a form field, tagged with the config version that introduced it.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedSelector {
    pub css: String,
    pub version: String,
    pub added_at: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSelectors {
    pub platform: String,
    pub version: String,
    pub updated_at: String,
    /// Field key to candidates, highest priority first.
    pub selectors: BTreeMap<String, Vec<VersionedSelector>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorConfig {
    pub version: String,
    pub updated_at: String,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformSelectors>,
}

impl SelectorConfig {
    /// A config is usable when it names a version and covers at least one platform.
    pub fn is_valid(&self) -> bool {
        !self.version.trim().is_empty() && !self.platforms.is_empty()
    }

    pub fn candidates(&self, platform: &str, key: &str) -> Option<&[VersionedSelector]> {
        self.platforms
            .get(platform)
            .and_then(|p| p.selectors.get(key))
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldProbe {
    pub found: bool,
    /// `-1` when nothing matched.
    pub matched_index: i32,
    pub matched_version: Option<String>,
}

impl FieldProbe {
    pub fn missing() -> Self {
        Self {
            found: false,
            matched_index: -1,
            matched_version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Broken,
}

impl HealthStatus {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio > 0.8 {
            HealthStatus::Healthy
        } else if ratio >= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Broken
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Broken => "broken",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub platform: String,
    pub timestamp: DateTime<Utc>,
    pub results: BTreeMap<String, FieldProbe>,
    pub overall_status: HealthStatus,
}

/// The candidate that matched during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub platform: String,
    pub key: String,
    pub index: usize,
    pub version: String,
    pub css: String,
    pub element_html: String,
}
