use super::{
    SelectorError,
    page::first_match_in,
    types::{FieldProbe, HealthCheckResult, HealthStatus, SelectorConfig},
};
use chrono::Utc;
use scraper::Html;
use std::collections::BTreeMap;

/// Checks every field of `platform` against one page snapshot.
pub fn run_health_check(config: &SelectorConfig, platform: &str, html: &str) -> HealthCheckResult {
    let Some(platform_config) = config.platforms.get(platform) else {
        return HealthCheckResult {
            platform: platform.to_string(),
            timestamp: Utc::now(),
            results: BTreeMap::new(),
            overall_status: HealthStatus::Broken,
        };
    };

    let document = Html::parse_document(html);
    let mut results = BTreeMap::new();
    let mut found = 0usize;
    for (key, candidates) in &platform_config.selectors {
        let probe = match first_match_in(&document, candidates) {
            Some(hit) => {
                found += 1;
                FieldProbe {
                    found: true,
                    matched_index: hit.index as i32,
                    matched_version: Some(candidates[hit.index].version.clone()),
                }
            }
            None => FieldProbe::missing(),
        };
        results.insert(key.clone(), probe);
    }

    let total = results.len();
    let ratio = if total > 0 {
        found as f64 / total as f64
    } else {
        0.0
    };
    HealthCheckResult {
        platform: platform.to_string(),
        timestamp: Utc::now(),
        results,
        overall_status: HealthStatus::from_ratio(ratio),
    }
}

/// JavaScript the extension injects into a live tab; evaluates to a health result object.
pub fn generate_probe_script(config: &SelectorConfig, platform: &str) -> Result<String, SelectorError> {
    let platform_config = config
        .platforms
        .get(platform)
        .ok_or_else(|| SelectorError::UnknownPlatform(platform.to_string()))?;
    let selectors_json = serde_json::to_string(&platform_config.selectors)?;
    let platform_json = serde_json::to_string(platform)?;

    Ok(format!(
        r#"(function() {{
  const selectors = {selectors_json};
  const results = {{}};
  let totalKeys = 0;
  let foundKeys = 0;
  for (const [key, versions] of Object.entries(selectors)) {{
    totalKeys++;
    let found = false;
    let matchedIndex = -1;
    let matchedVersion = null;
    for (let i = 0; i < versions.length; i++) {{
      try {{
        if (document.querySelector(versions[i].css)) {{
          found = true;
          matchedIndex = i;
          matchedVersion = versions[i].version;
          break;
        }}
      }} catch (e) {{}}
    }}
    if (found) foundKeys++;
    results[key] = {{ found, matchedIndex, matchedVersion }};
  }}
  const ratio = totalKeys > 0 ? foundKeys / totalKeys : 0;
  let overallStatus = 'broken';
  if (ratio > 0.8) overallStatus = 'healthy';
  else if (ratio >= 0.5) overallStatus = 'degraded';
  return {{ platform: {platform_json}, timestamp: new Date().toISOString(), results, overallStatus }};
}})();
"#
    ))
}
