use super::types::SelectorConfig;
use once_cell::sync::Lazy;

const BUNDLED: &str = include_str!("defaults.json");

/// Selector set compiled into the binary. Always available offline.
pub static DEFAULT_SELECTOR_CONFIG: Lazy<SelectorConfig> = Lazy::new(|| {
    serde_json::from_str(BUNDLED).unwrap_or_else(|err| panic!("bundled selectors.json: {err}"))
});
