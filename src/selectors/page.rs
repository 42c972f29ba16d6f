use super::{SelectorError, types::VersionedSelector};
use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::warn;

/// Supplies the current HTML of a marketplace form page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn snapshot(&self) -> Result<String, SelectorError>;
}

/// Largest page snapshot the extension may post.
pub const MAX_SNAPSHOT_BYTES: usize = 2 * 1024 * 1024;

/// Request body cap for routes carrying a snapshot: the HTML plus its JSON envelope.
pub const SNAPSHOT_BODY_LIMIT: usize = MAX_SNAPSHOT_BYTES + 64 * 1024;

/// A fixed snapshot, e.g. one posted by the browser extension.
pub struct StaticPage(pub String);

#[async_trait]
impl PageSource for StaticPage {
    async fn snapshot(&self) -> Result<String, SelectorError> {
        Ok(self.0.clone())
    }
}

/// Fetches the page over HTTP on every snapshot.
pub struct HttpPage {
    client: Client,
    url: String,
}

impl HttpPage {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PageSource for HttpPage {
    async fn snapshot(&self) -> Result<String, SelectorError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/html")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SelectorError::Fetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }
        Ok(response.text().await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMatch {
    pub index: usize,
    pub element_html: String,
}

/// First candidate, in order, that selects an element in `html`.
/// Candidates that are not valid CSS are skipped.
pub fn first_match(html: &str, candidates: &[VersionedSelector]) -> Option<CandidateMatch> {
    let document = Html::parse_document(html);
    first_match_in(&document, candidates)
}

pub(crate) fn first_match_in(
    document: &Html,
    candidates: &[VersionedSelector],
) -> Option<CandidateMatch> {
    candidates.iter().enumerate().find_map(|(index, candidate)| {
        let selector = match Selector::parse(&candidate.css) {
            Ok(selector) => selector,
            Err(err) => {
                warn!(
                    target = "syncsellr.selectors",
                    css = %candidate.css,
                    error = ?err,
                    "skipping invalid selector"
                );
                return None;
            }
        };
        document.select(&selector).next().map(|element| CandidateMatch {
            index,
            element_html: element.html(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(css: &str) -> VersionedSelector {
        VersionedSelector {
            css: css.to_string(),
            version: "v1".into(),
            added_at: "2026-01-31".into(),
            notes: None,
        }
    }

    #[test]
    fn earlier_candidate_wins_even_if_later_also_matches() {
        let html = r#"<form><input name="title"><input data-testid="title-input"></form>"#;
        let found = first_match(
            html,
            &[candidate(r#"[data-testid="title-input"]"#), candidate(r#"input[name="title"]"#)],
        )
        .expect("match");
        assert_eq!(found.index, 0);
        assert!(found.element_html.contains("data-testid"));
    }

    #[test]
    fn invalid_css_is_skipped() {
        let html = r#"<textarea name="description"></textarea>"#;
        let found = first_match(
            html,
            &[candidate("textarea[[["), candidate(r#"textarea[name="description"]"#)],
        )
        .expect("match");
        assert_eq!(found.index, 1);
    }

    #[test]
    fn case_insensitive_attribute_flag_is_honoured() {
        let html = r#"<input aria-label="Listing Title">"#;
        let found = first_match(html, &[candidate(r#"input[aria-label*="title" i]"#)]);
        assert_eq!(found.map(|m| m.index), Some(0));
        assert!(first_match(html, &[candidate(r#"input[aria-label*="title"]"#)]).is_none());
    }

    #[tokio::test]
    async fn static_page_returns_its_html() {
        let page = StaticPage("<p>hi</p>".into());
        assert_eq!(page.snapshot().await.expect("html"), "<p>hi</p>");
    }
}
