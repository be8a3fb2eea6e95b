//! Serper-backed web search for outbreak and health-alert queries.

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::config::SearchConfig;
use crate::error::CapabilityError;
use crate::services::{SearchService, SearchSnippet};

const SERPER_URL: &str = "https://google.serper.dev/search";

/// Maximum snippets returned to the pipeline.
const MAX_RESULTS: usize = 5;

/// Web search via the Serper API.
pub struct SerperSearch {
    config: SearchConfig,
    client: reqwest::Client,
}

impl SerperSearch {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SearchService for SerperSearch {
    async fn search(
        &self,
        query: &str,
        location_hint: Option<&str>,
    ) -> Result<Vec<SearchSnippet>, CapabilityError> {
        let full_query = match location_hint {
            Some(location) if !location.is_empty() => format!("{query} {location}"),
            _ => format!("{query} {}", self.config.default_region),
        };

        let body = serde_json::json!({
            "q": full_query,
            "num": MAX_RESULTS,
        });

        let resp = self
            .client
            .post(SERPER_URL)
            .header("X-API-KEY", self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| CapabilityError::Failed {
                name: "search".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(CapabilityError::Failed {
                name: "search".into(),
                reason: format!("serper returned {}", resp.status()),
            });
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| CapabilityError::Failed {
            name: "search".into(),
            reason: format!("invalid serper response: {e}"),
        })?;

        Ok(parse_results(&data))
    }
}

/// Pull title/snippet/link triples out of Serper's `organic` array.
fn parse_results(data: &serde_json::Value) -> Vec<SearchSnippet> {
    data.get("organic")
        .and_then(serde_json::Value::as_array)
        .map(|results| {
            results
                .iter()
                .take(MAX_RESULTS)
                .filter_map(|entry| {
                    let title = entry.get("title")?.as_str()?.to_string();
                    let snippet = entry
                        .get("snippet")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let link = entry
                        .get("link")
                        .and_then(|l| l.as_str())
                        .unwrap_or_default()
                        .to_string();
                    Some(SearchSnippet {
                        title,
                        snippet,
                        link,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_organic_results() {
        let data = serde_json::json!({
            "organic": [
                {
                    "title": "Dengue cases rise in Pune",
                    "snippet": "Health officials report 120 new cases this week.",
                    "link": "https://example.org/dengue-pune"
                },
                {
                    "title": "Prevention advisory",
                    "snippet": "Remove standing water.",
                    "link": "https://example.org/advisory"
                }
            ]
        });
        let results = parse_results(&data);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Dengue cases rise in Pune");
        assert!(results[0].snippet.contains("120 new cases"));
    }

    #[test]
    fn parse_missing_organic_is_empty() {
        let data = serde_json::json!({"searchParameters": {}});
        assert!(parse_results(&data).is_empty());
    }

    #[test]
    fn parse_entries_without_title_are_skipped() {
        let data = serde_json::json!({
            "organic": [
                {"snippet": "no title here"},
                {"title": "Kept", "snippet": "ok", "link": "x"}
            ]
        });
        let results = parse_results(&data);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Kept");
    }

    #[test]
    fn parse_caps_result_count() {
        let entries: Vec<serde_json::Value> = (0..10)
            .map(|i| serde_json::json!({"title": format!("r{i}"), "snippet": "", "link": ""}))
            .collect();
        let data = serde_json::json!({ "organic": entries });
        assert_eq!(parse_results(&data).len(), MAX_RESULTS);
    }
}
