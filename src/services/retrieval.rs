//! Vector-search knowledge retrieval over a Pinecone-style HTTP index.
//!
//! Uses the integrated-embedding records API: text goes in, ranked text
//! passages come out. Namespaces partition the index into the shared
//! reference corpus and one namespace per user for uploaded documents.

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::config::RetrievalConfig;
use crate::error::CapabilityError;
use crate::services::{Passage, RetrievalService};

const API_VERSION: &str = "2025-01";

/// Namespace holding a given user's uploaded-document context.
pub fn user_namespace(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("user-{digits}")
}

/// Pinecone-style retrieval client.
pub struct PineconeRetrieval {
    config: RetrievalConfig,
    client: reqwest::Client,
}

impl PineconeRetrieval {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// The namespace holding shared reference material.
    pub fn global_namespace(&self) -> &str {
        &self.config.global_namespace
    }

    fn failed(reason: impl Into<String>) -> CapabilityError {
        CapabilityError::Failed {
            name: "retrieval".into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RetrievalService for PineconeRetrieval {
    async fn query(
        &self,
        text: &str,
        namespace: &str,
        top_k: usize,
    ) -> Result<Vec<Passage>, CapabilityError> {
        let url = format!(
            "{}/records/namespaces/{namespace}/search",
            self.config.index_host
        );
        let body = serde_json::json!({
            "query": {
                "inputs": { "text": text },
                "top_k": top_k,
            },
            "fields": ["text", "source"],
        });

        let resp = self
            .client
            .post(&url)
            .header("Api-Key", self.config.api_key.expose_secret())
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::failed(format!("index returned {}", resp.status())));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Self::failed(format!("invalid search response: {e}")))?;
        Ok(parse_hits(&data))
    }

    async fn index(
        &self,
        namespace: &str,
        id: &str,
        text: &str,
    ) -> Result<(), CapabilityError> {
        let url = format!(
            "{}/records/namespaces/{namespace}/upsert",
            self.config.index_host
        );
        // The records upsert endpoint takes newline-delimited JSON.
        let record = serde_json::json!({ "_id": id, "text": text });

        let resp = self
            .client
            .post(&url)
            .header("Api-Key", self.config.api_key.expose_secret())
            .header("X-Pinecone-API-Version", API_VERSION)
            .header("Content-Type", "application/x-ndjson")
            .body(record.to_string())
            .send()
            .await
            .map_err(|e| Self::failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::failed(format!("upsert returned {}", resp.status())));
        }
        tracing::debug!(namespace, id, "Indexed document chunk");
        Ok(())
    }

    async fn erase_namespace(&self, namespace: &str) -> Result<(), CapabilityError> {
        let url = format!("{}/vectors/delete", self.config.index_host);
        let body = serde_json::json!({ "deleteAll": true, "namespace": namespace });

        let resp = self
            .client
            .post(&url)
            .header("Api-Key", self.config.api_key.expose_secret())
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::failed(e.to_string()))?;

        // A namespace that never existed deletes to the same end state.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Self::failed(format!("delete returned {}", resp.status())));
        }
        tracing::info!(namespace, "Erased retrieval namespace");
        Ok(())
    }
}

/// Map the search response's hit list into passages.
fn parse_hits(data: &serde_json::Value) -> Vec<Passage> {
    data.pointer("/result/hits")
        .and_then(serde_json::Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let text = hit.pointer("/fields/text")?.as_str()?.to_string();
                    let score = hit.get("_score").and_then(|s| s.as_f64()).unwrap_or(0.0);
                    let source = hit
                        .pointer("/fields/source")
                        .and_then(|s| s.as_str())
                        .map(String::from);
                    Some(Passage {
                        text,
                        score,
                        source,
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
    fn user_namespace_strips_non_digits() {
        assert_eq!(user_namespace("+91 98765-43210"), "user-919876543210");
        assert_eq!(user_namespace("919876543210"), "user-919876543210");
    }

    #[test]
    fn parse_hits_extracts_passages() {
        let data = serde_json::json!({
            "result": {
                "hits": [
                    {
                        "_id": "doc-1",
                        "_score": 0.87,
                        "fields": { "text": "Dengue presents with high fever.", "source": "who-guide" }
                    },
                    {
                        "_id": "doc-2",
                        "_score": 0.61,
                        "fields": { "text": "Drink plenty of fluids." }
                    }
                ]
            }
        });
        let passages = parse_hits(&data);
        assert_eq!(passages.len(), 2);
        assert!((passages[0].score - 0.87).abs() < 1e-9);
        assert_eq!(passages[0].source.as_deref(), Some("who-guide"));
        assert!(passages[1].source.is_none());
    }

    #[test]
    fn parse_hits_handles_empty_response() {
        assert!(parse_hits(&serde_json::json!({})).is_empty());
        assert!(parse_hits(&serde_json::json!({"result": {"hits": []}})).is_empty());
    }

    #[test]
    fn parse_hits_skips_hits_without_text() {
        let data = serde_json::json!({
            "result": { "hits": [ { "_id": "x", "_score": 0.5, "fields": {} } ] }
        });
        assert!(parse_hits(&data).is_empty());
    }
}
