//! Canned Graph API responses loaded from a JSON bundle.
//!
//! The bundle uses the live wire shapes. Any node may carry an error string, which is
//! returned as a 400 `ApiError::Status` for that call only.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use pulse_core::Insight;
use serde::{Deserialize, Serialize};

use crate::{
    ApiError, GraphApi, GraphConnector, GraphInsight, GraphLinkedAccount, GraphMedia, GraphPage,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphFixture {
    /// Tokens answered with an OAuth error (code 190) on every call.
    #[serde(default)]
    pub rejected_tokens: Vec<String>,
    #[serde(default)]
    pub pages_error: Option<String>,
    #[serde(default)]
    pub pages: Vec<GraphPage>,
    /// Pages and linked accounts keyed by node id.
    #[serde(default)]
    pub nodes: BTreeMap<String, FixtureNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureNode {
    #[serde(default)]
    pub linked_account: Option<GraphLinkedAccount>,
    #[serde(default)]
    pub linked_account_error: Option<String>,
    #[serde(default)]
    pub insights: Vec<GraphInsight>,
    #[serde(default)]
    pub insights_error: Option<String>,
    #[serde(default)]
    pub media: Vec<FixtureMedia>,
    #[serde(default)]
    pub media_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureMedia {
    #[serde(flatten)]
    pub media: GraphMedia,
    #[serde(default)]
    pub insights: Vec<GraphInsight>,
    #[serde(default)]
    pub insights_error: Option<String>,
}

impl GraphFixture {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading graph fixture {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing graph fixture {}", path.display()))
    }

    fn node(&self, id: &str) -> Result<&FixtureNode, ApiError> {
        self.nodes.get(id).ok_or_else(|| ApiError::Status {
            status: 400,
            code: Some(100),
            message: format!("Unsupported get request. Object with ID '{id}' does not exist"),
        })
    }

    fn media_item(&self, media_id: &str) -> Result<&FixtureMedia, ApiError> {
        self.nodes
            .values()
            .flat_map(|node| node.media.iter())
            .find(|item| item.media.id == media_id)
            .ok_or_else(|| ApiError::Status {
                status: 400,
                code: Some(100),
                message: format!("Unsupported get request. Object with ID '{media_id}' does not exist"),
            })
    }
}

fn node_error(message: &Option<String>) -> Result<(), ApiError> {
    match message {
        Some(message) => Err(ApiError::Status {
            status: 400,
            code: None,
            message: message.clone(),
        }),
        None => Ok(()),
    }
}

fn select_insights(
    insights: &[GraphInsight],
    metrics: &[String],
) -> Result<Vec<Insight>, ApiError> {
    insights
        .iter()
        .filter(|insight| metrics.iter().any(|m| m == &insight.name))
        .cloned()
        .map(GraphInsight::into_insight)
        .collect()
}

/// [`GraphApi`] over a fixture bundle, bound to one token.
#[derive(Debug, Clone)]
pub struct FixtureGraph {
    fixture: Arc<GraphFixture>,
    access_token: String,
}

impl FixtureGraph {
    pub fn new(fixture: Arc<GraphFixture>, access_token: impl Into<String>) -> Self {
        Self {
            fixture,
            access_token: access_token.into(),
        }
    }

    fn check_token(&self) -> Result<(), ApiError> {
        if self.fixture.rejected_tokens.iter().any(|t| t == &self.access_token) {
            return Err(ApiError::Status {
                status: 400,
                code: Some(190),
                message: "Error validating access token: Session has expired".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GraphApi for FixtureGraph {
    async fn list_pages(&self) -> Result<Vec<GraphPage>, ApiError> {
        self.check_token()?;
        node_error(&self.fixture.pages_error)?;
        Ok(self.fixture.pages.clone())
    }

    async fn linked_account(&self, page_id: &str) -> Result<Option<GraphLinkedAccount>, ApiError> {
        self.check_token()?;
        let node = self.fixture.node(page_id)?;
        node_error(&node.linked_account_error)?;
        Ok(node.linked_account.clone())
    }

    async fn account_insights(
        &self,
        account_id: &str,
        metrics: &[String],
        _since: &str,
        _until: &str,
    ) -> Result<Vec<Insight>, ApiError> {
        self.check_token()?;
        let node = self.fixture.node(account_id)?;
        node_error(&node.insights_error)?;
        select_insights(&node.insights, metrics)
    }

    async fn list_media(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<GraphMedia>, ApiError> {
        self.check_token()?;
        let node = self.fixture.node(account_id)?;
        node_error(&node.media_error)?;
        Ok(node
            .media
            .iter()
            .take(limit)
            .map(|item| item.media.clone())
            .collect())
    }

    async fn media_insights(
        &self,
        media_id: &str,
        metrics: &[String],
    ) -> Result<Vec<Insight>, ApiError> {
        self.check_token()?;
        let item = self.fixture.media_item(media_id)?;
        node_error(&item.insights_error)?;
        select_insights(&item.insights, metrics)
    }
}

#[derive(Debug, Clone)]
pub struct FixtureGraphConnector {
    fixture: Arc<GraphFixture>,
}

impl FixtureGraphConnector {
    pub fn new(fixture: GraphFixture) -> Self {
        Self {
            fixture: Arc::new(fixture),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(GraphFixture::load(path)?))
    }
}

impl GraphConnector for FixtureGraphConnector {
    fn connect(&self, access_token: &str) -> Box<dyn GraphApi> {
        Box::new(FixtureGraph::new(self.fixture.clone(), access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_bundle() -> serde_json::Value {
        serde_json::json!({
            "rejected_tokens": ["revoked"],
            "pages": [{"id": "p1", "name": "Bakery"}],
            "nodes": {
                "p1": {
                    "linked_account": {"id": "ig1", "username": "bakery"},
                    "insights": [{"name": "page_reach", "values": [{"value": 4, "end_time": "2026-03-01T08:00:00+0000"}]}]
                },
                "ig1": {
                    "insights": [
                        {"name": "reach", "values": [{"value": 9, "end_time": "2026-03-01T08:00:00+0000"}]},
                        {"name": "impressions", "values": [{"value": 20, "end_time": "2026-03-01T08:00:00+0000"}]}
                    ],
                    "media": [
                        {"id": "m1", "media_type": "IMAGE", "timestamp": "2026-03-01T10:00:00+0000",
                         "insights": [{"name": "saved", "values": [{"value": 3}]}]},
                        {"id": "m2", "media_type": "IMAGE", "timestamp": "2026-03-02T10:00:00+0000",
                         "insights_error": "(#10) Not enough viewers for the media to show insights"}
                    ]
                }
            }
        })
    }

    fn connector() -> FixtureGraphConnector {
        FixtureGraphConnector::new(serde_json::from_value(sample_bundle()).unwrap())
    }

    #[tokio::test]
    async fn fixture_serves_requested_metrics_only() {
        let graph = connector().connect("tok");
        let insights = graph
            .account_insights("ig1", &["reach".to_string()], "2026-03-01", "2026-03-02")
            .await
            .unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].name, "reach");
        assert_eq!(insights[0].values[0].value, 9);

        let media = graph.list_media("ig1", 1).await.unwrap();
        assert_eq!(media.len(), 1);
        let saved = graph.media_insights("m1", &["saved".to_string()]).await.unwrap();
        assert_eq!(saved[0].values[0].end_time, None);
    }

    #[tokio::test]
    async fn fixture_errors_are_scoped_to_their_node() {
        let connector = connector();
        let graph = connector.connect("tok");
        let err = graph.media_insights("m2", &["saved".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("Not enough viewers"));
        assert!(graph.linked_account("p1").await.unwrap().is_some());

        let unknown = graph.linked_account("nope").await.unwrap_err();
        assert!(matches!(unknown, ApiError::Status { code: Some(100), .. }));

        let revoked = connector.connect("revoked").list_pages().await.unwrap_err();
        assert!(revoked.is_token_error());
    }

    #[tokio::test]
    async fn fixture_loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", sample_bundle()).unwrap();
        let connector = FixtureGraphConnector::load(file.path()).unwrap();
        let pages = connector.connect("tok").list_pages().await.unwrap();
        assert_eq!(pages[0].id, "p1");

        let bundled = concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/meta-sample/graph.json");
        let fixture = GraphFixture::load(bundled).unwrap();
        assert!(!fixture.pages.is_empty());
    }
}
