//! Outbound plumbing for talking to uplink: operation names, the
//! round-robin URL selector, and the query POST helper.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{RelayError, Result};

pub const SUPERGRAPH_QUERY: &str = "SupergraphSdlQuery";
pub const LICENSE_QUERY: &str = "LicenseQuery";
pub const PERSISTED_QUERIES_QUERY: &str = "PersistedQueriesManifestQuery";

pub const CLIENT_NAME: &str = "UplinkRelay";
pub const CLIENT_VERSION: &str = "1.0";
pub const USER_AGENT: &str = "UplinkRelay/1.0";

/// The artifact kinds the relay fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Schema,
    License,
    PersistedQueries,
}

impl OperationKind {
    pub fn from_operation_name(name: &str) -> Option<Self> {
        match name {
            SUPERGRAPH_QUERY => Some(Self::Schema),
            LICENSE_QUERY => Some(Self::License),
            PERSISTED_QUERIES_QUERY => Some(Self::PersistedQueries),
            _ => None,
        }
    }

    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::Schema => SUPERGRAPH_QUERY,
            Self::License => LICENSE_QUERY,
            Self::PersistedQueries => PERSISTED_QUERIES_QUERY,
        }
    }
}

/// The uplink-shaped request body routers send and the relay forwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
    #[serde(rename = "operationName", default)]
    pub operation_name: String,
}

/// Rotates through uplink URLs.
pub struct RoundRobinSelector {
    urls: Vec<String>,
    next_index: Mutex<usize>,
}

impl RoundRobinSelector {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            next_index: Mutex::new(0),
        }
    }

    /// The next URL in sequence, or the empty string when none are
    /// configured.
    pub fn next(&self) -> String {
        let mut next_index = self.next_index.lock();
        if self.urls.is_empty() {
            return String::new();
        }
        let url = self.urls[*next_index].clone();
        *next_index = (*next_index + 1) % self.urls.len();
        url
    }
}

/// Apply the headers identifying the relay to an outbound request.
pub fn identity_headers(builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    builder
        .header("apollo-client-name", CLIENT_NAME)
        .header("apollo-client-version", CLIENT_VERSION)
        .header("User-Agent", USER_AGENT)
        .header("Content-Type", "application/json")
}

/// Execute a single uplink operation against the next selected URL and
/// return the raw response body. Retries are the caller's responsibility.
pub async fn uplink_request(
    client: &reqwest::Client,
    selector: &RoundRobinSelector,
    query: &str,
    variables: Value,
    operation_name: &str,
) -> Result<Vec<u8>> {
    let uplink_url = selector.next();
    if uplink_url.is_empty() {
        return Err(RelayError::NoUplinkAvailable);
    }

    let body = serde_json::json!({
        "query": query,
        "variables": variables,
        "operationName": operation_name,
    });

    let response = identity_headers(client.post(&uplink_url))
        .json(&body)
        .send()
        .await
        .map_err(|err| RelayError::Uplink(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(RelayError::Uplink(format!(
            "uplink request failed with status {status}"
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|err| RelayError::Uplink(err.to_string()))?;
    if bytes.is_empty() {
        return Err(RelayError::Uplink("empty response body".to_string()));
    }
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> Vec<String> {
        vec![
            "http://example.com".to_string(),
            "http://example.org".to_string(),
            "http://example.net".to_string(),
        ]
    }

    #[test]
    fn test_round_robin_rotates_in_order() {
        let selector = RoundRobinSelector::new(urls());
        for expected in urls() {
            assert_eq!(selector.next(), expected);
        }
        // Wraps back to the start.
        assert_eq!(selector.next(), "http://example.com");
    }

    #[test]
    fn test_round_robin_empty_list() {
        let selector = RoundRobinSelector::new(Vec::new());
        assert_eq!(selector.next(), "");
    }

    #[test]
    fn test_operation_kind_mapping() {
        assert_eq!(
            OperationKind::from_operation_name("SupergraphSdlQuery"),
            Some(OperationKind::Schema)
        );
        assert_eq!(
            OperationKind::from_operation_name("LicenseQuery"),
            Some(OperationKind::License)
        );
        assert_eq!(
            OperationKind::from_operation_name("PersistedQueriesManifestQuery"),
            Some(OperationKind::PersistedQueries)
        );
        assert_eq!(OperationKind::from_operation_name("Other"), None);
    }

    #[tokio::test]
    async fn test_uplink_request_posts_identity_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("apollo-client-name", CLIENT_NAME)
            .match_header("apollo-client-version", CLIENT_VERSION)
            .match_header("user-agent", USER_AGENT)
            .with_body(r#"{"data":{}}"#)
            .create_async()
            .await;

        let selector = RoundRobinSelector::new(vec![server.url()]);
        let client = reqwest::Client::new();
        let body = uplink_request(
            &client,
            &selector,
            "query { field }",
            serde_json::json!({}),
            SUPERGRAPH_QUERY,
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(body, br#"{"data":{}}"#);
    }

    #[tokio::test]
    async fn test_uplink_request_rejects_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(500)
            .create_async()
            .await;

        let selector = RoundRobinSelector::new(vec![server.url()]);
        let client = reqwest::Client::new();
        let result = uplink_request(
            &client,
            &selector,
            "query { field }",
            serde_json::json!({}),
            SUPERGRAPH_QUERY,
        )
        .await;
        assert!(matches!(result, Err(RelayError::Uplink(_))));
    }

    #[tokio::test]
    async fn test_uplink_request_rejects_empty_body() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/").with_body("").create_async().await;

        let selector = RoundRobinSelector::new(vec![server.url()]);
        let client = reqwest::Client::new();
        let result = uplink_request(
            &client,
            &selector,
            "query { field }",
            serde_json::json!({}),
            SUPERGRAPH_QUERY,
        )
        .await;
        assert!(matches!(result, Err(RelayError::Uplink(_))));
    }

    #[tokio::test]
    async fn test_uplink_request_without_urls() {
        let selector = RoundRobinSelector::new(Vec::new());
        let client = reqwest::Client::new();
        let result = uplink_request(
            &client,
            &selector,
            "query { field }",
            serde_json::json!({}),
            SUPERGRAPH_QUERY,
        )
        .await;
        assert!(matches!(result, Err(RelayError::NoUplinkAvailable)));
    }
}
