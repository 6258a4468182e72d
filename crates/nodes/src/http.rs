//! Outbound HTTP for `http` nodes.
//!
//! The HTTP status is data: a `404` or `500` response is a successful call.
//! Only transport problems are errors.

use std::collections::BTreeMap;

use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{NodeError, schema::HttpNodeData};

/// Request issued for one `http` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestInput {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl From<&HttpNodeData> for HttpRequestInput {
    fn from(data: &HttpNodeData) -> Self {
        Self {
            method: data.method.as_str().to_owned(),
            url: data.url.clone(),
            headers: data.headers.clone(),
            query: data.query.clone(),
            body: data.body.clone(),
        }
    }
}

/// What an `http` node hands to the next node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestOutput {
    pub status_code: u16,
    /// Multi-valued, keyed by lower-case header name.
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
    /// `body` parsed as JSON, when it parses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    http: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, NodeError> {
        let http = Client::builder()
            .user_agent(concat!("dagflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NodeError::Fatal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { http })
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    pub async fn send(&self, input: &HttpRequestInput) -> Result<HttpRequestOutput, NodeError> {
        let method = Method::from_bytes(input.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| NodeError::Fatal(format!("invalid HTTP method '{}'", input.method)))?;
        let url = build_url(&input.url, &input.query)?;

        debug!(%method, %url, "sending HTTP request");

        let mut request = self.http.request(method, url);
        for (name, value) in &input.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &input.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify)?;

        let status_code = response.status().as_u16();
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_owned())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let body = response
            .text()
            .await
            .map_err(|e| NodeError::Retryable(format!("failed to read response body: {e}")))?;
        let data = serde_json::from_str(&body).ok();

        Ok(HttpRequestOutput { status_code, headers, body, data })
    }
}

/// Merge `query` into the URL's query string with form encoding.
pub fn build_url(raw: &str, query: &BTreeMap<String, String>) -> Result<Url, NodeError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| NodeError::Fatal(format!("invalid URL '{raw}': {e}")))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

fn classify(err: reqwest::Error) -> NodeError {
    if err.is_builder() {
        NodeError::Fatal(format!("failed to create request: {err}"))
    } else {
        NodeError::Retryable(format!("failed to execute request: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_is_merged_into_existing_query_string() {
        let query = BTreeMap::from([
            ("q".to_owned(), "a b".to_owned()),
            ("page".to_owned(), "2".to_owned()),
        ]);
        let url = build_url("https://api.example.com/search?lang=en", &query).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/search?lang=en&page=2&q=a+b");
    }

    #[test]
    fn invalid_url_is_fatal() {
        let err = build_url("not a url", &BTreeMap::new()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_method_is_fatal() {
        let client = HttpClient::new().unwrap();
        let input = HttpRequestInput {
            method: "GE T".into(),
            url: "https://api.example.com".into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
        };
        assert!(matches!(client.send(&input).await, Err(NodeError::Fatal(_))));
    }

    #[test]
    fn output_serialises_with_status_code_key() {
        let out = HttpRequestOutput {
            status_code: 200,
            headers: BTreeMap::new(),
            body: "{\"x\":1}".into(),
            data: Some(json!({"x": 1})),
        };
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["status_code"], 200);
        assert_eq!(v["data"], json!({"x": 1}));
    }
}
