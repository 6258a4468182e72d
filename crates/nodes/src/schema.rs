//! Typed payloads for each node type.
//!
//! Node `data` arrives as an untyped JSON tree. [`NodeKind::parse`] turns a
//! `(type, data)` pair into a strict record, reporting every problem it finds
//! as a [`DataIssue`]. Unknown keys are ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Methods accepted by HTTP nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get    => "GET",
            Self::Post   => "POST",
            Self::Put    => "PUT",
            Self::Delete => "DELETE",
            Self::Patch  => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET"    => Ok(Self::Get),
            "POST"   => Ok(Self::Post),
            "PUT"    => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH"  => Ok(Self::Patch),
            _        => Err(s.to_owned()),
        }
    }
}

/// Payload of an `http` node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpNodeData {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
}

/// Payload of a `code` node. Empty `code` means passthrough.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeNodeData {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Deserialize)]
struct RawHttpNodeData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    query: Option<BTreeMap<String, String>>,
    #[serde(default)]
    body: Option<Value>,
}

/// A node's type together with its parsed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start(LabelData),
    Http(HttpNodeData),
    Code(CodeNodeData),
    Output(LabelData),
}

/// One reason a node's `(type, data)` pair was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataIssue {
    HttpMissingData,
    HttpInvalidData(String),
    HttpMissingUrl,
    HttpInvalidMethod(String),
    CodeInvalidData(String),
    UnknownType(String),
}

impl DataIssue {
    /// Human-readable message naming the offending node.
    pub fn describe(&self, node_id: &str) -> String {
        match self {
            Self::HttpMissingData => format!("HTTP node '{node_id}' missing data"),
            Self::HttpInvalidData(e) => format!("HTTP node '{node_id}' invalid data: {e}"),
            Self::HttpMissingUrl => format!("HTTP node '{node_id}' requires a URL"),
            Self::HttpInvalidMethod(m) => {
                format!("HTTP node '{node_id}' has invalid method '{m}'")
            }
            Self::CodeInvalidData(e) => format!("Code node '{node_id}' invalid data: {e}"),
            Self::UnknownType(t) => format!("Unknown node type '{t}' for node '{node_id}'"),
        }
    }
}

impl NodeKind {
    /// Type tag as it appears in the DAG JSON.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start(_)  => "start",
            Self::Http(_)   => "http",
            Self::Code(_)   => "code",
            Self::Output(_) => "output",
        }
    }

    /// Parse a node's payload according to its `node_type`.
    ///
    /// Start and output payloads are lenient: anything that is not a
    /// `{label}` object is treated as having no label.
    pub fn parse(node_type: &str, data: &Value) -> Result<Self, Vec<DataIssue>> {
        match node_type {
            "start" => Ok(Self::Start(parse_label(data))),
            "output" => Ok(Self::Output(parse_label(data))),
            "http" => parse_http(data).map(Self::Http),
            "code" => parse_code(data).map(Self::Code).map_err(|e| vec![e]),
            other => Err(vec![DataIssue::UnknownType(other.to_owned())]),
        }
    }
}

fn parse_label(data: &Value) -> LabelData {
    serde_json::from_value(data.clone()).unwrap_or_default()
}

fn parse_http(data: &Value) -> Result<HttpNodeData, Vec<DataIssue>> {
    if data.is_null() {
        return Err(vec![DataIssue::HttpMissingData]);
    }
    if !data.is_object() {
        return Err(vec![DataIssue::HttpInvalidData(format!(
            "expected an object, found {}",
            json_type(data)
        ))]);
    }
    let raw: RawHttpNodeData = serde_json::from_value(data.clone())
        .map_err(|e| vec![DataIssue::HttpInvalidData(e.to_string())])?;

    let url = raw.url.unwrap_or_default();
    let mut issues = Vec::new();
    if url.trim().is_empty() {
        issues.push(DataIssue::HttpMissingUrl);
    }
    let method = match raw.method.as_deref() {
        None | Some("") => Ok(HttpMethod::Get),
        Some(m) => m.parse::<HttpMethod>(),
    };
    let method = match method {
        Ok(m) => Some(m),
        Err(bad) => {
            issues.push(DataIssue::HttpInvalidMethod(bad.to_ascii_uppercase()));
            None
        }
    };

    match method {
        Some(method) if issues.is_empty() => Ok(HttpNodeData {
            method,
            url,
            headers: raw.headers.unwrap_or_default(),
            query: raw.query.unwrap_or_default(),
            body: raw.body.filter(|b| !b.is_null()),
        }),
        _ => Err(issues),
    }
}

fn parse_code(data: &Value) -> Result<CodeNodeData, DataIssue> {
    match data {
        // no payload at all is passthrough
        Value::Null => Ok(CodeNodeData::default()),
        Value::Object(_) => serde_json::from_value(data.clone())
            .map_err(|e| DataIssue::CodeInvalidData(e.to_string())),
        other => Err(DataIssue::CodeInvalidData(format!(
            "expected an object, found {}",
            json_type(other)
        ))),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null      => "null",
        Value::Bool(_)   => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_)  => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_method_defaults_to_get_and_is_normalised() {
        let NodeKind::Http(d) = NodeKind::parse("http", &json!({"url": "https://x"})).unwrap() else {
            panic!("expected http");
        };
        assert_eq!(d.method, HttpMethod::Get);

        let NodeKind::Http(d) =
            NodeKind::parse("http", &json!({"url": "https://x", "method": "post"})).unwrap()
        else {
            panic!("expected http");
        };
        assert_eq!(d.method, HttpMethod::Post);
    }

    #[test]
    fn null_method_and_url_count_as_absent() {
        let NodeKind::Http(d) =
            NodeKind::parse("http", &json!({"url": "https://x", "method": null})).unwrap()
        else {
            panic!("expected http");
        };
        assert_eq!(d.method, HttpMethod::Get);

        let issues = NodeKind::parse("http", &json!({"url": null})).unwrap_err();
        assert_eq!(issues, vec![DataIssue::HttpMissingUrl]);
    }

    #[test]
    fn http_reports_url_and_method_together() {
        let issues = NodeKind::parse("http", &json!({"url": "  ", "method": "fetch"})).unwrap_err();
        assert_eq!(
            issues,
            vec![DataIssue::HttpMissingUrl, DataIssue::HttpInvalidMethod("FETCH".into())]
        );
        assert_eq!(issues[1].describe("h"), "HTTP node 'h' has invalid method 'FETCH'");
    }

    #[test]
    fn http_without_data_is_rejected() {
        let issues = NodeKind::parse("http", &Value::Null).unwrap_err();
        assert_eq!(issues[0].describe("h"), "HTTP node 'h' missing data");
    }

    #[test]
    fn http_with_wrong_field_type_is_invalid_data() {
        let issues = NodeKind::parse("http", &json!({"url": 42})).unwrap_err();
        assert!(matches!(issues[0], DataIssue::HttpInvalidData(_)));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let kind = NodeKind::parse("http", &json!({"url": "https://x", "timeout": 3})).unwrap();
        assert_eq!(kind.type_name(), "http");
    }

    #[test]
    fn code_without_data_is_passthrough() {
        assert_eq!(
            NodeKind::parse("code", &Value::Null).unwrap(),
            NodeKind::Code(CodeNodeData::default())
        );
        assert!(NodeKind::parse("code", &json!({"code": 1})).is_err());
    }

    #[test]
    fn unknown_type_is_reported() {
        let issues = NodeKind::parse("email", &json!({})).unwrap_err();
        assert_eq!(issues[0].describe("n1"), "Unknown node type 'email' for node 'n1'");
    }
}
