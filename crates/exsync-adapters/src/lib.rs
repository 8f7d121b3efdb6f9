//! Remote source contracts + HTTP and fixture-backed implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use exsync_core::{
    format_remote_timestamp, render_value, script_file_path, Attributes, Record, SchemaNode,
};
use exsync_storage::{FileTree, HttpTransport, TransportError};
use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "exsync-adapters";

/// Operator used for the path-prefix restriction.
pub const PATH_PREFIX_OPERATOR: &str = "beginsWith";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("{record_type}: {reason}")]
    MalformedResponse { record_type: String, reason: String },
    #[error("{record_type}: cannot push, script file {} is missing", path.display())]
    MissingScriptFile { record_type: String, path: PathBuf },
    #[error("{record_type}: record has no resolved path")]
    Unresolved { record_type: String },
    #[error("{record_type}: nothing is updatable, record is read-only")]
    NotPushable { record_type: String },
    #[error("{record_type}: payload has no `id`")]
    MissingId { record_type: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Rows for `node`, in the order the server returned them.
    async fn fetch(&self, node: &SchemaNode, path_prefix: &str) -> Result<Vec<Record>, RemoteError>;

    async fn push(&self, node: &SchemaNode, payload: &Attributes) -> Result<(), RemoteError>;
}

#[async_trait]
impl<T: RemoteSource + ?Sized> RemoteSource for std::sync::Arc<T> {
    async fn fetch(&self, node: &SchemaNode, path_prefix: &str) -> Result<Vec<Record>, RemoteError> {
        (**self).fetch(node, path_prefix).await
    }

    async fn push(&self, node: &SchemaNode, payload: &Attributes) -> Result<(), RemoteError> {
        (**self).push(node, payload).await
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, RemoteError> {
    Url::parse(endpoint).map_err(|e| RemoteError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

/// First `N` with no `whereField.N` on the URL yet.
fn next_where_index(url: &Url) -> usize {
    let taken = url
        .query_pairs()
        .filter_map(|(k, _)| k.strip_prefix("whereField.").and_then(|n| n.parse::<usize>().ok()))
        .collect::<Vec<_>>();
    (0..).find(|i| !taken.contains(i)).unwrap_or(0)
}

fn push_where_clause(url: &mut Url, field: &str, operator: &str, value: &str) {
    let index = next_where_index(url);
    url.query_pairs_mut()
        .append_pair(&format!("whereField.{index}"), field)
        .append_pair(&format!("whereOperator.{index}"), operator)
        .append_pair(&format!("whereValue.{index}"), value);
}

/// GET url for one schema node: table, fields, json shape, where triples, order.
pub fn build_query_url(endpoint: &str, node: &SchemaNode, path_prefix: &str) -> Result<Url, RemoteError> {
    let mut url = parse_endpoint(endpoint)?;
    url.query_pairs_mut()
        .append_pair("table", &node.record_type)
        .append_pair("fields", &node.query_fields.join(","));
    if !node.attributes.is_empty() {
        url.query_pairs_mut().append_pair("json", &node.json_shape());
    }

    if !path_prefix.is_empty() {
        match &node.folder_field {
            Some(field) => push_where_clause(&mut url, field, PATH_PREFIX_OPERATOR, path_prefix),
            None => debug!(record_type = %node.record_type, "no folder field, path filter not applied"),
        }
    }
    for filter in &node.filters {
        push_where_clause(&mut url, &filter.field, &filter.operator, &filter.value);
    }
    if let Some(order) = &node.order_by {
        url.query_pairs_mut().append_pair("order", order);
    }
    Ok(url)
}

pub fn build_push_url(endpoint: &str, node: &SchemaNode) -> Result<Url, RemoteError> {
    let mut url = parse_endpoint(endpoint)?;
    url.query_pairs_mut().append_pair("table", &node.record_type);
    Ok(url)
}

/// Rows under `record_type` in a response body; a missing key means no rows.
pub fn records_from_response(node: &SchemaNode, body: &JsonValue) -> Result<Vec<Record>, RemoteError> {
    let malformed = |reason: String| RemoteError::MalformedResponse {
        record_type: node.record_type.clone(),
        reason,
    };
    let object = body
        .as_object()
        .ok_or_else(|| malformed("response is not a json object".to_string()))?;
    let rows = match object.get(&node.record_type) {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(rows)) => rows,
        Some(_) => return Err(malformed("rows are not an array".to_string())),
    };
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            row.as_object()
                .map(|attrs| Record::new(node.record_type.clone(), attrs.clone()))
                .ok_or_else(|| malformed(format!("row {index} is not an object")))
        })
        .collect()
}

/// Payload for a push: updatable attributes, script file contents, `updated`.
///
/// Every declared script file must exist and the record must carry its `id`;
/// nothing is assembled otherwise.
pub async fn build_push_payload(
    node: &SchemaNode,
    record: &Record,
    tree: &FileTree,
    script_extension: &str,
    local_timestamp: Option<NaiveDateTime>,
) -> Result<Attributes, RemoteError> {
    if !node.is_pushable() {
        return Err(RemoteError::NotPushable {
            record_type: node.record_type.clone(),
        });
    }
    let resolved = record
        .resolved_path
        .as_deref()
        .ok_or_else(|| RemoteError::Unresolved {
            record_type: node.record_type.clone(),
        })?;

    let mut payload = Attributes::new();
    for key in &node.updatable {
        if let Some(value) = record.attributes.get(key) {
            payload.insert(key.clone(), value.clone());
        }
    }
    if !matches!(payload.get("id"), Some(id) if !id.is_null()) {
        return Err(RemoteError::MissingId {
            record_type: node.record_type.clone(),
        });
    }
    for attribute in &node.script_files {
        let path = tree.absolute(script_file_path(resolved, attribute, script_extension));
        if !tree.exists(&path).await? {
            return Err(RemoteError::MissingScriptFile {
                record_type: node.record_type.clone(),
                path,
            });
        }
        let content = tree.read_to_string(&path).await?;
        payload.insert(attribute.clone(), JsonValue::String(content));
    }
    if node.timestamp_pair {
        if let Some(ts) = local_timestamp {
            payload.insert("updated".to_string(), JsonValue::String(format_remote_timestamp(ts)));
        }
    }
    Ok(payload)
}

#[derive(Debug)]
pub struct HttpRemoteSource {
    endpoint: String,
    transport: HttpTransport,
}

impl HttpRemoteSource {
    pub fn new(endpoint: impl Into<String>, transport: HttpTransport) -> Result<Self, RemoteError> {
        let endpoint = endpoint.into();
        parse_endpoint(&endpoint)?;
        Ok(Self {
            endpoint,
            transport,
        })
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch(&self, node: &SchemaNode, path_prefix: &str) -> Result<Vec<Record>, RemoteError> {
        let url = build_query_url(&self.endpoint, node, path_prefix)?;
        debug!(%url, "querying remote");
        let response = self.transport.get(url.as_str()).await?;
        let body = response.json()?;
        records_from_response(node, &body)
    }

    async fn push(&self, node: &SchemaNode, payload: &Attributes) -> Result<(), RemoteError> {
        let url = build_push_url(&self.endpoint, node)?;
        debug!(%url, "posting payload");
        self.transport
            .post_json(url.as_str(), &JsonValue::Object(payload.clone()))
            .await?;
        Ok(())
    }
}

/// Serves rows from a fixture document shaped like a server response per record type.
///
/// Node filters and the path prefix are applied to the attribute sitting at
/// the same position as the queried field; row order is kept as written.
#[derive(Debug, Default)]
pub struct FixtureRemoteSource {
    rows: BTreeMap<String, Vec<Attributes>>,
    pushed: Mutex<Vec<(String, Attributes)>>,
}

impl FixtureRemoteSource {
    pub fn new(rows: BTreeMap<String, Vec<Attributes>>) -> Self {
        Self {
            rows,
            pushed: Mutex::new(Vec::new()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let rows = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(rows))
    }

    pub fn set_rows(&mut self, record_type: &str, rows: Vec<Attributes>) {
        self.rows.insert(record_type.to_string(), rows);
    }

    pub async fn pushed(&self) -> Vec<(String, Attributes)> {
        self.pushed.lock().await.clone()
    }
}

fn attribute_for_field<'a>(node: &'a SchemaNode, field: &'a str) -> &'a str {
    node.query_fields
        .iter()
        .position(|f| f == field)
        .and_then(|i| node.attributes.get(i))
        .map(|a| a.name.as_str())
        .unwrap_or(field)
}

fn row_matches(node: &SchemaNode, row: &Attributes, path_prefix: &str) -> bool {
    let text = |field: &str| row.get(attribute_for_field(node, field)).and_then(render_value);
    let prefix_ok = match (&node.folder_field, path_prefix.is_empty()) {
        (Some(field), false) => text(field).is_some_and(|v| v.starts_with(path_prefix)),
        _ => true,
    };
    prefix_ok
        && node.filters.iter().all(|f| match f.operator.as_str() {
            "equals" => text(&f.field).as_deref() == Some(f.value.as_str()),
            PATH_PREFIX_OPERATOR => text(&f.field).is_some_and(|v| v.starts_with(&f.value)),
            _ => true,
        })
}

#[async_trait]
impl RemoteSource for FixtureRemoteSource {
    async fn fetch(&self, node: &SchemaNode, path_prefix: &str) -> Result<Vec<Record>, RemoteError> {
        Ok(self
            .rows
            .get(&node.record_type)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row_matches(node, row, path_prefix))
                    .map(|row| Record::new(node.record_type.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn push(&self, node: &SchemaNode, payload: &Attributes) -> Result<(), RemoteError> {
        self.pushed
            .lock()
            .await
            .push((node.record_type.clone(), payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exsync_core::{AttributeSpec, FilterSpec};
    use serde_json::json;
    use tempfile::tempdir;

    fn element_node() -> SchemaNode {
        let mut node = SchemaNode::new("screen_definition_element");
        node.query_fields = vec!["id".into(), "screen_definition.hierarchy_id.fullname".into(), "order_pos".into()];
        node.attributes = ["id:Integer", "folder:String", "order_pos:Integer"]
            .iter()
            .map(|s| AttributeSpec::try_from(s.to_string()).unwrap())
            .collect();
        node.folder_field = Some("screen_definition.hierarchy_id.fullname".into());
        node.filters = vec![FilterSpec {
            field: "order_pos".into(),
            operator: "equals".into(),
            value: "1".into(),
        }];
        node.order_by = Some("screen_definition_element.order_pos".into());
        node
    }

    fn attrs(value: JsonValue) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn query_url_carries_shape_filters_and_order() {
        let url = build_query_url("https://host/api?ctx=1&whereField.0=x", &element_node(), "Sales/").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("ctx"), Some("1"));
        assert_eq!(get("table"), Some("screen_definition_element"));
        assert_eq!(get("fields"), Some("id,screen_definition.hierarchy_id.fullname,order_pos"));
        assert_eq!(get("json"), Some("id:Integer,folder:String,order_pos:Integer"));
        assert_eq!(get("whereField.1"), Some("screen_definition.hierarchy_id.fullname"));
        assert_eq!(get("whereOperator.1"), Some("beginsWith"));
        assert_eq!(get("whereValue.1"), Some("Sales/"));
        assert_eq!(get("whereField.2"), Some("order_pos"));
        assert_eq!(get("whereOperator.2"), Some("equals"));
        assert_eq!(get("order"), Some("screen_definition_element.order_pos"));
    }

    #[test]
    fn empty_prefix_adds_no_path_clause() {
        let url = build_query_url("https://host/api", &element_node(), "").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.iter().any(|(k, v)| k == "whereField.0" && v == "order_pos"));
        assert!(!pairs.iter().any(|(_, v)| v == "beginsWith"));
        assert!(build_query_url("not a url", &element_node(), "").is_err());
    }

    #[test]
    fn response_rows_keep_server_order() {
        let node = element_node();
        let body = json!({"screen_definition_element": [{"id": 2}, {"id": 1}]});
        let records = records_from_response(&node, &body).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id().unwrap()).collect();
        assert_eq!(ids, vec!["2", "1"]);

        assert!(records_from_response(&node, &json!({})).unwrap().is_empty());
        assert!(records_from_response(&node, &json!([])).is_err());
        assert!(records_from_response(&node, &json!({"screen_definition_element": [1]})).is_err());
    }

    #[tokio::test]
    async fn push_payload_requires_every_script_file() {
        let dir = tempdir().unwrap();
        let tree = FileTree::new(dir.path());
        let mut node = SchemaNode::new("ejscript");
        node.updatable = vec!["id".into()];
        node.script_files = vec!["body".into()];
        node.timestamp_pair = true;

        let mut record = Record::new("ejscript", attrs(json!({"id": 9, "name": "n", "body": "old"})));
        record.resolved_path = Some("ejscript/f/n/n".into());
        let ts = exsync_core::parse_remote_timestamp("2024-02-03 04:05:06");

        let err = build_push_payload(&node, &record, &tree, "script", ts).await.unwrap_err();
        assert!(matches!(err, RemoteError::MissingScriptFile { .. }));

        std::fs::create_dir_all(dir.path().join("ejscript/f/n")).unwrap();
        std::fs::write(dir.path().join("ejscript/f/n/n.body.script"), "new body").unwrap();
        let payload = build_push_payload(&node, &record, &tree, "script", ts).await.unwrap();
        assert_eq!(
            JsonValue::Object(payload),
            json!({"id": 9, "body": "new body", "updated": "2024-02-03 04:05:06"})
        );
    }

    #[tokio::test]
    async fn push_payload_refuses_read_only_nodes_and_anonymous_records() {
        let dir = tempdir().unwrap();
        let tree = FileTree::new(dir.path());
        std::fs::create_dir_all(dir.path().join("s")).unwrap();
        std::fs::write(dir.path().join("s/e.creation_script.script"), "init();").unwrap();

        let mut record = Record::new("element", attrs(json!({"name": "e", "creation_script": "old"})));
        record.resolved_path = Some("s/e".into());

        let read_only = SchemaNode::new("hidden");
        let err = build_push_payload(&read_only, &record, &tree, "script", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotPushable { .. }));

        let mut element = SchemaNode::new("element");
        element.updatable = vec!["id".into()];
        element.script_files = vec!["creation_script".into()];
        let err = build_push_payload(&element, &record, &tree, "script", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::MissingId { .. }));

        record.attributes.insert("id".into(), json!(12));
        let payload = build_push_payload(&element, &record, &tree, "script", None).await.unwrap();
        assert_eq!(JsonValue::Object(payload), json!({"id": 12, "creation_script": "init();"}));
    }

    #[tokio::test]
    async fn fixture_source_applies_prefix_and_filters_by_position() {
        let mut source = FixtureRemoteSource::default();
        source.set_rows(
            "screen_definition_element",
            vec![
                attrs(json!({"id": 1, "folder": "Sales/A", "order_pos": 1})),
                attrs(json!({"id": 2, "folder": "Support/B", "order_pos": 1})),
                attrs(json!({"id": 3, "folder": "Sales/C", "order_pos": 2})),
            ],
        );
        let records = source.fetch(&element_node(), "Sales").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id().as_deref(), Some("1"));

        source.push(&element_node(), &attrs(json!({"id": 1}))).await.unwrap();
        assert_eq!(source.pushed().await.len(), 1);
    }
}
