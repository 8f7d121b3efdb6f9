//! Core domain model for exsync: schema tree, records, path derivation and staleness.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "exsync-core";

/// Wire format for timestamps in both directions.
pub const REMOTE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub type Attributes = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Status,
    Sync,
    Get,
    Put,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Status, Mode::Sync, Mode::Get, Mode::Put];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Status => "status",
            Mode::Sync => "sync",
            Mode::Get => "get",
            Mode::Put => "put",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode `{0}` (expected status, sync, get or put)")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Schema tree
// ---------------------------------------------------------------------------

/// One `name:Type` entry of a node's JSON attribute shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributeSpec {
    pub name: String,
    pub kind: String,
}

impl TryFrom<String> for AttributeSpec {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (name, kind) = value
            .split_once(':')
            .map(|(n, k)| (n.trim(), k.trim()))
            .filter(|(n, k)| !n.is_empty() && !k.is_empty())
            .ok_or_else(|| SchemaError::MalformedAttribute(value.clone()))?;
        Ok(Self {
            name: name.to_string(),
            kind: kind.to_string(),
        })
    }
}

impl From<AttributeSpec> for String {
    fn from(spec: AttributeSpec) -> Self {
        format!("{}:{}", spec.name, spec.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NamingRule {
    /// `${attribute}` placeholders expanded against the record.
    Template(String),
    /// Key pattern (`record_type:${attr}`) resolved against the path registry.
    Lookup(String),
    /// `{folder}/{name}`.
    #[default]
    Fallback,
}

impl NamingRule {
    /// Record type a lookup rule points at.
    pub fn lookup_target(&self) -> Option<&str> {
        match self {
            NamingRule::Lookup(pattern) => pattern.split_once(':').map(|(t, _)| t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub field: String,
    pub operator: String,
    pub value: String,
}

/// Discriminant-based redirection of records into a fixed path namespace.
///
/// Records whose discriminant is listed in `passthrough` follow the node's
/// normal naming rule; every other record takes the configured target path,
/// bypassing its nominal parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub attribute: String,
    #[serde(default)]
    pub passthrough: Vec<String>,
    pub targets: BTreeMap<String, String>,
}

/// Marker that turns one nested record shape into a bare script file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineBody {
    pub marker_attribute: String,
    pub marker: String,
    pub value_attribute: String,
    /// Attribute name used for the script file suffix (`{path}.{script_name}.{ext}`).
    #[serde(default = "default_inline_script_name")]
    pub script_name: String,
}

fn default_inline_script_name() -> String {
    "body".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationSpec {
    /// Index file, relative to the directory holding the record's files.
    pub file: String,
    #[serde(default)]
    pub header: String,
    pub category_attribute: String,
    #[serde(default = "default_name_attribute")]
    pub name_attribute: String,
    #[serde(default)]
    pub dedent: Vec<i64>,
    /// Categories in `[indent_from, indent_to)` open a nesting level.
    pub indent_from: i64,
    pub indent_to: i64,
    #[serde(default)]
    pub labels: BTreeMap<i64, String>,
}

fn default_name_attribute() -> String {
    "name".to_string()
}

impl NavigationSpec {
    pub fn label_for(&self, category: i64) -> String {
        self.labels
            .get(&category)
            .cloned()
            .unwrap_or_else(|| category.to_string())
    }

    pub fn opens_level(&self, category: i64) -> bool {
        category >= self.indent_from && category < self.indent_to
    }

    pub fn closes_level(&self, category: i64) -> bool {
        self.dedent.contains(&category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaNode {
    pub record_type: String,
    pub query_fields: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeSpec>,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub naming: NamingRule,
    #[serde(default)]
    pub folder_field: Option<String>,
    #[serde(default)]
    pub json_file: bool,
    #[serde(default)]
    pub script_files: Vec<String>,
    #[serde(default)]
    pub updatable: Vec<String>,
    #[serde(default)]
    pub timestamp_pair: bool,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub append_to: Option<String>,
    #[serde(default)]
    pub cleanup_root: Option<String>,
    #[serde(default)]
    pub redirect: Option<RedirectRule>,
    #[serde(default)]
    pub inline_body: Option<InlineBody>,
    #[serde(default)]
    pub navigation: Option<NavigationSpec>,
    #[serde(default)]
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    /// Minimal node, mostly useful for building trees in code.
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            query_fields: Vec::new(),
            attributes: Vec::new(),
            naming: NamingRule::Fallback,
            folder_field: None,
            json_file: false,
            script_files: Vec::new(),
            updatable: Vec::new(),
            timestamp_pair: false,
            order_by: None,
            filters: Vec::new(),
            append_to: None,
            cleanup_root: None,
            redirect: None,
            inline_body: None,
            navigation: None,
            children: Vec::new(),
        }
    }

    /// The `json` query parameter: `name:Type` pairs joined by commas.
    pub fn json_shape(&self) -> String {
        self.attributes
            .iter()
            .map(|a| format!("{}:{}", a.name, a.kind))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// List keys that child records append into this node's own JSON file.
    pub fn appended_list_keys(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|c| c.naming.lookup_target() == Some(self.record_type.as_str()))
            .filter_map(|c| c.append_to.clone())
            .collect()
    }

    /// Relative paths (without output root) whose newest mtime is the record's local time.
    pub fn tracked_files(&self, resolved_path: &str, script_extension: &str) -> Vec<String> {
        let mut files = Vec::new();
        if self.json_file {
            files.push(format!("{resolved_path}.json"));
        }
        for attribute in &self.script_files {
            files.push(script_file_path(resolved_path, attribute, script_extension));
        }
        files
    }

    /// A node with nothing updatable and no script files has nothing to send back.
    pub fn is_pushable(&self) -> bool {
        !self.updatable.is_empty() || !self.script_files.is_empty()
    }

    pub fn is_script_attribute(&self, key: &str) -> bool {
        self.script_files.iter().any(|s| s == key)
    }
}

pub fn script_file_path(resolved_path: &str, attribute: &str, extension: &str) -> String {
    format!("{resolved_path}.{attribute}.{extension}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SchemaTree {
    pub record_types: Vec<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("malformed attribute spec `{0}` (expected name:Type)")]
    MalformedAttribute(String),
    #[error("schema node has an empty record type")]
    EmptyRecordType,
    #[error("record type `{0}` declared twice among siblings")]
    DuplicateRecordType(String),
    #[error("{record_type}: lookup pattern `{pattern}` has no `record_type:` prefix")]
    MalformedLookup { record_type: String, pattern: String },
    #[error("{record_type}: lookup targets `{target}`, which is not an ancestor")]
    LookupTargetNotAncestor { record_type: String, target: String },
    #[error("{record_type}: {fields} query fields but {attributes} attributes")]
    AttributeCountMismatch {
        record_type: String,
        fields: usize,
        attributes: usize,
    },
    #[error("{0}: append_to requires json_file")]
    AppendWithoutJsonFile(String),
    #[error("{0}: pushable node must list `id` as updatable")]
    PushWithoutId(String),
    #[error("{0}: navigation indent range is empty")]
    InvalidIndentRange(String),
    #[error("{record_type}: {source}")]
    Template {
        record_type: String,
        source: TemplateError,
    },
}

impl SchemaTree {
    pub fn top_level(&self, record_type: &str) -> Option<&SchemaNode> {
        self.record_types.iter().find(|n| n.record_type == record_type)
    }

    pub fn record_type_names(&self) -> Vec<&str> {
        self.record_types.iter().map(|n| n.record_type.as_str()).collect()
    }

    /// Static checks run before any remote or file activity.
    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_siblings(&self.record_types, &mut Vec::new())
    }
}

fn validate_siblings<'a>(
    nodes: &'a [SchemaNode],
    ancestors: &mut Vec<&'a str>,
) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.record_type.as_str()) {
            return Err(SchemaError::DuplicateRecordType(node.record_type.clone()));
        }
        validate_node(node, ancestors)?;
        ancestors.push(node.record_type.as_str());
        let result = validate_siblings(&node.children, ancestors);
        ancestors.pop();
        result?;
    }
    Ok(())
}

fn validate_node(node: &SchemaNode, ancestors: &[&str]) -> Result<(), SchemaError> {
    let record_type = &node.record_type;
    if record_type.trim().is_empty() {
        return Err(SchemaError::EmptyRecordType);
    }
    if !node.attributes.is_empty() && node.attributes.len() != node.query_fields.len() {
        return Err(SchemaError::AttributeCountMismatch {
            record_type: record_type.clone(),
            fields: node.query_fields.len(),
            attributes: node.attributes.len(),
        });
    }
    let template_error = |source| SchemaError::Template {
        record_type: record_type.clone(),
        source,
    };
    match &node.naming {
        NamingRule::Template(template) => {
            parse_template(template).map_err(template_error)?;
        }
        NamingRule::Lookup(pattern) => {
            parse_template(pattern).map_err(template_error)?;
            let target = node
                .naming
                .lookup_target()
                .ok_or_else(|| SchemaError::MalformedLookup {
                    record_type: record_type.clone(),
                    pattern: pattern.clone(),
                })?;
            if !ancestors.contains(&target) {
                return Err(SchemaError::LookupTargetNotAncestor {
                    record_type: record_type.clone(),
                    target: target.to_string(),
                });
            }
        }
        NamingRule::Fallback => {}
    }
    if node.append_to.is_some() && !node.json_file {
        return Err(SchemaError::AppendWithoutJsonFile(record_type.clone()));
    }
    if node.is_pushable() && !node.updatable.iter().any(|u| u == "id") {
        return Err(SchemaError::PushWithoutId(record_type.clone()));
    }
    if let Some(nav) = &node.navigation {
        if nav.indent_from >= nav.indent_to {
            return Err(SchemaError::InvalidIndentRange(record_type.clone()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_type: String,
    pub attributes: Attributes,
    #[serde(default)]
    pub resolved_path: Option<String>,
    #[serde(default)]
    pub remote_timestamp: Option<NaiveDateTime>,
}

impl Record {
    pub fn new(record_type: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            record_type: record_type.into(),
            attributes,
            resolved_path: None,
            remote_timestamp: None,
        }
    }

    pub fn id(&self) -> Option<String> {
        self.attribute_text("id")
    }

    pub fn attribute_text(&self, key: &str) -> Option<String> {
        self.attributes.get(key).and_then(render_value)
    }

    /// `{record_type}:{id}`, the key children look their parent up by.
    pub fn registry_key(&self) -> Option<String> {
        self.id().map(|id| registry_key(&self.record_type, &id))
    }

    /// Attributes stored in the JSON file (script attributes live in their own files).
    pub fn json_attributes(&self, node: &SchemaNode) -> Attributes {
        self.attributes
            .iter()
            .filter(|(k, _)| !node.is_script_attribute(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

pub fn registry_key(record_type: &str, id: &str) -> String {
    format!("{record_type}:{id}")
}

/// Text form used in paths and keys; `None` for null.
pub fn render_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Template expansion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
    #[error("empty placeholder at byte {0}")]
    EmptyKey(usize),
    #[error("no value for placeholder `{0}`")]
    MissingAttribute(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Key(&'a str),
}

fn parse_template(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or(TemplateError::Unterminated(offset + start))?;
        let key = &after[..end];
        if key.is_empty() {
            return Err(TemplateError::EmptyKey(offset + start));
        }
        segments.push(Segment::Key(key));
        let consumed = start + 2 + end + 1;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// Expands every `${key}` with the matching attribute, left to right.
///
/// Keys match exactly, so `${id}` never bites into `${id_string}`. A missing
/// or null attribute fails the whole expansion.
pub fn expand_template(template: &str, attributes: &Attributes) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    for segment in parse_template(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Key(key) => {
                let value = attributes
                    .get(key)
                    .and_then(render_value)
                    .ok_or_else(|| TemplateError::MissingAttribute(key.to_string()))?;
                out.push_str(&value);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

const ILLEGAL_PATH_CHARS: &[char] = &['.', '$', ':', '"', '<', '>', '#', '%', '&', '{', '}', '!', '@'];

/// Replaces illegal filename characters and empty path segments with `_`.
pub fn sanitize_relative_path(path: &str) -> String {
    let replaced = path
        .chars()
        .map(|c| if ILLEGAL_PATH_CHARS.contains(&c) { '_' } else { c })
        .collect::<String>();
    replaced
        .split('/')
        .map(|segment| if segment.is_empty() { "_" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parses `YYYY-MM-DD hh:mm:ss` style values by their digit groups.
pub fn parse_remote_timestamp(text: &str) -> Option<NaiveDateTime> {
    let parts = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.len() < 3 {
        return None;
    }
    let part = |i: usize| parts.get(i).copied().unwrap_or(0);
    NaiveDate::from_ymd_opt(i32::try_from(part(0)).ok()?, part(1), part(2))?
        .and_hms_opt(part(3), part(4), part(5))
}

pub fn format_remote_timestamp(ts: NaiveDateTime) -> String {
    ts.format(REMOTE_TIMESTAMP_FORMAT).to_string()
}

/// `updated`, falling back to `registered`.
pub fn remote_timestamp_of(attributes: &Attributes) -> Option<NaiveDateTime> {
    ["updated", "registered"]
        .iter()
        .filter_map(|key| attributes.get(*key).and_then(JsonValue::as_str))
        .find(|s| !s.trim().is_empty())
        .and_then(parse_remote_timestamp)
}

pub fn floor_to_seconds(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NoRemoteDate,
    RemoteNewer,
    LocalNewer,
    Unchanged,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncState::NoRemoteDate => "no date in database",
            SyncState::RemoteNewer => "<== database",
            SyncState::LocalNewer => "==> database",
            SyncState::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Nothing,
    Report,
    Pull,
    Push,
}

/// Remote vs. newest local timestamp; local sub-second precision is dropped.
pub fn compare_timestamps(remote: Option<NaiveDateTime>, local: Option<NaiveDateTime>) -> SyncState {
    let Some(remote) = remote else {
        return SyncState::NoRemoteDate;
    };
    match local.map(floor_to_seconds) {
        None => SyncState::RemoteNewer,
        Some(local) if remote > local => SyncState::RemoteNewer,
        Some(local) if remote < local => SyncState::LocalNewer,
        Some(_) => SyncState::Unchanged,
    }
}

pub fn action_for(mode: Mode, state: SyncState) -> SyncAction {
    match mode {
        Mode::Status => SyncAction::Report,
        Mode::Get => SyncAction::Pull,
        Mode::Put => SyncAction::Push,
        Mode::Sync => match state {
            SyncState::NoRemoteDate => SyncAction::Report,
            SyncState::RemoteNewer => SyncAction::Pull,
            SyncState::LocalNewer => SyncAction::Push,
            SyncState::Unchanged => SyncAction::Nothing,
        },
    }
}
