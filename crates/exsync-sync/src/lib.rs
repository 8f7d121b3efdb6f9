//! Schema-driven traversal: fetch, resolve paths, compare timestamps, pull or push.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use exsync_adapters::{build_push_payload, FixtureRemoteSource, HttpRemoteSource, RemoteError, RemoteSource};
use exsync_core::{
    action_for, compare_timestamps, expand_template, remote_timestamp_of, sanitize_relative_path,
    script_file_path, Attributes, Mode, NamingRule, NavigationSpec, Record, SchemaError, SchemaNode,
    SchemaTree, SyncAction, SyncState, TemplateError, UnknownMode,
};
use exsync_storage::{
    remove_orphans, to_pretty_json, FileTree, HttpClientConfig, HttpTransport, KnownFiles,
    AggregationBuffer, WriteOutcome,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "exsync-sync";

pub const DEFAULT_RECORD_TYPES: &str = "ejscript";
pub const SCRIPT_EXTENSION: &str = "script";
pub const LEGACY_SCRIPT_EXTENSION: &str = "crmscript";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub endpoint: Option<String>,
    /// Raw mode text; parsed by [`SyncConfig::validate`].
    pub mode: Option<String>,
    pub record_types: Vec<String>,
    pub path_filter: String,
    pub output_root: PathBuf,
    pub verbosity: u8,
    pub clean_orphans: bool,
    pub no_push: bool,
    pub ignore_json_diff: bool,
    pub legacy_script_extension: bool,
    pub schema_path: PathBuf,
    /// Serve rows from a local fixture document instead of the endpoint.
    pub fixture: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

pub fn split_record_types(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `EXSYNC_*` keys resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            endpoint: lookup("EXSYNC_ENDPOINT").filter(|v| !v.trim().is_empty()),
            mode: lookup("EXSYNC_MODE"),
            record_types: split_record_types(
                &lookup("EXSYNC_TYPES").unwrap_or_else(|| DEFAULT_RECORD_TYPES.to_string()),
            ),
            path_filter: lookup("EXSYNC_PATH").unwrap_or_default(),
            output_root: lookup("EXSYNC_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            verbosity: lookup("EXSYNC_VERBOSITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            clean_orphans: flag(lookup("EXSYNC_CLEAN_ORPHANS")),
            no_push: flag(lookup("EXSYNC_NO_PUSH")),
            ignore_json_diff: flag(lookup("EXSYNC_IGNORE_JSON_DIFF")),
            legacy_script_extension: flag(lookup("EXSYNC_LEGACY_EXTENSION")),
            schema_path: lookup("EXSYNC_SCHEMA")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("schema.yaml")),
            fixture: lookup("EXSYNC_FIXTURE").map(PathBuf::from),
            http_timeout_secs: lookup("EXSYNC_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: lookup("EXSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("exsync/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn script_extension(&self) -> &'static str {
        if self.legacy_script_extension {
            LEGACY_SCRIPT_EXTENSION
        } else {
            SCRIPT_EXTENSION
        }
    }

    /// Usage checks that must pass before any fetch or push.
    pub fn validate(&self, schema: &SchemaTree) -> Result<RunPlan, ConfigError> {
        let mode = self
            .mode
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or(ConfigError::MissingMode)?
            .parse::<Mode>()?;
        if self.endpoint.is_none() && self.fixture.is_none() {
            return Err(ConfigError::MissingEndpoint);
        }
        if self.record_types.is_empty() {
            return Err(ConfigError::NoRecordTypes);
        }
        let nodes = self
            .record_types
            .iter()
            .map(|name| {
                schema
                    .top_level(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownRecordType {
                        name: name.clone(),
                        known: schema.record_type_names().join(", "),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RunPlan { mode, nodes })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no endpoint given (--url or EXSYNC_ENDPOINT)")]
    MissingEndpoint,
    #[error("no mode given (expected status, sync, get or put)")]
    MissingMode,
    #[error(transparent)]
    InvalidMode(#[from] UnknownMode),
    #[error("no record types selected")]
    NoRecordTypes,
    #[error("unknown record type `{name}` (known: {known})")]
    UnknownRecordType { name: String, known: String },
    #[error("reading schema {}: {source}", path.display())]
    SchemaRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing schema {}: {source}", path.display())]
    SchemaParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),
}

/// Validated invocation: the mode plus the selected top-level schema nodes, in order.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub mode: Mode,
    pub nodes: Vec<SchemaNode>,
}

pub fn parse_schema_tree(text: &str, origin: &Path) -> Result<SchemaTree, ConfigError> {
    let tree: SchemaTree = serde_yaml::from_str(text).map_err(|source| ConfigError::SchemaParse {
        path: origin.to_path_buf(),
        source,
    })?;
    tree.validate()?;
    Ok(tree)
}

pub async fn load_schema_tree(path: &Path) -> Result<SchemaTree, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::SchemaRead {
            path: path.to_path_buf(),
            source,
        })?;
    parse_schema_tree(&text, path)
}

// ---------------------------------------------------------------------------
// Path registry + path resolution
// ---------------------------------------------------------------------------

/// `{record_type}:{id}` -> resolved path, filled as records resolve; never pruned.
#[derive(Debug, Default, Clone)]
pub struct PathRegistry {
    paths: HashMap<String, String>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, path: String) {
        self.paths.insert(key, path);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.paths.get(key).map(String::as_str)
    }

}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("lookup key `{0}` is not registered")]
    UnregisteredKey(String),
    #[error("no redirect target for {attribute}={value}")]
    NoRedirectTarget { attribute: String, value: String },
    #[error("record has no `{0}` attribute")]
    MissingAttribute(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

fn redirect_target(node: &SchemaNode, record: &Record) -> Result<Option<String>, ResolveError> {
    let Some(rule) = &node.redirect else {
        return Ok(None);
    };
    let value = record
        .attribute_text(&rule.attribute)
        .ok_or_else(|| ResolveError::MissingAttribute(rule.attribute.clone()))?;
    if rule.passthrough.contains(&value) {
        return Ok(None);
    }
    match rule.targets.get(&value) {
        Some(target) => Ok(Some(target.clone())),
        None => Err(ResolveError::NoRedirectTarget {
            attribute: rule.attribute.clone(),
            value,
        }),
    }
}

/// Relative path for `record`: redirect, then template, lookup, or `{folder}/{name}`.
pub fn resolve_path(node: &SchemaNode, record: &Record, registry: &PathRegistry) -> Result<String, ResolveError> {
    let raw = match redirect_target(node, record)? {
        Some(target) => target,
        None => match &node.naming {
            NamingRule::Template(template) => expand_template(template, &record.attributes)?,
            NamingRule::Lookup(pattern) => {
                let key = expand_template(pattern, &record.attributes)?;
                registry
                    .get(&key)
                    .map(ToString::to_string)
                    .ok_or(ResolveError::UnregisteredKey(key))?
            }
            NamingRule::Fallback => {
                let part = |name: &str| {
                    record
                        .attribute_text(name)
                        .ok_or_else(|| ResolveError::MissingAttribute(name.to_string()))
                };
                format!("{}/{}", part("folder")?, part("name")?)
            }
        },
    };
    Ok(sanitize_relative_path(&raw))
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusLine {
    pub record_type: String,
    pub path: String,
    pub state: SyncState,
    pub action: SyncAction,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.<60}: {}", format!("* {} ", self.path), self.state)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedPush {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub pulled: Vec<String>,
    pub pushed: Vec<String>,
    pub statuses: Vec<StatusLine>,
    /// `record_type:id: reason` for each skipped record.
    pub unresolved: Vec<String>,
    /// Pushes assembled but not sent in no-push mode.
    pub withheld: Vec<String>,
    /// Locally newer records of nodes with nothing to push.
    pub read_only: Vec<String>,
    pub failed_pushes: Vec<FailedPush>,
    pub removed_orphans: Vec<PathBuf>,
    pub files_written: usize,
    pub files_unchanged: usize,
}

impl SyncSummary {
    fn count(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Written => self.files_written += 1,
            WriteOutcome::Unchanged => self.files_unchanged += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub path_filter: String,
    pub clean_orphans: bool,
    pub no_push: bool,
    pub ignore_json_diff: bool,
    pub script_extension: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            path_filter: String::new(),
            clean_orphans: false,
            no_push: false,
            ignore_json_diff: false,
            script_extension: SCRIPT_EXTENSION.to_string(),
        }
    }
}

impl From<&SyncConfig> for EngineOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            path_filter: config.path_filter.clone(),
            clean_orphans: config.clean_orphans,
            no_push: config.no_push,
            ignore_json_diff: config.ignore_json_diff,
            script_extension: config.script_extension().to_string(),
        }
    }
}

/// Owns the per-run registries and walks one schema tree at a time.
pub struct SyncEngine {
    mode: Mode,
    options: EngineOptions,
    tree: FileTree,
    remote: Box<dyn RemoteSource>,
    registry: PathRegistry,
    buffer: AggregationBuffer,
    known: KnownFiles,
    /// Documents whose mtime is settled this run; list appends do not move it.
    pinned: HashSet<PathBuf>,
    summary: SyncSummary,
}

impl SyncEngine {
    pub fn new(mode: Mode, options: EngineOptions, tree: FileTree, remote: Box<dyn RemoteSource>) -> Self {
        Self {
            mode,
            options,
            tree,
            remote,
            registry: PathRegistry::new(),
            buffer: AggregationBuffer::new(),
            known: KnownFiles::new(),
            pinned: HashSet::new(),
            summary: SyncSummary::default(),
        }
    }

    /// Walks each top-level node in order and returns the run summary.
    pub async fn run(&mut self, nodes: &[SchemaNode]) -> Result<SyncSummary> {
        for node in nodes {
            let span = info_span!("record_type", record_type = %node.record_type, mode = %self.mode);
            self.run_top_level(node).instrument(span).await?;
        }
        Ok(std::mem::take(&mut self.summary))
    }

    async fn run_top_level(&mut self, node: &SchemaNode) -> Result<()> {
        let filter = self.options.path_filter.clone();
        self.visit(node, &filter).await?;

        for (path, outcome) in self.tree.flush(&mut self.buffer, &mut self.known).await? {
            debug!(path = %path.display(), ?outcome, "aggregate written");
            self.summary.count(outcome);
        }
        self.pinned.clear();

        if self.mode == Mode::Get && self.options.clean_orphans {
            if let Some(root) = &node.cleanup_root {
                let removed = remove_orphans(&self.tree.absolute(root), &self.known)?;
                info!(count = removed.len(), root = %root, "orphan cleanup done");
                self.summary.removed_orphans.extend(removed);
            }
        }
        Ok(())
    }

    #[async_recursion]
    async fn visit(&mut self, node: &SchemaNode, path_filter: &str) -> Result<()> {
        let records = self
            .remote
            .fetch(node, path_filter)
            .await
            .with_context(|| format!("fetching {}", node.record_type))?;
        info!(record_type = %node.record_type, count = records.len(), "fetched records");

        for mut record in records {
            let path = match resolve_path(node, &record, &self.registry) {
                Ok(path) => path,
                Err(err) => {
                    let id = record.id().unwrap_or_else(|| "?".to_string());
                    warn!(record_type = %node.record_type, %id, error = %err, "skipping unresolved record");
                    self.summary
                        .unresolved
                        .push(format!("{}:{id}: {err}", node.record_type));
                    continue;
                }
            };
            if let Some(key) = record.registry_key() {
                self.registry.insert(key, path.clone());
            }
            record.resolved_path = Some(path);
            if node.timestamp_pair {
                record.remote_timestamp = remote_timestamp_of(&record.attributes);
            }
            self.check(node, &record).await?;
        }

        for child in &node.children {
            self.visit(child, path_filter).await?;
        }
        Ok(())
    }

    async fn check(&mut self, node: &SchemaNode, record: &Record) -> Result<()> {
        let path = record.resolved_path.clone().unwrap_or_default();
        let files = node
            .tracked_files(&path, &self.options.script_extension)
            .iter()
            .map(|f| self.tree.absolute(f))
            .collect::<Vec<_>>();
        let local = self.tree.newest_mtime(&files).await?;
        let state = compare_timestamps(record.remote_timestamp, local);
        let action = action_for(self.mode, state);
        debug!(%path, %state, ?action, "compared");
        self.summary.statuses.push(StatusLine {
            record_type: node.record_type.clone(),
            path: path.clone(),
            state,
            action,
        });

        match action {
            SyncAction::Nothing | SyncAction::Report => {}
            SyncAction::Pull => {
                self.pull(node, record, &path).await?;
                self.summary.pulled.push(path);
            }
            SyncAction::Push => self.push(node, record, &path, local).await?,
        }
        Ok(())
    }

    async fn pull(&mut self, node: &SchemaNode, record: &Record, path: &str) -> Result<()> {
        let ts = record.remote_timestamp;
        let ext = self.options.script_extension.clone();

        if let Some(inline) = &node.inline_body {
            if record.attribute_text(&inline.marker_attribute).as_deref() == Some(inline.marker.as_str()) {
                if let Some(body) = record.attribute_text(&inline.value_attribute).filter(|b| !b.is_empty()) {
                    let script_path = script_file_path(path, &inline.script_name, &ext);
                    self.write_standalone(&script_path, &body, ts, false).await?;
                }
                return Ok(());
            }
        }

        if node.json_file {
            let json = record.json_attributes(node);
            let json_path = format!("{path}.json");
            match &node.append_to {
                Some(key) => self.append_to_list(&json_path, key, json, ts).await?,
                None if !node.appended_list_keys().is_empty() => {
                    self.seed_document(&json_path, json, ts).await?
                }
                None => {
                    let content = to_pretty_json(&json)?;
                    self.write_standalone(&json_path, &content, ts, true).await?;
                }
            }
            if let Some(nav) = &node.navigation {
                self.append_navigation(nav, record, path, ts)?;
            }
        }

        for attribute in &node.script_files {
            if let Some(content) = record.attribute_text(attribute).filter(|c| !c.is_empty()) {
                self.write_standalone(&script_file_path(path, attribute, &ext), &content, ts, false)
                    .await?;
            }
        }
        Ok(())
    }

    async fn write_standalone(
        &mut self,
        relative: &str,
        content: &str,
        ts: Option<chrono::NaiveDateTime>,
        is_json: bool,
    ) -> Result<()> {
        let path = self.tree.absolute(relative);
        let outcome = if is_json && self.options.ignore_json_diff && self.tree.exists(&path).await? {
            WriteOutcome::Unchanged
        } else {
            self.tree.write_if_changed(&path, content).await?
        };
        if let Some(ts) = ts {
            self.tree.stamp_mtime(&path, ts)?;
        }
        debug!(path = %path.display(), ?outcome, "materialized");
        self.known.insert(&path);
        self.summary.count(outcome);
        Ok(())
    }

    /// Buffers a JSON file that children append lists into; written at flush.
    async fn seed_document(
        &mut self,
        relative: &str,
        json: Attributes,
        ts: Option<chrono::NaiveDateTime>,
    ) -> Result<()> {
        let path = self.tree.absolute(relative);
        if self.options.ignore_json_diff && self.tree.exists(&path).await? {
            let content = to_pretty_json(&json)?;
            return self.write_standalone(relative, &content, ts, true).await;
        }
        self.buffer.seed_document(path.clone(), json, ts)?;
        self.pinned.insert(path);
        Ok(())
    }

    async fn append_to_list(
        &mut self,
        relative: &str,
        key: &str,
        entry: Attributes,
        ts: Option<chrono::NaiveDateTime>,
    ) -> Result<()> {
        let path = self.tree.absolute(relative);
        let mut seed = Attributes::new();
        if self.buffer.get(&path).is_none() {
            if self.tree.exists(&path).await? {
                let text = self.tree.read_to_string(&path).await?;
                match serde_json::from_str::<JsonValue>(&text) {
                    Ok(JsonValue::Object(existing)) => seed = existing,
                    _ => warn!(path = %path.display(), "existing file is not a json object, starting empty"),
                }
            }
            if self.known.contains(&path) {
                self.pinned.insert(path.clone());
                let pinned_ts = self.tree.modified(&path).await?;
                self.buffer
                    .append_to_list(path, key, JsonValue::Object(entry), pinned_ts, || seed)?;
                return Ok(());
            }
        }
        let contribution = if self.pinned.contains(&path) { None } else { ts };
        self.buffer
            .append_to_list(path, key, JsonValue::Object(entry), contribution, || seed)?;
        Ok(())
    }

    fn append_navigation(
        &mut self,
        nav: &NavigationSpec,
        record: &Record,
        path: &str,
        ts: Option<chrono::NaiveDateTime>,
    ) -> Result<()> {
        let record_path = Path::new(path);
        let dir = record_path.parent().unwrap_or_else(|| Path::new(""));
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = record_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let nav_path = self.tree.absolute(dir.join(&nav.file));

        let category = record.attributes.get(&nav.category_attribute).and_then(|v| match v {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        let (content, indent) = self.buffer.navigation(nav_path, &nav.header, ts)?;

        if category.is_some_and(|c| nav.closes_level(c)) {
            *indent = indent.saturating_sub(1);
            return Ok(());
        }
        let label = match category {
            Some(c) => nav.label_for(c),
            None => record.attribute_text(&nav.category_attribute).unwrap_or_default(),
        };
        let name = record
            .attribute_text(&nav.name_attribute)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "(no name)".to_string());
        content.push_str(&format!(
            "{}{label}: {name} <a href='./{dir_name}/{base}.json'></a><br>\r\n",
            "    ".repeat(*indent)
        ));
        if category.is_some_and(|c| nav.opens_level(c)) {
            *indent += 1;
        }
        Ok(())
    }

    async fn push(
        &mut self,
        node: &SchemaNode,
        record: &Record,
        path: &str,
        local: Option<chrono::NaiveDateTime>,
    ) -> Result<()> {
        if !node.is_pushable() {
            debug!(%path, "nothing updatable, not pushed");
            self.summary.read_only.push(path.to_string());
            return Ok(());
        }
        let payload = match build_push_payload(node, record, &self.tree, &self.options.script_extension, local).await {
            Ok(payload) => payload,
            Err(err @ (RemoteError::MissingScriptFile { .. } | RemoteError::MissingId { .. })) => {
                warn!(%path, error = %err, "push skipped");
                self.summary.failed_pushes.push(FailedPush {
                    path: path.to_string(),
                    reason: err.to_string(),
                });
                return Ok(());
            }
            Err(err) => return Err(err).with_context(|| format!("assembling push for {path}")),
        };

        if self.options.no_push {
            info!(%path, fields = payload.len(), "no-push mode, payload not sent");
            self.summary.withheld.push(path.to_string());
            return Ok(());
        }
        self.remote
            .push(node, &payload)
            .await
            .with_context(|| format!("pushing {path}"))?;
        info!(%path, "pushed");
        self.summary.pushed.push(path.to_string());
        Ok(())
    }
}

fn build_remote(config: &SyncConfig) -> Result<Box<dyn RemoteSource>> {
    if let Some(fixture) = &config.fixture {
        info!(fixture = %fixture.display(), "serving rows from fixture");
        return Ok(Box::new(FixtureRemoteSource::load(fixture)?));
    }
    let endpoint = config.endpoint.clone().ok_or(ConfigError::MissingEndpoint)?;
    let transport = HttpTransport::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    Ok(Box::new(HttpRemoteSource::new(endpoint, transport)?))
}

/// Loads the schema, validates the invocation, and runs it to completion.
pub async fn run_from_config(config: &SyncConfig) -> Result<(Mode, SyncSummary)> {
    let schema = load_schema_tree(&config.schema_path).await?;
    let plan = config.validate(&schema)?;
    let remote = build_remote(config)?;
    let mut engine = SyncEngine::new(
        plan.mode,
        EngineOptions::from(config),
        FileTree::new(config.output_root.clone()),
        remote,
    );
    let summary = engine.run(&plan.nodes).await?;
    info!(
        pulled = summary.pulled.len(),
        pushed = summary.pushed.len(),
        read_only = summary.read_only.len(),
        unresolved = summary.unresolved.len(),
        written = summary.files_written,
        unchanged = summary.files_unchanged,
        "run finished"
    );
    Ok((plan.mode, summary))
}

pub async fn run_from_env() -> Result<(Mode, SyncSummary)> {
    run_from_config(&SyncConfig::from_env()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use exsync_core::RedirectRule;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record(record_type: &str, value: JsonValue) -> Record {
        Record::new(record_type, value.as_object().cloned().unwrap())
    }

    fn schema() -> SchemaTree {
        parse_schema_tree(
            r#"
record_types:
  - record_type: ejscript
    query_fields: [id, name]
    naming:
      template: "ejscript/${name}"
  - record_type: screen_chooser
    query_fields: [id]
"#,
            Path::new("inline.yaml"),
        )
        .unwrap()
    }

    fn config(pairs: &[(&str, &str)]) -> SyncConfig {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SyncConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn config_defaults_follow_documented_values() {
        let cfg = config(&[]);
        assert_eq!(cfg.record_types, vec!["ejscript"]);
        assert_eq!(cfg.output_root, PathBuf::from("."));
        assert_eq!(cfg.verbosity, 1);
        assert_eq!(cfg.script_extension(), "script");
        assert!(!cfg.clean_orphans && !cfg.no_push && !cfg.ignore_json_diff);

        let legacy = config(&[("EXSYNC_LEGACY_EXTENSION", "1"), ("EXSYNC_TYPES", " a, ,b ")]);
        assert_eq!(legacy.script_extension(), "crmscript");
        assert_eq!(legacy.record_types, vec!["a", "b"]);
    }

    #[test]
    fn usage_errors_are_caught_before_any_io() {
        let schema = schema();
        let err = config(&[("EXSYNC_ENDPOINT", "https://x")]).validate(&schema).unwrap_err();
        assert!(matches!(err, ConfigError::MissingMode));

        let err = config(&[("EXSYNC_ENDPOINT", "https://x"), ("EXSYNC_MODE", "pull")])
            .validate(&schema)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMode(_)));

        let err = config(&[("EXSYNC_MODE", "get")]).validate(&schema).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEndpoint));

        let err = config(&[("EXSYNC_ENDPOINT", "https://x"), ("EXSYNC_MODE", "get"), ("EXSYNC_TYPES", "nope")])
            .validate(&schema)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRecordType { ref name, .. } if name == "nope"));

        let plan = config(&[
            ("EXSYNC_ENDPOINT", "https://x"),
            ("EXSYNC_MODE", "sync"),
            ("EXSYNC_TYPES", "screen_chooser,ejscript"),
        ])
        .validate(&schema)
        .unwrap();
        assert_eq!(plan.mode, Mode::Sync);
        let names: Vec<_> = plan.nodes.iter().map(|n| n.record_type.as_str()).collect();
        assert_eq!(names, vec!["screen_chooser", "ejscript"]);
    }

    #[test]
    fn invalid_schema_is_rejected_at_load() {
        let err = parse_schema_tree(
            r#"
record_types:
  - record_type: orphan
    query_fields: [id]
    naming:
      lookup: "elsewhere:${id}"
"#,
            Path::new("bad.yaml"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Schema(SchemaError::LookupTargetNotAncestor { .. })));
        assert!(parse_schema_tree("record_types: [", Path::new("broken.yaml")).is_err());
    }

    #[test]
    fn resolution_follows_precedence_and_sanitizes() {
        let mut registry = PathRegistry::new();
        registry.insert("parent:7".into(), "p/seven".into());

        let mut node = SchemaNode::new("child");
        node.naming = NamingRule::Template("t/${folder}/${name}/${name}".into());
        let rec = record("child", json!({"id": 5, "folder": "A/B", "name": "X"}));
        assert_eq!(resolve_path(&node, &rec, &registry).unwrap(), "t/A/B/X/X");

        node.naming = NamingRule::Lookup("parent:${parent}".into());
        let rec = record("child", json!({"id": 1, "parent": 7}));
        assert_eq!(resolve_path(&node, &rec, &registry).unwrap(), "p/seven");
        let rec = record("child", json!({"id": 1, "parent": 8}));
        assert_eq!(
            resolve_path(&node, &rec, &registry).unwrap_err(),
            ResolveError::UnregisteredKey("parent:8".into())
        );

        node.naming = NamingRule::Fallback;
        let rec = record("child", json!({"id": 1, "folder": "f:x", "name": "n"}));
        assert_eq!(resolve_path(&node, &rec, &registry).unwrap(), "f_x/n");
        let rec = record("child", json!({"id": 1, "folder": "f"}));
        assert!(matches!(
            resolve_path(&node, &rec, &registry),
            Err(ResolveError::MissingAttribute(_))
        ));
    }

    #[test]
    fn redirect_bypasses_parent_lookup() {
        let mut node = SchemaNode::new("extra_fields");
        node.naming = NamingRule::Lookup("extra_tables:${extra_table}".into());
        node.redirect = Some(RedirectRule {
            attribute: "domain".into(),
            passthrough: vec!["16".into()],
            targets: BTreeMap::from([("2".to_string(), "extra_tables/contact".to_string())]),
        });
        let registry = PathRegistry::new();

        let redirected = record("extra_fields", json!({"id": 1, "domain": 2, "extra_table": 0}));
        assert_eq!(resolve_path(&node, &redirected, &registry).unwrap(), "extra_tables/contact");

        let passthrough = record("extra_fields", json!({"id": 2, "domain": 16, "extra_table": 4}));
        assert_eq!(
            resolve_path(&node, &passthrough, &registry).unwrap_err(),
            ResolveError::UnregisteredKey("extra_tables:4".into())
        );

        let unmapped = record("extra_fields", json!({"id": 3, "domain": 1024}));
        assert!(matches!(
            resolve_path(&node, &unmapped, &registry),
            Err(ResolveError::NoRedirectTarget { .. })
        ));
    }

    #[test]
    fn status_line_pads_like_a_report() {
        let line = StatusLine {
            record_type: "ejscript".into(),
            path: "ejscript/a".into(),
            state: SyncState::Unchanged,
            action: SyncAction::Report,
        };
        let text = line.to_string();
        assert!(text.starts_with("* ejscript/a ...."));
        assert!(text.ends_with(": unchanged"));
        assert_eq!(text.find(": unchanged"), Some(60));
    }
}
