//! Local file tree I/O + authenticated HTTP transport for exsync.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Local, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "exsync-storage";

// ---------------------------------------------------------------------------
// File tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct FileTree {
    root: PathBuf,
}

impl FileTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `root/relative`, with `.` and `..` folded away so paths compare equal
    /// to what a directory walk yields.
    pub fn absolute(&self, relative: impl AsRef<Path>) -> PathBuf {
        normalize_lexically(&self.root.join(relative))
    }

    pub async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))
    }

    pub async fn read_to_string(&self, path: &Path) -> anyhow::Result<String> {
        fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    /// Writes `content` unless the file already holds the same text modulo line endings.
    pub async fn write_if_changed(&self, path: &Path, content: &str) -> anyhow::Result<WriteOutcome> {
        if self.exists(path).await? {
            let existing = self.read_to_string(path).await?;
            if normalize_line_endings(&existing) == normalize_line_endings(content) {
                return Ok(WriteOutcome::Unchanged);
            }
        }
        self.write_atomic(path, content.as_bytes()).await?;
        Ok(WriteOutcome::Written)
    }

    /// Temp-file + rename so readers never observe a half-written file.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            });
        }
        Ok(())
    }

    /// Sets the file's modification time to a local wall-clock timestamp.
    pub fn stamp_mtime(&self, path: &Path, timestamp: NaiveDateTime) -> anyhow::Result<()> {
        let when = local_to_system_time(timestamp);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("opening {} to set mtime", path.display()))?;
        file.set_modified(when)
            .with_context(|| format!("setting mtime on {}", path.display()))
    }

    pub async fn modified(&self, path: &Path) -> anyhow::Result<Option<NaiveDateTime>> {
        match fs::metadata(path).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .with_context(|| format!("reading mtime of {}", path.display()))?;
                Ok(Some(system_time_to_local(modified)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
        }
    }

    /// Newest mtime among the existing files in `paths`.
    pub async fn newest_mtime(&self, paths: &[PathBuf]) -> anyhow::Result<Option<NaiveDateTime>> {
        let mut newest = None;
        for path in paths {
            if let Some(modified) = self.modified(path).await? {
                newest = newest.max(Some(modified));
            }
        }
        Ok(newest)
    }

    /// Writes every buffered aggregate once and records it as known.
    pub async fn flush(
        &self,
        buffer: &mut AggregationBuffer,
        known: &mut KnownFiles,
    ) -> anyhow::Result<Vec<(PathBuf, WriteOutcome)>> {
        let mut outcomes = Vec::new();
        for (path, entry) in buffer.drain() {
            let content = entry.payload.render()?;
            let outcome = self.write_if_changed(&path, &content).await?;
            if let Some(ts) = entry.timestamp {
                self.stamp_mtime(&path, ts)?;
            }
            debug!(path = %path.display(), ?outcome, "flushed aggregate");
            known.insert(path.clone());
            outcomes.push((path, outcome));
        }
        Ok(outcomes)
    }
}

pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
}

pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Local wall clock to an instant.
///
/// A repeated hour takes its earlier instant. A time inside a DST gap is read
/// with the offset in force a day before, which lands as far past the gap as
/// it was into it; UTC is the last resort.
pub fn local_to_system_time(timestamp: NaiveDateTime) -> SystemTime {
    match Local.from_local_datetime(&timestamp) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.into(),
        LocalResult::None => {
            warn!(%timestamp, "timestamp falls in a local time gap, shifting past it");
            timestamp
                .checked_sub_signed(chrono::Duration::days(1))
                .and_then(|day_before| Local.from_local_datetime(&day_before).earliest())
                .and_then(|day_before| day_before.offset().fix().from_local_datetime(&timestamp).single())
                .map(SystemTime::from)
                .unwrap_or_else(|| Utc.from_utc_datetime(&timestamp).into())
        }
    }
}

pub fn system_time_to_local(time: SystemTime) -> NaiveDateTime {
    DateTime::<Local>::from(time).naive_local()
}

/// Pretty JSON with four-space indentation.
pub fn to_pretty_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .context("serializing json document")?;
    String::from_utf8(out).context("json output is not utf-8")
}

// ---------------------------------------------------------------------------
// Aggregation buffer + known files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatePayload {
    /// JSON object accumulating one or more named lists.
    Document {
        object: JsonMap<String, JsonValue>,
        started_keys: HashSet<String>,
    },
    /// Indentation-formatted text index.
    Navigation { content: String, indent: usize },
}

impl AggregatePayload {
    pub fn render(&self) -> anyhow::Result<String> {
        match self {
            AggregatePayload::Document { object, .. } => to_pretty_json(object),
            AggregatePayload::Navigation { content, .. } => Ok(content.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub payload: AggregatePayload,
    pub timestamp: Option<NaiveDateTime>,
}

impl AggregateEntry {
    fn touch(&mut self, timestamp: Option<NaiveDateTime>) {
        self.timestamp = self.timestamp.max(timestamp);
    }
}

#[derive(Debug, Default)]
pub struct AggregationBuffer {
    entries: BTreeMap<PathBuf, AggregateEntry>,
}

impl AggregationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, path: &Path) -> Option<&AggregateEntry> {
        self.entries.get(path)
    }

    /// Appends `entry` to the list `key` of the document at `path`.
    ///
    /// `seed` supplies the document's starting object the first time the path
    /// is seen. The list under `key` starts empty on its first append of the run.
    pub fn append_to_list(
        &mut self,
        path: PathBuf,
        key: &str,
        entry: JsonValue,
        timestamp: Option<NaiveDateTime>,
        seed: impl FnOnce() -> JsonMap<String, JsonValue>,
    ) -> anyhow::Result<()> {
        let slot = self.entries.entry(path.clone()).or_insert_with(|| AggregateEntry {
            payload: AggregatePayload::Document {
                object: seed(),
                started_keys: HashSet::new(),
            },
            timestamp: None,
        });
        slot.touch(timestamp);
        let AggregatePayload::Document {
            object,
            started_keys,
        } = &mut slot.payload
        else {
            anyhow::bail!("{} is buffered as a navigation file", path.display());
        };
        if started_keys.insert(key.to_string()) {
            object.insert(key.to_string(), JsonValue::Array(Vec::new()));
        }
        match object.get_mut(key) {
            Some(JsonValue::Array(list)) => list.push(entry),
            _ => anyhow::bail!("{}: `{key}` is not a list", path.display()),
        }
        Ok(())
    }

    /// Buffers `object` as the whole document at `path`.
    ///
    /// Lists appended later are merged into it, so the file is written once at
    /// flush. A second seed for the same path replaces the first.
    pub fn seed_document(
        &mut self,
        path: PathBuf,
        object: JsonMap<String, JsonValue>,
        timestamp: Option<NaiveDateTime>,
    ) -> anyhow::Result<()> {
        if let Some(AggregateEntry {
            payload: AggregatePayload::Navigation { .. },
            ..
        }) = self.entries.get(&path)
        {
            anyhow::bail!("{} is buffered as a navigation file", path.display());
        }
        self.entries.insert(
            path,
            AggregateEntry {
                payload: AggregatePayload::Document {
                    object,
                    started_keys: HashSet::new(),
                },
                timestamp,
            },
        );
        Ok(())
    }

    /// Navigation text buffer for `path`, created with `header` on first use.
    pub fn navigation(
        &mut self,
        path: PathBuf,
        header: &str,
        timestamp: Option<NaiveDateTime>,
    ) -> anyhow::Result<(&mut String, &mut usize)> {
        let slot = self.entries.entry(path.clone()).or_insert_with(|| AggregateEntry {
            payload: AggregatePayload::Navigation {
                content: header.to_string(),
                indent: 0,
            },
            timestamp: None,
        });
        slot.touch(timestamp);
        match &mut slot.payload {
            AggregatePayload::Navigation { content, indent } => Ok((content, indent)),
            AggregatePayload::Document { .. } => {
                anyhow::bail!("{} is buffered as a json document", path.display())
            }
        }
    }

    pub fn drain(&mut self) -> Vec<(PathBuf, AggregateEntry)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}

/// Absolute paths confirmed written or unchanged during this run.
#[derive(Debug, Default, Clone)]
pub struct KnownFiles {
    paths: HashSet<PathBuf>,
}

impl KnownFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl AsRef<Path>) -> bool {
        self.paths.insert(normalize_lexically(path.as_ref()))
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.paths.contains(&normalize_lexically(path.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Deletes every file under `cleanup_root` that is not in `known`.
pub fn remove_orphans(cleanup_root: &Path, known: &KnownFiles) -> anyhow::Result<Vec<PathBuf>> {
    if !cleanup_root.exists() {
        return Ok(Vec::new());
    }
    let mut orphans: Vec<PathBuf> = walkdir::WalkDir::new(cleanup_root)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("walking {}", cleanup_root.display()))?
        .into_iter()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| normalize_lexically(entry.path()))
        .filter(|path| !known.contains(path))
        .collect();
    orphans.sort();

    for path in &orphans {
        std::fs::remove_file(path).with_context(|| format!("removing orphan {}", path.display()))?;
        info!(path = %path.display(), "removed orphan file");
    }
    Ok(orphans)
}

// ---------------------------------------------------------------------------
// Authenticated HTTP transport
// ---------------------------------------------------------------------------

const NTLM_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const NTLM_NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NTLM_NEGOTIATE_OEM: u32 = 0x0000_0002;
const NTLM_REQUEST_TARGET: u32 = 0x0000_0004;
const NTLM_NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NTLM_NEGOTIATE_ANONYMOUS: u32 = 0x0000_0800;
const NTLM_ALWAYS_SIGN: u32 = 0x0000_8000;
const NTLM_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("authentication rejected for {url}")]
    Unauthorized { url: String },
    #[error("malformed authentication challenge: {0}")]
    Challenge(String),
    #[error("response from {url} is not json: {source}")]
    Json {
        url: String,
        source: serde_json::Error,
    },
}

/// Server challenge carried by an NTLM type 2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmChallenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

/// Produces the client side of the challenge-response handshake.
pub trait HandshakeResponder: Send + Sync + fmt::Debug {
    fn negotiate(&self) -> Vec<u8>;
    fn authenticate(&self, challenge: &NtlmChallenge) -> Vec<u8>;
}

/// Anonymous NTLM: empty credentials, for proxies that only want the handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousResponder;

impl HandshakeResponder for AnonymousResponder {
    fn negotiate(&self) -> Vec<u8> {
        let flags = NTLM_NEGOTIATE_UNICODE
            | NTLM_NEGOTIATE_OEM
            | NTLM_REQUEST_TARGET
            | NTLM_NEGOTIATE_NTLM
            | NTLM_ALWAYS_SIGN
            | NTLM_EXTENDED_SESSION_SECURITY;
        let mut msg = Vec::with_capacity(32);
        msg.extend_from_slice(NTLM_SIGNATURE);
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&flags.to_le_bytes());
        // empty domain + workstation security buffers
        msg.extend_from_slice(&[0u8; 16]);
        msg
    }

    fn authenticate(&self, challenge: &NtlmChallenge) -> Vec<u8> {
        const HEADER_LEN: u32 = 64;
        let flags = (challenge.flags
            & (NTLM_NEGOTIATE_UNICODE
                | NTLM_NEGOTIATE_NTLM
                | NTLM_ALWAYS_SIGN
                | NTLM_EXTENDED_SESSION_SECURITY))
            | NTLM_NEGOTIATE_ANONYMOUS;
        let lm_response = [0u8; 1];

        let mut msg = Vec::with_capacity(HEADER_LEN as usize + lm_response.len());
        msg.extend_from_slice(NTLM_SIGNATURE);
        msg.extend_from_slice(&3u32.to_le_bytes());
        push_security_buffer(&mut msg, lm_response.len() as u16, HEADER_LEN);
        let after_lm = HEADER_LEN + lm_response.len() as u32;
        // nt response, domain, user, workstation, session key: all empty
        for _ in 0..5 {
            push_security_buffer(&mut msg, 0, after_lm);
        }
        msg.extend_from_slice(&flags.to_le_bytes());
        msg.extend_from_slice(&lm_response);
        msg
    }
}

fn push_security_buffer(msg: &mut Vec<u8>, len: u16, offset: u32) {
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&offset.to_le_bytes());
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn parse_ntlm_challenge(bytes: &[u8]) -> Result<NtlmChallenge, TransportError> {
    let malformed = |why: &str| TransportError::Challenge(why.to_string());
    if bytes.len() < 32 || &bytes[..8] != NTLM_SIGNATURE {
        return Err(malformed("missing NTLMSSP signature"));
    }
    if read_u32(bytes, 8) != Some(2) {
        return Err(malformed("not a type 2 message"));
    }
    let flags = read_u32(bytes, 20).ok_or_else(|| malformed("truncated flags"))?;
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&bytes[24..32]);

    let mut target_info = Vec::new();
    if bytes.len() >= 48 {
        let len = read_u16(bytes, 40).unwrap_or(0) as usize;
        let offset = read_u32(bytes, 44).unwrap_or(0) as usize;
        if len > 0 {
            target_info = bytes
                .get(offset..offset + len)
                .ok_or_else(|| malformed("target info out of bounds"))?
                .to_vec();
        }
    }
    Ok(NtlmChallenge {
        flags,
        server_challenge,
        target_info,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unauthenticated,
    NegotiateSent,
    AuthenticateSent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    SendNegotiate { scheme: String },
    SendAuthenticate { scheme: String, token: Vec<u8> },
    GiveUp,
}

/// Decides the reply to a 401 given the `WWW-Authenticate` values it carried.
///
/// A 401 after the final authenticate message is never retried.
pub fn next_handshake_step(state: HandshakeState, challenges: &[String]) -> HandshakeStep {
    if state == HandshakeState::AuthenticateSent {
        return HandshakeStep::GiveUp;
    }
    let offered = challenges.iter().filter_map(|value| {
        let value = value.trim();
        let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
        let known = scheme.eq_ignore_ascii_case("NTLM") || scheme.eq_ignore_ascii_case("Negotiate");
        known.then(|| (scheme.to_string(), token.trim().to_string()))
    });

    let mut negotiate_scheme = None;
    for (scheme, token) in offered {
        if !token.is_empty() {
            if let Ok(token) = BASE64.decode(token.as_bytes()) {
                return HandshakeStep::SendAuthenticate { scheme, token };
            }
        } else if negotiate_scheme.is_none() {
            negotiate_scheme = Some(scheme);
        }
    }
    match (state, negotiate_scheme) {
        (HandshakeState::Unauthenticated, Some(scheme)) => HandshakeStep::SendNegotiate { scheme },
        _ => HandshakeStep::GiveUp,
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn json(&self) -> Result<JsonValue, TransportError> {
        serde_json::from_slice(&self.body).map_err(|source| TransportError::Json {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    responder: Box<dyn HandshakeResponder>,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Self::with_responder(config, Box::new(AnonymousResponder))
    }

    pub fn with_responder(
        config: HttpClientConfig,
        responder: Box<dyn HandshakeResponder>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, responder })
    }

    pub async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        self.execute(url, |client| client.get(url))
            .instrument(info_span!("http_get", url))
            .await
    }

    pub async fn post_json(
        &self,
        url: &str,
        payload: &JsonValue,
    ) -> Result<TransportResponse, TransportError> {
        self.execute(url, |client| client.post(url).json(payload))
            .instrument(info_span!("http_post", url))
            .await
    }

    /// Sends the request, answering at most one handshake round.
    async fn execute<F>(&self, url: &str, build: F) -> Result<TransportResponse, TransportError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut state = HandshakeState::Unauthenticated;
        let mut authorization: Option<String> = None;

        loop {
            let mut request = build(&self.client);
            if let Some(value) = &authorization {
                request = request.header(AUTHORIZATION, value);
            }
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if status == StatusCode::UNAUTHORIZED {
                let challenges = resp
                    .headers()
                    .get_all(WWW_AUTHENTICATE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>();
                // drain so the connection the handshake is bound to stays usable
                let _ = resp.bytes().await;

                match next_handshake_step(state, &challenges) {
                    HandshakeStep::SendNegotiate { scheme } => {
                        debug!(%scheme, "answering auth challenge with negotiate message");
                        authorization =
                            Some(format!("{scheme} {}", BASE64.encode(self.responder.negotiate())));
                        state = HandshakeState::NegotiateSent;
                    }
                    HandshakeStep::SendAuthenticate { scheme, token } => {
                        let challenge = parse_ntlm_challenge(&token)?;
                        debug!(%scheme, "answering server challenge with authenticate message");
                        authorization = Some(format!(
                            "{scheme} {}",
                            BASE64.encode(self.responder.authenticate(&challenge))
                        ));
                        state = HandshakeState::AuthenticateSent;
                    }
                    HandshakeStep::GiveUp => {
                        return Err(TransportError::Unauthorized {
                            url: url.to_string(),
                        })
                    }
                }
                continue;
            }

            if !status.is_success() {
                return Err(TransportError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            return Ok(TransportResponse {
                status,
                final_url,
                body,
            });
        }
    }
}
