//! Snapshot Writer (C2): best-effort, fire-and-forget phase artifacts keyed
//! by request id and entry dialect, with sensitive-header masking and a
//! periodic TTL sweep. Mirrors the single-sink-interface design called for
//! in the redesign notes: callers only ever call `Sink.write(phase, ctx,
//! payload)`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use gproxy_provider_core::{Event, EventSink};

use crate::request_id::EntryTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotPhase {
    ClientRequest,
    CompatPre,
    CompatPost,
    ProviderRequest,
    ProviderResponse,
    ProviderError,
    ServerFinal,
}

impl SnapshotPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotPhase::ClientRequest => "client-request",
            SnapshotPhase::CompatPre => "compat-pre",
            SnapshotPhase::CompatPost => "compat-post",
            SnapshotPhase::ProviderRequest => "provider-request",
            SnapshotPhase::ProviderResponse => "provider-response",
            SnapshotPhase::ProviderError => "provider-error",
            SnapshotPhase::ServerFinal => "server-final",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub phase: SnapshotPhase,
    pub request_id: String,
    pub entry_endpoint: String,
    pub timestamp_ms: i64,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl SnapshotRecord {
    pub fn new(
        phase: SnapshotPhase,
        request_id: impl Into<String>,
        entry_tag: EntryTag,
        payload: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            phase,
            request_id: request_id.into(),
            entry_endpoint: entry_tag.as_str().to_string(),
            timestamp_ms: now_ms(),
            payload,
            metadata,
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Header names considered sensitive regardless of case; `*-token` is matched
/// by suffix separately.
const SENSITIVE_HEADER_NAMES: &[&str] = ["authorization", "x-api-key", "cookie"];

fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADER_NAMES.contains(&lower.as_str()) || lower.ends_with("-token")
}

/// `<first6>****<last6>` when the value is at least 13 chars, else `****`.
pub fn mask_value(value: &str) -> String {
    if value.chars().count() >= 13 {
        let chars: Vec<char> = value.chars().collect();
        let first: String = chars[..6].iter().collect();
        let last: String = chars[chars.len() - 6..].iter().collect();
        format!("{first}****{last}")
    } else {
        "****".to_string()
    }
}

/// Masks sensitive header values in place for a snapshot payload.
pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            if is_sensitive_header(k) {
                (k.clone(), mask_value(v))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// A pluggable snapshot sink. Writes MUST NOT block the caller and failures
/// MUST NOT propagate.
pub trait SnapshotSink: Send + Sync {
    fn write(&self, record: SnapshotRecord);
}

pub struct NoopSnapshotSink;

impl SnapshotSink for NoopSnapshotSink {
    fn write(&self, _record: SnapshotRecord) {}
}

/// Writes phase snapshots under `<home>/.<app>/codex-samples/<entry-folder>/`.
/// Optionally forwards a copy to an in-process hook channel before the disk
/// write is scheduled.
pub struct FileSnapshotSink {
    root: PathBuf,
    ttl: Duration,
    hook: Option<broadcast::Sender<SnapshotRecord>>,
}

impl FileSnapshotSink {
    pub fn new(app_name: &str, ttl: Duration) -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(format!(".{app_name}"))
            .join("codex-samples");
        Self {
            root,
            ttl,
            hook: None,
        }
    }

    pub fn with_root(root: PathBuf, ttl: Duration) -> Self {
        Self {
            root,
            ttl,
            hook: None,
        }
    }

    /// Attaches a subscriber channel; returns the receiver end.
    pub fn with_hook(mut self, capacity: usize) -> (Self, broadcast::Receiver<SnapshotRecord>) {
        let (tx, rx) = broadcast::channel(capacity);
        self.hook = Some(tx);
        (self, rx)
    }

    fn file_path(&self, record: &SnapshotRecord) -> PathBuf {
        self.root
            .join(&record.entry_endpoint)
            .join(format!("{}_{}.json", record.request_id, record.phase.as_str()))
    }

    async fn write_async(root: PathBuf, path: PathBuf, record: SnapshotRecord) {
        let Some(parent) = path.parent() else {
            return;
        };
        if tokio::fs::create_dir_all(parent).await.is_err() {
            return;
        }
        let Ok(body) = serde_json::to_vec_pretty(&record) else {
            return;
        };
        // Best-effort: a failed write is swallowed, never surfaced to the caller.
        let _ = tokio::fs::write(&path, body).await;
        let _ = root; // root kept for symmetry with cleanup(); no-op here.
    }

    /// Removes snapshot files older than `ttl`. Intended to run on a
    /// recurring interval from the process' background task set.
    pub async fn cleanup_once(&self) {
        let cutoff = SystemTime::now()
            .checked_sub(self.ttl)
            .unwrap_or(UNIX_EPOCH);
        walk_and_prune(&self.root, cutoff).await;
    }

    pub fn spawn_cleanup_task(self: std::sync::Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup_once().await;
            }
        });
    }
}

async fn walk_and_prune(dir: &Path, cutoff: SystemTime) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.is_dir() {
            Box::pin(walk_and_prune(&path, cutoff)).await;
            continue;
        }
        if let Ok(modified) = meta.modified() {
            if modified < cutoff {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn write(&self, record: SnapshotRecord) {
        if let Some(hook) = &self.hook {
            let _ = hook.send(record.clone());
        }
        let path = self.file_path(&record);
        let root = self.root.clone();
        tokio::spawn(Self::write_async(root, path, record));
    }
}

/// Bridges the existing `EventHub`/`EventSink` fan-out (terminal + DB sinks)
/// to a `SnapshotSink`, so phase snapshots ride the same emit path as every
/// other observer instead of needing a second instrumentation pass through
/// the request handlers.
pub struct EventSnapshotBridge {
    sink: Arc<dyn SnapshotSink>,
}

impl EventSnapshotBridge {
    pub fn new(sink: Arc<dyn SnapshotSink>) -> Self {
        Self { sink }
    }
}

impl EventSink for EventSnapshotBridge {
    fn write<'a>(
        &'a self,
        event: &'a Event,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(record) = record_for_event(event) else {
                return;
            };
            self.sink.write(record);
        })
    }
}

fn record_for_event(event: &Event) -> Option<SnapshotRecord> {
    match event {
        Event::Downstream(ev) => {
            let request_id = ev.trace_id.clone()?;
            let entry_tag = EntryTag::from_path(&ev.request_path);
            let payload = serde_json::json!({
                "method": ev.request_method,
                "path": ev.request_path,
                "query": ev.request_query,
                "status": ev.response_status,
            });
            let metadata = serde_json::json!({
                "request_headers": redact_headers(&ev.request_headers),
                "response_headers": redact_headers(&ev.response_headers),
            });
            Some(SnapshotRecord::new(
                SnapshotPhase::ServerFinal,
                request_id,
                entry_tag,
                payload,
                metadata,
            ))
        }
        Event::Upstream(ev) => {
            let request_id = ev.trace_id.clone()?;
            // The phase-dispatch point doesn't know the client's entry dialect by
            // the time an upstream event fires; `OpenAIChat` is used as a stable
            // fallback bucket rather than guessing from the provider name.
            let entry_tag = EntryTag::OpenAIChat;
            let phase = if ev.error_kind.is_some() {
                SnapshotPhase::ProviderError
            } else if ev.response_status.is_some() {
                SnapshotPhase::ProviderResponse
            } else {
                SnapshotPhase::ProviderRequest
            };
            let payload = serde_json::json!({
                "provider": ev.provider,
                "operation": ev.operation,
                "attempt_no": ev.attempt_no,
                "status": ev.response_status,
                "error_kind": ev.error_kind,
                "error_message": ev.error_message,
            });
            let metadata = serde_json::json!({
                "request_headers": redact_headers(&ev.request_headers),
                "response_headers": redact_headers(&ev.response_headers),
            });
            Some(SnapshotRecord::new(phase, request_id, entry_tag, payload, metadata))
        }
        Event::Operational(gproxy_provider_core::OperationalEvent::PipelineStage(ev)) => {
            let request_id = ev.trace_id.clone()?;
            let entry_tag = EntryTag::from_path(&ev.entry_path);
            let phase = match ev.stage {
                gproxy_provider_core::PipelineStageKind::ClientRequest => SnapshotPhase::ClientRequest,
                gproxy_provider_core::PipelineStageKind::CompatPre => SnapshotPhase::CompatPre,
                gproxy_provider_core::PipelineStageKind::CompatPost => SnapshotPhase::CompatPost,
            };
            Some(SnapshotRecord::new(
                phase,
                request_id,
                entry_tag,
                ev.payload.clone(),
                serde_json::json!({}),
            ))
        }
        Event::Operational(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_event_without_trace_id_is_dropped() {
        let ev = Event::Downstream(gproxy_provider_core::DownstreamEvent {
            trace_id: None,
            at: SystemTime::now(),
            user_id: None,
            user_key_id: None,
            request_method: "POST".to_string(),
            request_headers: Vec::new(),
            request_path: "/v1/messages".to_string(),
            request_query: None,
            request_body: None,
            response_status: Some(200),
            response_headers: Vec::new(),
            response_body: None,
        });
        assert!(record_for_event(&ev).is_none());
    }

    #[test]
    fn masks_long_values() {
        assert_eq!(mask_value("sk-abcdefghijklmno"), "sk-abc****klmno");
    }

    #[test]
    fn masks_short_values_fully() {
        assert_eq!(mask_value("short"), "****");
    }

    #[test]
    fn redacts_known_sensitive_headers_only() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer abcdefghijklmno".to_string()),
            ("x-api-key".to_string(), "abcdefghijklmno".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        let redacted = redact_headers(&headers);
        assert_eq!(redacted[0].1, mask_value("Bearer abcdefghijklmno"));
        assert_eq!(redacted[1].1, mask_value("abcdefghijklmno"));
        assert_eq!(redacted[2].1, "application/json");
    }

    #[tokio::test]
    async fn file_sink_writes_and_cleans_up() {
        let dir = std::env::temp_dir().join(format!("gproxy-snap-test-{}", now_ms()));
        let sink = FileSnapshotSink::with_root(dir.clone(), Duration::from_secs(0));
        let record = SnapshotRecord::new(
            SnapshotPhase::ServerFinal,
            "req-1",
            EntryTag::OpenAIChat,
            serde_json::json!({"ok": true}),
            serde_json::json!({}),
        );
        let path = sink.file_path(&record);
        FileSnapshotSink::write_async(dir.clone(), path.clone(), record).await;
        assert!(path.exists());
        sink.cleanup_once().await;
        assert!(!path.exists());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
