//! Request-ID Fabric (C1): dual client/provider request ids, retarget aliasing,
//! and TTL-bounded bookkeeping so a request can be resolved back to its
//! terminal provider id after one or more route retargets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use time::OffsetDateTime;

const ALIAS_TTL: Duration = Duration::from_secs(5 * 60);
const MAX_SEQ_ENTRIES: usize = 10_000;
const MAX_ALIAS_ENTRIES: usize = 10_000;

/// Client-facing entry dialect tag, also used as the snapshot directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTag {
    OpenAIChat,
    OpenAIResponses,
    AnthropicMessages,
}

impl EntryTag {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryTag::OpenAIChat => "openai-chat",
            EntryTag::OpenAIResponses => "openai-responses",
            EntryTag::AnthropicMessages => "anthropic-messages",
        }
    }

    /// Maps an inbound path to its entry tag per the dataplane route table.
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/v1/responses") {
            EntryTag::OpenAIResponses
        } else if path.starts_with("/v1/messages") {
            EntryTag::AnthropicMessages
        } else {
            EntryTag::OpenAIChat
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateMeta {
    pub entry_tag: EntryTag,
    pub provider_id: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RequestIds {
    pub client_request_id: String,
    pub provider_request_id: String,
}

/// `{clientRequestId, providerRequestId, entryEndpoint, model, providerKey, startedAtMs, metadata}`
/// passed by value through the pipeline; `provider_request_id` is re-derived on retarget via
/// `RequestIdFabric::enhance`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_request_id: String,
    pub provider_request_id: String,
    pub entry_tag: EntryTag,
    pub model: String,
    pub provider_key: String,
    pub started_at_ms: i64,
}

fn sanitize_token(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => cleaned,
        _ => "unknown".to_string(),
    }
}

fn timestamp_token(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}{:03}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.random_range(0..16), 16).unwrap())
        .collect()
}

struct SeqCounters {
    counters: HashMap<(EntryTag2, String, String), u32>,
    order: Vec<(EntryTag2, String, String)>,
}

// EntryTag isn't Eq/Hash-friendly as written (no derive); give the map key a
// small hashable shadow instead of deriving on the public enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryTag2(&'static str);

impl SeqCounters {
    fn new() -> Self {
        Self {
            counters: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn next(&mut self, entry: EntryTag, provider: &str, model: &str) -> u32 {
        let key = (EntryTag2(entry.as_str()), provider.to_string(), model.to_string());
        let value = self.counters.entry(key.clone()).or_insert(0);
        *value = value.wrapping_add(1);
        let seq = *value;
        if !self.order.iter().any(|k| k == &key) {
            self.order.push(key.clone());
            if self.order.len() > MAX_SEQ_ENTRIES {
                let oldest = self.order.remove(0);
                self.counters.remove(&oldest);
            }
        }
        seq
    }
}

struct AliasEntry {
    target: String,
    inserted_at: Instant,
}

/// Process-wide id fabric. Bounded maps with TTL eviction via a lazy sweep on
/// access, matching the rest of this workspace's preference for explicit
/// state over background-task machinery where a sweep-on-touch suffices.
pub struct RequestIdFabric {
    seq: Mutex<SeqCounters>,
    aliases: Mutex<HashMap<String, AliasEntry>>,
}

impl Default for RequestIdFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdFabric {
    pub fn new() -> Self {
        Self {
            seq: Mutex::new(SeqCounters::new()),
            aliases: Mutex::new(HashMap::new()),
        }
    }

    /// `Generate(candidate, meta)`.
    pub fn generate(&self, candidate: Option<&str>, meta: &GenerateMeta) -> RequestIds {
        let client_request_id = match candidate.map(str::trim) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => format!(
                "req_{}_{}",
                OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000,
                random_hex(8)
            ),
        };

        let provider_id = sanitize_token(&meta.provider_id);
        let model = sanitize_token(&meta.model);
        let now = OffsetDateTime::now_utc();
        let ts = timestamp_token(now);
        let seq = self.seq.lock().unwrap().next(meta.entry_tag, &provider_id, &model);

        let provider_request_id = format!(
            "{}-{}-{}-{}-{:03}",
            meta.entry_tag.as_str(),
            provider_id,
            model,
            ts,
            seq % 1000
        );

        RequestIds {
            client_request_id,
            provider_request_id,
        }
    }

    /// `Enhance(currentId, newProviderOrModel)`: reuses the timestamp+sequence
    /// suffix of `current_id` for the retargeted id, and records `current_id
    /// -> new_id` with a 5-minute TTL alias.
    pub fn enhance(&self, current_id: &str, entry_tag: EntryTag, new_provider: &str, new_model: &str) -> String {
        let suffix = current_id
            .rsplit_once('-')
            .and_then(|(rest, seq)| rest.rsplit_once('-').map(|(rest2, ts)| (rest2, ts, seq)))
            .map(|(_, ts, seq)| format!("{ts}-{seq}"))
            .unwrap_or_else(|| {
                let now = OffsetDateTime::now_utc();
                format!("{}-000", timestamp_token(now))
            });

        let new_id = format!(
            "{}-{}-{}-{}",
            entry_tag.as_str(),
            sanitize_token(new_provider),
            sanitize_token(new_model),
            suffix
        );

        self.record_alias(current_id, &new_id);
        new_id
    }

    fn record_alias(&self, from: &str, to: &str) {
        let mut guard = self.aliases.lock().unwrap();
        sweep_expired(&mut guard);
        guard.insert(
            from.to_string(),
            AliasEntry {
                target: to.to_string(),
                inserted_at: Instant::now(),
            },
        );
        if guard.len() > MAX_ALIAS_ENTRIES {
            if let Some(oldest_key) = guard
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
            {
                guard.remove(&oldest_key);
            }
        }
    }

    /// `Resolve(id)`: follows the alias chain to its terminal id, guarded
    /// against cycles by a visited set.
    pub fn resolve(&self, id: &str) -> String {
        let guard = self.aliases.lock().unwrap();
        let mut current = id.to_string();
        let mut visited = std::collections::HashSet::new();
        loop {
            if !visited.insert(current.clone()) {
                // Cycle detected; stop at the last good value.
                return current;
            }
            match guard.get(&current) {
                Some(entry) if entry.inserted_at.elapsed() < ALIAS_TTL => {
                    current = entry.target.clone();
                }
                _ => return current,
            }
        }
    }
}

fn sweep_expired(map: &mut HashMap<String, AliasEntry>) {
    map.retain(|_, v| v.inserted_at.elapsed() < ALIAS_TTL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_echoes_trimmed_candidate() {
        let fabric = RequestIdFabric::new();
        let meta = GenerateMeta {
            entry_tag: EntryTag::OpenAIChat,
            provider_id: "openai".into(),
            model: "gpt-4o-mini".into(),
        };
        let ids = fabric.generate(Some("  my-id  "), &meta);
        assert_eq!(ids.client_request_id, "my-id");
        assert!(ids.provider_request_id.starts_with("openai-chat-openai-gpt-4o-mini-"));
    }

    #[test]
    fn generate_synthesizes_when_candidate_empty() {
        let fabric = RequestIdFabric::new();
        let meta = GenerateMeta {
            entry_tag: EntryTag::AnthropicMessages,
            provider_id: "claude".into(),
            model: "sonnet".into(),
        };
        let ids = fabric.generate(Some("   "), &meta);
        assert!(ids.client_request_id.starts_with("req_"));
    }

    #[test]
    fn sanitize_rejects_non_letter_start() {
        assert_eq!(sanitize_token("123abc"), "unknown");
        assert_eq!(sanitize_token("gpt 4o/mini"), "gpt_4o_mini");
    }

    #[test]
    fn enhance_then_resolve_follows_alias() {
        let fabric = RequestIdFabric::new();
        let meta = GenerateMeta {
            entry_tag: EntryTag::OpenAIChat,
            provider_id: "openai".into(),
            model: "gpt-4o".into(),
        };
        let ids = fabric.generate(Some("req-1"), &meta);
        let retargeted = fabric.enhance(&ids.provider_request_id, EntryTag::OpenAIChat, "azure", "gpt-4o");
        assert_ne!(retargeted, ids.provider_request_id);
        assert_eq!(fabric.resolve(&ids.provider_request_id), retargeted);
    }

    #[test]
    fn resolve_guards_against_cycles() {
        let fabric = RequestIdFabric::new();
        fabric.record_alias("a", "b");
        fabric.record_alias("b", "a");
        // Should terminate rather than loop forever.
        let resolved = fabric.resolve("a");
        assert!(resolved == "a" || resolved == "b");
    }
}
