//! Quota & Cooldown Control Loop (C8): per-`ProviderKey` state machine
//! (`InPool | Cooldown | Blacklist | AuthBroken`), generalizing the
//! credential-level [`crate::disallow::DisallowLevel`] (which only covers
//! `Cooldown | Transient | Dead`) up to the spec's four-variant model and
//! adding the `AuthBroken` terminal-until-admin-or-refresh state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type ProviderKey = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderState {
    InPool,
    Cooldown { until_ms: i64, reason: String },
    Blacklist { until_ms: i64, reason: String },
    AuthBroken { issue_kind: String, detail: String },
}

impl ProviderState {
    pub fn is_in_pool(&self, now_ms: i64) -> bool {
        match self {
            ProviderState::InPool => true,
            ProviderState::Cooldown { until_ms, .. } | ProviderState::Blacklist { until_ms, .. } => {
                *until_ms <= now_ms
            }
            ProviderState::AuthBroken { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimit,
    Quota,
    Auth,
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableMode {
    Cooldown,
    Blacklist,
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    state: ProviderState,
    consecutive_error_count: u32,
    consecutive_cooldowns: u32,
    remaining_quota_fraction: Option<f64>,
    reset_at_ms: Option<i64>,
    last_fetched_ms: Option<i64>,
    priority_tier: u8,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            state: ProviderState::InPool,
            consecutive_error_count: 0,
            consecutive_cooldowns: 0,
            remaining_quota_fraction: None,
            reset_at_ms: None,
            last_fetched_ms: None,
            priority_tier: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStateView {
    pub key: ProviderKey,
    pub state: ProviderState,
    pub consecutive_error_count: u32,
    pub remaining_quota_fraction: Option<f64>,
    pub reset_at_ms: Option<i64>,
    pub last_fetched_ms: Option<i64>,
    pub priority_tier: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshotEntry {
    pub remaining_fraction: Option<f64>,
    pub reset_at_ms: Option<i64>,
    pub fetched_at_ms: i64,
}

pub type QuotaSnapshot = HashMap<ProviderKey, QuotaSnapshotEntry>;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

const DEFAULT_COOLDOWN_BASE: Duration = Duration::from_secs(30);
const DEFAULT_COOLDOWN_CAP: Duration = Duration::from_secs(30 * 60);
const DEFAULT_BLACKLIST_DURATION: Duration = Duration::from_secs(6 * 60 * 60);
/// Open question in spec.md §9 resolved as: demote to `Blacklist` after this
/// many consecutive cooldowns by default; callers may configure a different
/// value via [`QuotaControl::with_blacklist_threshold`].
const DEFAULT_BLACKLIST_THRESHOLD: u32 = 3;

/// Process-wide map guarded by a single mutex; transitions are O(pool), so
/// fine-grained locking buys nothing (mirrors `disallow.rs`'s own rationale).
pub struct QuotaControl {
    entries: Mutex<HashMap<ProviderKey, ProviderEntry>>,
    blacklist_threshold: u32,
}

impl Default for QuotaControl {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaControl {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            blacklist_threshold: DEFAULT_BLACKLIST_THRESHOLD,
        }
    }

    pub fn with_blacklist_threshold(threshold: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            blacklist_threshold: threshold,
        }
    }

    pub fn state(&self, key: &str) -> ProviderState {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        self.maybe_recover(entry);
        entry.state.clone()
    }

    pub fn is_in_pool(&self, key: &str) -> bool {
        matches!(self.state(key), ProviderState::InPool)
    }

    fn maybe_recover(&self, entry: &mut ProviderEntry) {
        let now = now_ms();
        match &entry.state {
            ProviderState::Cooldown { until_ms, .. } if *until_ms <= now => {
                entry.state = ProviderState::InPool;
                entry.consecutive_error_count = 0;
            }
            ProviderState::Blacklist { until_ms, .. } if *until_ms <= now => {
                entry.state = ProviderState::InPool;
                entry.consecutive_error_count = 0;
                entry.consecutive_cooldowns = 0;
            }
            _ => {}
        }
    }

    /// `onSuccess(key)` — reset the consecutive counter; if `Cooldown`
    /// already expired, returns the entry to `InPool`.
    pub fn on_success(&self, key: &str) {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        self.maybe_recover(entry);
        entry.consecutive_error_count = 0;
        entry.consecutive_cooldowns = 0;
        if matches!(entry.state, ProviderState::Cooldown { .. }) {
            entry.state = ProviderState::InPool;
        }
    }

    /// `onFailure(key, class)`.
    pub fn on_failure(&self, key: &str, class: FailureClass, reason: impl Into<String>) {
        let reason = reason.into();
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        self.maybe_recover(entry);
        entry.consecutive_error_count += 1;

        match class {
            FailureClass::Auth => {
                entry.state = ProviderState::AuthBroken {
                    issue_kind: "invalid_token".to_string(),
                    detail: reason,
                };
            }
            FailureClass::RateLimit => {
                entry.consecutive_cooldowns += 1;
                if entry.consecutive_cooldowns >= self.blacklist_threshold {
                    entry.state = ProviderState::Blacklist {
                        until_ms: now_ms() + DEFAULT_BLACKLIST_DURATION.as_millis() as i64,
                        reason,
                    };
                } else {
                    let backoff = DEFAULT_COOLDOWN_BASE
                        .saturating_mul(1u32 << entry.consecutive_cooldowns.min(10))
                        .min(DEFAULT_COOLDOWN_CAP);
                    entry.state = ProviderState::Cooldown {
                        until_ms: now_ms() + backoff.as_millis() as i64,
                        reason,
                    };
                }
            }
            FailureClass::Quota => {
                entry.consecutive_cooldowns += 1;
                if entry.consecutive_cooldowns >= self.blacklist_threshold {
                    entry.state = ProviderState::Blacklist {
                        until_ms: now_ms() + DEFAULT_BLACKLIST_DURATION.as_millis() as i64,
                        reason,
                    };
                } else {
                    let backoff = DEFAULT_COOLDOWN_BASE
                        .saturating_mul(1u32 << entry.consecutive_cooldowns.min(10))
                        .min(DEFAULT_COOLDOWN_CAP);
                    entry.state = ProviderState::Cooldown {
                        until_ms: now_ms() + backoff.as_millis() as i64,
                        reason,
                    };
                }
            }
            FailureClass::Transient => {
                // Stays InPool but the failure is recorded via the counter above.
            }
        }
    }

    /// `periodicRefresh()` callback for a single key: updates the remaining
    /// quota snapshot and demotes to `Cooldown` if `remaining_fraction <= eps`.
    pub fn apply_refresh(&self, key: &str, remaining_fraction: Option<f64>, reset_at_ms: Option<i64>) {
        const EPS: f64 = 0.01;
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        entry.remaining_quota_fraction = remaining_fraction;
        entry.reset_at_ms = reset_at_ms;
        entry.last_fetched_ms = Some(now_ms());
        if let Some(frac) = remaining_fraction {
            if frac <= EPS && matches!(entry.state, ProviderState::InPool) {
                entry.state = ProviderState::Cooldown {
                    until_ms: reset_at_ms.unwrap_or(now_ms() + DEFAULT_COOLDOWN_BASE.as_millis() as i64),
                    reason: "quota_exhausted".to_string(),
                };
            }
        }
    }

    /// Admin `reset(key)`: returns to `InPool` regardless of prior variant.
    pub fn reset(&self, key: &str) {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        entry.state = ProviderState::InPool;
        entry.consecutive_error_count = 0;
        entry.consecutive_cooldowns = 0;
    }

    /// Alias-scoped reset: expands `reset` to every key sharing `alias_prefix`.
    pub fn reset_by_alias_prefix(&self, alias_prefix: &str) {
        let mut guard = self.entries.lock().unwrap();
        for (key, entry) in guard.iter_mut() {
            if key.starts_with(alias_prefix) {
                entry.state = ProviderState::InPool;
                entry.consecutive_error_count = 0;
                entry.consecutive_cooldowns = 0;
            }
        }
    }

    /// Admin `recover(key)`: same effect as `reset`, distinguished at the
    /// admin-API layer by intent (operator-initiated probe success vs. blunt
    /// reset); both converge on `InPool`.
    pub fn recover(&self, key: &str) {
        self.reset(key);
    }

    /// Admin `disable(key, mode, duration)`.
    pub fn disable(&self, key: &str, mode: DisableMode, duration: Duration, reason: impl Into<String>) {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        let until_ms = now_ms() + duration.as_millis() as i64;
        let reason = reason.into();
        entry.state = match mode {
            DisableMode::Cooldown => ProviderState::Cooldown { until_ms, reason },
            DisableMode::Blacklist => ProviderState::Blacklist { until_ms, reason },
        };
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let guard = self.entries.lock().unwrap();
        guard
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    QuotaSnapshotEntry {
                        remaining_fraction: v.remaining_quota_fraction,
                        reset_at_ms: v.reset_at_ms,
                        fetched_at_ms: v.last_fetched_ms.unwrap_or(0),
                    },
                )
            })
            .collect()
    }

    pub fn providers(&self) -> Vec<ProviderStateView> {
        let mut guard = self.entries.lock().unwrap();
        for entry in guard.values_mut() {
            self.maybe_recover(entry);
        }
        guard
            .iter()
            .map(|(k, v)| ProviderStateView {
                key: k.clone(),
                state: v.state.clone(),
                consecutive_error_count: v.consecutive_error_count,
                remaining_quota_fraction: v.remaining_quota_fraction,
                reset_at_ms: v.reset_at_ms,
                last_fetched_ms: v.last_fetched_ms,
                priority_tier: v.priority_tier,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_exactly_one_variant_active() {
        let q = QuotaControl::new();
        assert_eq!(q.state("p.m"), ProviderState::InPool);
        q.on_failure("p.m", FailureClass::Auth, "invalid_token");
        assert!(matches!(q.state("p.m"), ProviderState::AuthBroken { .. }));
    }

    #[test]
    fn admin_reset_forces_in_pool_from_any_variant() {
        let q = QuotaControl::new();
        q.on_failure("p.m", FailureClass::Auth, "bad");
        q.reset("p.m");
        assert_eq!(q.state("p.m"), ProviderState::InPool);
    }

    #[test]
    fn cooldown_blocks_until_expiry() {
        let q = QuotaControl::new();
        q.disable("p.m", DisableMode::Cooldown, Duration::from_secs(3600), "manual");
        assert!(!q.is_in_pool("p.m"));
    }

    #[test]
    fn three_consecutive_rate_limit_failures_escalate_to_blacklist() {
        let q = QuotaControl::new();
        for _ in 0..2 {
            q.on_failure("p.m", FailureClass::RateLimit, "429");
            q.reset_cooldown_for_test("p.m");
        }
        q.on_failure("p.m", FailureClass::RateLimit, "429");
        assert!(matches!(q.state("p.m"), ProviderState::Blacklist { .. }));
    }

    #[test]
    fn quota_failures_cooldown_before_blacklist() {
        let q = QuotaControl::new();
        q.on_failure("p.m", FailureClass::Quota, "quota_exceeded");
        assert!(matches!(q.state("p.m"), ProviderState::Cooldown { .. }));
    }

    #[test]
    fn three_consecutive_quota_failures_escalate_to_blacklist() {
        let q = QuotaControl::new();
        for _ in 0..2 {
            q.on_failure("p.m", FailureClass::Quota, "quota_exceeded");
            q.reset_cooldown_for_test("p.m");
        }
        q.on_failure("p.m", FailureClass::Quota, "quota_exceeded");
        assert!(matches!(q.state("p.m"), ProviderState::Blacklist { .. }));
    }

    #[test]
    fn success_clears_counters() {
        let q = QuotaControl::new();
        q.on_failure("p.m", FailureClass::Transient, "timeout");
        q.on_success("p.m");
        let views = q.providers();
        let view = views.iter().find(|v| v.key == "p.m").unwrap();
        assert_eq!(view.consecutive_error_count, 0);
    }

    impl QuotaControl {
        /// Test-only helper: forces the cooldown to have already elapsed so
        /// successive `on_failure` calls exercise the escalation counter
        /// without a real sleep.
        fn reset_cooldown_for_test(&self, key: &str) {
            let mut guard = self.entries.lock().unwrap();
            if let Some(entry) = guard.get_mut(key) {
                if let ProviderState::Cooldown { .. } = entry.state {
                    entry.state = ProviderState::InPool;
                }
            }
        }
    }
}
