//! Virtual Router Engine (C7): match an inbound request to a route, apply
//! session sticky/disable directives, walk the route's pools in priority
//! order, and select a candidate `ProviderKey` by the configured strategy.
//!
//! The teacher workspace routes purely by an explicit `provider/model`
//! prefix; this module adds the pools/priority/failover layer the spec
//! calls for on top of that, without displacing the explicit-provider path
//! (a bare `provider/model` string that matches no configured route still
//! behaves as a single-target route, same as today).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// `providerId.modelId[.keyAlias]`, the finest unit of addressable backend
/// capacity.
pub type ProviderKey = String;

pub fn provider_key(provider_id: &str, model_id: &str, key_alias: Option<&str>) -> ProviderKey {
    match key_alias {
        Some(alias) => format!("{provider_id}.{model_id}.{alias}"),
        None => format!("{provider_id}.{model_id}"),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutePattern {
    /// Glob-style model match (`*` wildcard); `None` matches any model.
    pub model: Option<String>,
    pub header: Option<(String, String)>,
    pub metadata: HashMap<String, String>,
}

impl RoutePattern {
    pub fn accepts(&self, model: &str, headers: &HashMap<String, String>, metadata: &HashMap<String, String>) -> bool {
        if let Some(pattern) = &self.model {
            if !glob_match(pattern, model) {
                return false;
            }
        }
        if let Some((name, value)) = &self.header {
            match headers.get(&name.to_ascii_lowercase()) {
                Some(v) if v == value => {}
                _ => return false,
            }
        }
        for (k, v) in &self.metadata {
            if metadata.get(k) != Some(v) {
                return false;
            }
        }
        true
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    Weighted,
    LeastLoaded,
    Fastest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,
    pub targets: Vec<ProviderKey>,
    pub backup: bool,
    pub priority: i32,
    /// Optional static weights for `SelectionStrategy::Weighted`; targets
    /// absent from this map default to weight 1.
    #[serde(default)]
    pub weights: HashMap<ProviderKey, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    pub pattern: RoutePattern,
    pub pools: Vec<PoolConfig>,
    pub priority: i32,
    #[serde(default = "default_strategy")]
    pub strategy: SelectionStrategy,
}

fn default_strategy() -> SelectionStrategy {
    SelectionStrategy::RoundRobin
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub request_id: String,
    pub route_id: String,
    pub pool_id: String,
    pub target: ProviderKey,
    pub key_alias: Option<String>,
    pub reasoning: String,
    pub sticky_until_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualRouterError {
    NoRouteAvailable,
}

impl std::fmt::Display for VirtualRouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VirtualRouterError::NoRouteAvailable => write!(f, "NO_ROUTE_AVAILABLE"),
        }
    }
}

impl std::error::Error for VirtualRouterError {}

/// Bridges to C8: tells the router which `ProviderKey`s are currently
/// eligible, and (for `LeastLoaded`/`Fastest`) their live load signals.
pub trait AvailabilityView: Send + Sync {
    fn is_in_pool(&self, target: &ProviderKey) -> bool;
    fn in_flight(&self, _target: &ProviderKey) -> u64 {
        0
    }
    fn ema_response_ms(&self, _target: &ProviderKey) -> f64 {
        0.0
    }
}

/// Always-available view, useful for routes with no quota integration yet.
pub struct AlwaysAvailable;

impl AvailabilityView for AlwaysAvailable {
    fn is_in_pool(&self, _target: &ProviderKey) -> bool {
        true
    }
}

/// Bridges C8's `QuotaControl` into route selection: a pool target is
/// eligible exactly when its quota state is `InPool`.
pub struct QuotaAvailability<'a>(pub &'a gproxy_provider_core::quota::QuotaControl);

impl AvailabilityView for QuotaAvailability<'_> {
    fn is_in_pool(&self, target: &ProviderKey) -> bool {
        self.0.is_in_pool(target)
    }
}

const SESSION_DIRECTIVE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Default)]
pub struct ParsedDirectives {
    pub sticky: Option<String>,
    pub disabled: Vec<String>,
}

/// Parses `<**!provider**>` (sticky) and `<**#a,b**>` (disable) directives
/// out of free-form user message content.
pub fn parse_directives(content: &str) -> ParsedDirectives {
    let mut out = ParsedDirectives::default();
    let mut rest = content;
    while let Some(start) = rest.find("<**") {
        let after = &rest[start + 3..];
        let Some(end) = after.find("**>") else {
            break;
        };
        let body = &after[..end];
        if let Some(names) = body.strip_prefix('!') {
            let name = names.trim();
            if !name.is_empty() {
                out.sticky = Some(name.to_string());
            }
        } else if let Some(names) = body.strip_prefix('#') {
            for name in names.split(',') {
                let name = name.trim();
                if !name.is_empty() {
                    out.disabled.push(name.to_string());
                }
            }
        }
        rest = &after[end + 3..];
    }
    out
}

struct SessionState {
    sticky: Option<(String, Instant)>,
    disabled: HashSet<String>,
    updated_at: Instant,
}

impl SessionState {
    fn is_expired(&self) -> bool {
        self.updated_at.elapsed() > SESSION_DIRECTIVE_TTL
    }
}

/// Per-session sticky/disable directive store with TTL expiry.
pub struct SessionDirectives {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl Default for SessionDirectives {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDirectives {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Applies newly-parsed directives to the session, unioning disabled
    /// lists across messages. Sticky has lower precedence than disable: if
    /// the directive both stickies and disables the same provider, the
    /// sticky slot is still recorded but `effective_sticky` below filters it.
    pub fn apply(&self, session_id: &str, parsed: &ParsedDirectives) {
        let mut guard = self.sessions.lock().unwrap();
        guard.retain(|_, v| !v.is_expired());
        let entry = guard.entry(session_id.to_string()).or_insert_with(|| SessionState {
            sticky: None,
            disabled: HashSet::new(),
            updated_at: Instant::now(),
        });
        if let Some(sticky) = &parsed.sticky {
            entry.sticky = Some((sticky.clone(), Instant::now()));
        }
        for d in &parsed.disabled {
            entry.disabled.insert(d.clone());
        }
        entry.updated_at = Instant::now();
    }

    /// Returns `(sticky_provider_if_not_disabled, disabled_set, sticky_until_ms)`.
    fn effective(&self, session_id: &str) -> (Option<String>, HashSet<String>, Option<i64>) {
        let mut guard = self.sessions.lock().unwrap();
        guard.retain(|_, v| !v.is_expired());
        let Some(state) = guard.get(session_id) else {
            return (None, HashSet::new(), None);
        };
        let disabled = state.disabled.clone();
        let sticky = state.sticky.as_ref().and_then(|(name, at)| {
            if disabled.contains(name) {
                None
            } else {
                Some((name.clone(), *at))
            }
        });
        let until_ms = sticky.as_ref().map(|(_, at)| {
            let remaining = SESSION_DIRECTIVE_TTL.saturating_sub(at.elapsed());
            (remaining.as_millis() as i64) + now_ms()
        });
        (sticky.map(|(n, _)| n), disabled, until_ms)
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct RoundRobinCounters {
    counters: HashMap<(String, String), AtomicU64>,
}

impl RoundRobinCounters {
    fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    fn next(&self, route_id: &str, pool_id: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let key = (route_id.to_string(), pool_id.to_string());
        match self.counters.get(&key) {
            Some(c) => (c.fetch_add(1, Ordering::Relaxed) as usize) % len,
            None => 0,
        }
    }
}

pub struct VirtualRouter {
    routes: RwLock<Vec<RouteConfig>>,
    sessions: SessionDirectives,
    round_robin: Mutex<RoundRobinCounters>,
}

impl VirtualRouter {
    pub fn new(mut routes: Vec<RouteConfig>) -> Self {
        routes.sort_by_key(|r| r.priority);
        // Seed round-robin counters lazily via a mutable map guarded by a mutex.
        let mut rr = RoundRobinCounters::new();
        for route in &routes {
            for pool in &route.pools {
                rr.counters
                    .insert((route.id.clone(), pool.id.clone()), AtomicU64::new(0));
            }
        }
        Self {
            routes: RwLock::new(routes),
            sessions: SessionDirectives::new(),
            round_robin: Mutex::new(rr),
        }
    }

    pub fn replace_routes(&self, mut routes: Vec<RouteConfig>) {
        routes.sort_by_key(|r| r.priority);
        let mut rr = self.round_robin.lock().unwrap();
        for route in &routes {
            for pool in &route.pools {
                rr.counters
                    .entry((route.id.clone(), pool.id.clone()))
                    .or_insert_with(|| AtomicU64::new(0));
            }
        }
        *self.routes.write().unwrap() = routes;
    }

    /// `Route(request, metadata) -> RouteDecision`.
    #[allow(clippy::too_many_arguments)]
    pub fn route(
        &self,
        request_id: &str,
        route_hint: Option<&str>,
        model: &str,
        headers: &HashMap<String, String>,
        metadata: &HashMap<String, String>,
        session_id: Option<&str>,
        message_content: Option<&str>,
        availability: &dyn AvailabilityView,
    ) -> Result<RouteDecision, VirtualRouterError> {
        if let (Some(session_id), Some(content)) = (session_id, message_content) {
            let parsed = parse_directives(content);
            if parsed.sticky.is_some() || !parsed.disabled.is_empty() {
                self.sessions.apply(session_id, &parsed);
            }
        }

        let routes = self.routes.read().unwrap();
        let route = resolve_route(&routes, route_hint, model, headers, metadata)
            .ok_or(VirtualRouterError::NoRouteAvailable)?;

        let (sticky, disabled, sticky_until_ms) = match session_id {
            Some(sid) => self.sessions.effective(sid),
            None => (None, HashSet::new(), None),
        };

        let mut ordered_pools: Vec<&PoolConfig> = route.pools.iter().filter(|p| !p.backup).collect();
        ordered_pools.sort_by_key(|p| p.priority);
        let mut backup_pools: Vec<&PoolConfig> = route.pools.iter().filter(|p| p.backup).collect();
        backup_pools.sort_by_key(|p| p.priority);
        ordered_pools.extend(backup_pools);

        for pool in ordered_pools {
            let mut candidates: Vec<ProviderKey> = pool
                .targets
                .iter()
                .filter(|t| availability.is_in_pool(t) && !disabled.contains(*t))
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }
            candidates.sort();

            let (target, reasoning) = if let Some(sticky) = &sticky {
                if candidates.iter().any(|c| c == sticky) {
                    (sticky.clone(), "sticky directive".to_string())
                } else {
                    let (t, r) = select(route, pool, &candidates, availability, &self.round_robin);
                    (t, r)
                }
            } else {
                select(route, pool, &candidates, availability, &self.round_robin)
            };

            return Ok(RouteDecision {
                request_id: request_id.to_string(),
                route_id: route.id.clone(),
                pool_id: pool.id.clone(),
                target,
                key_alias: None,
                reasoning,
                sticky_until_ms,
            });
        }

        Err(VirtualRouterError::NoRouteAvailable)
    }
}

fn resolve_route<'a>(
    routes: &'a [RouteConfig],
    route_hint: Option<&str>,
    model: &str,
    headers: &HashMap<String, String>,
    metadata: &HashMap<String, String>,
) -> Option<&'a RouteConfig> {
    if let Some(hint) = route_hint {
        if let Some(r) = routes.iter().find(|r| r.id == hint) {
            return Some(r);
        }
    }
    routes
        .iter()
        .find(|r| r.pattern.accepts(model, headers, metadata))
        .or_else(|| routes.iter().find(|r| r.id == "default"))
}

fn select(
    route: &RouteConfig,
    pool: &PoolConfig,
    candidates: &[ProviderKey],
    availability: &dyn AvailabilityView,
    round_robin: &Mutex<RoundRobinCounters>,
) -> (ProviderKey, String) {
    match route.strategy {
        SelectionStrategy::RoundRobin => {
            let idx = round_robin
                .lock()
                .unwrap()
                .next(&route.id, &pool.id, candidates.len());
            (candidates[idx].clone(), "round_robin".to_string())
        }
        SelectionStrategy::Weighted => {
            let total: u32 = candidates
                .iter()
                .map(|c| *pool.weights.get(c).unwrap_or(&1))
                .sum();
            if total == 0 {
                return (candidates[0].clone(), "weighted(fallback)".to_string());
            }
            let mut roll = rand::rng().random_range(0..total);
            for c in candidates {
                let w = *pool.weights.get(c).unwrap_or(&1);
                if roll < w {
                    return (c.clone(), "weighted".to_string());
                }
                roll -= w;
            }
            (candidates[candidates.len() - 1].clone(), "weighted".to_string())
        }
        SelectionStrategy::LeastLoaded => {
            let chosen = candidates
                .iter()
                .min_by_key(|c| (availability.in_flight(c), (*c).clone()))
                .cloned()
                .unwrap_or_else(|| candidates[0].clone());
            (chosen, "least_loaded".to_string())
        }
        SelectionStrategy::Fastest => {
            let chosen = candidates
                .iter()
                .min_by(|a, b| {
                    let ea = availability.ema_response_ms(a);
                    let eb = availability.ema_response_ms(b);
                    ea.partial_cmp(&eb).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.cmp(b))
                })
                .cloned()
                .unwrap_or_else(|| candidates[0].clone());
            (chosen, "fastest".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_route(strategy: SelectionStrategy) -> RouteConfig {
        RouteConfig {
            id: "default".to_string(),
            pattern: RoutePattern::default(),
            priority: 0,
            strategy,
            pools: vec![
                PoolConfig {
                    id: "primary".to_string(),
                    targets: vec!["crs.gpt".to_string(), "tab.gpt".to_string()],
                    backup: false,
                    priority: 0,
                    weights: HashMap::new(),
                },
                PoolConfig {
                    id: "backup".to_string(),
                    targets: vec!["glm.gpt".to_string()],
                    backup: true,
                    priority: 0,
                    weights: HashMap::new(),
                },
            ],
        }
    }

    #[test]
    fn disable_directive_fails_over_to_backup_pool() {
        let router = VirtualRouter::new(vec![sample_route(SelectionStrategy::RoundRobin)]);
        let decision = router
            .route(
                "req-1",
                None,
                "gpt",
                &HashMap::new(),
                &HashMap::new(),
                Some("sess-1"),
                Some("<**#crs.gpt,tab.gpt**> hi"),
                &AlwaysAvailable,
            )
            .unwrap();
        assert_eq!(decision.target, "glm.gpt");

        // Directive persists to a later message in the same session.
        let decision2 = router
            .route(
                "req-2",
                None,
                "gpt",
                &HashMap::new(),
                &HashMap::new(),
                Some("sess-1"),
                Some("hello"),
                &AlwaysAvailable,
            )
            .unwrap();
        assert_eq!(decision2.target, "glm.gpt");
    }

    #[test]
    fn sticky_loses_to_disable_for_same_target() {
        let router = VirtualRouter::new(vec![sample_route(SelectionStrategy::RoundRobin)]);
        let decision = router
            .route(
                "req-1",
                None,
                "gpt",
                &HashMap::new(),
                &HashMap::new(),
                Some("sess-2"),
                Some("<**#crs.gpt**> <**!crs.gpt**> hi"),
                &AlwaysAvailable,
            )
            .unwrap();
        assert_ne!(decision.target, "crs.gpt");
    }

    #[test]
    fn no_route_available_when_all_candidates_excluded() {
        struct NoneAvailable;
        impl AvailabilityView for NoneAvailable {
            fn is_in_pool(&self, _target: &ProviderKey) -> bool {
                false
            }
        }
        let router = VirtualRouter::new(vec![sample_route(SelectionStrategy::RoundRobin)]);
        let err = router
            .route(
                "req-1",
                None,
                "gpt",
                &HashMap::new(),
                &HashMap::new(),
                None,
                None,
                &NoneAvailable,
            )
            .unwrap_err();
        assert_eq!(err, VirtualRouterError::NoRouteAvailable);
    }

    #[test]
    fn parses_sticky_and_disable_directives() {
        let parsed = parse_directives("<**!glm**> hello <**#crs,tab**>");
        assert_eq!(parsed.sticky.as_deref(), Some("glm"));
        assert_eq!(parsed.disabled, vec!["crs".to_string(), "tab".to_string()]);
    }
}
