//! DeepSeek account-mode session handshake: fetch a salt, solve a
//! proof-of-work puzzle against it, and exchange the answer for a session
//! token. Mirrors the refresh-path shape used by the OAuth-capable
//! providers (`codex::oauth::refresh_credential` and friends), just with a
//! POW step instead of a refresh-token grant.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use gproxy_provider_core::{
    AuthRetryAction, Credential, ProviderConfig, ProviderError, ProviderResult, UpstreamCtx,
    credential::{DeepSeekAccountCredential, DeepSeekCredential},
};

use crate::providers::http_client::{SharedClientKind, client_for_ctx};
use crate::token_store;

const TOKEN_STORE_PROVIDER: &str = "deepseek";

const POW_MAX_ATTEMPTS: u64 = 200_000;
const POW_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_DIFFICULTY: usize = 4;
const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    salt: String,
    #[serde(default = "default_difficulty")]
    difficulty: usize,
}

fn default_difficulty() -> usize {
    DEFAULT_DIFFICULTY
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_token: String,
    #[serde(default)]
    expires_at: i64,
}

#[derive(Clone)]
struct CachedSignature {
    signature: String,
    created_at: Instant,
}

static POW_CACHE: OnceLock<Mutex<HashMap<String, CachedSignature>>> = OnceLock::new();

fn pow_cache() -> &'static Mutex<HashMap<String, CachedSignature>> {
    POW_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(super) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Tries nonces `0..max_attempts` until `sha256(salt + nonce)` has
/// `difficulty` leading hex zeros. The nonce itself is the one-shot
/// signature handed back to the session-exchange endpoint.
fn solve_challenge(salt: &str, difficulty: usize, max_attempts: u64) -> ProviderResult<u64> {
    let prefix = "0".repeat(difficulty);
    for nonce in 0..max_attempts {
        let digest = Sha256::digest(format!("{salt}{nonce}").as_bytes());
        if hex_encode(&digest).starts_with(&prefix) {
            return Ok(nonce);
        }
    }
    Err(ProviderError::Other(format!(
        "deepseek_pow_exhausted: no solution within {max_attempts} attempts"
    )))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn request_challenge(ctx: &UpstreamCtx, base_url: &str) -> ProviderResult<ChallengeResponse> {
    let client = client_for_ctx(ctx, SharedClientKind::Global)?;
    let resp = client
        .post(format!(
            "{}/api/v0/users/challenge",
            base_url.trim_end_matches('/')
        ))
        .header("Content-Type", "application/json")
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    if !status.is_success() {
        return Err(ProviderError::Other(format!(
            "deepseek_challenge_failed: {status}"
        )));
    }
    serde_json::from_slice(&bytes).map_err(|err| ProviderError::Other(err.to_string()))
}

async fn exchange_session(
    ctx: &UpstreamCtx,
    base_url: &str,
    device_id: &str,
    salt: &str,
    signature: &str,
) -> ProviderResult<SessionResponse> {
    let client = client_for_ctx(ctx, SharedClientKind::Global)?;
    let body = serde_json::to_vec(&serde_json::json!({
        "device_id": device_id,
        "salt": salt,
        "answer": signature,
    }))
    .map_err(|err| ProviderError::Other(err.to_string()))?;
    let resp = client
        .post(format!(
            "{}/api/v0/users/session",
            base_url.trim_end_matches('/')
        ))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    if !status.is_success() {
        return Err(ProviderError::Other(format!(
            "deepseek_session_exchange_failed: {status}"
        )));
    }
    serde_json::from_slice(&bytes).map_err(|err| ProviderError::Other(err.to_string()))
}

/// Performs the salt+POW handshake (reusing a cached signature for the same
/// salt within `POW_CACHE_TTL_SECS`) and returns a refreshed account
/// credential. Non-account credentials are left alone.
pub(super) async fn refresh_session(
    ctx: &UpstreamCtx,
    config: &ProviderConfig,
    credential: &Credential,
) -> ProviderResult<AuthRetryAction> {
    let Credential::DeepSeek(DeepSeekCredential::Account(account)) = credential else {
        return Ok(AuthRetryAction::None);
    };

    if let Some(stored) =
        token_store::load_token_file::<DeepSeekAccountCredential>(TOKEN_STORE_PROVIDER, &account.device_id)
            .await?
    {
        if stored.pow_expires_at > now_secs() + TOKEN_EXPIRY_SKEW_SECS {
            return Ok(AuthRetryAction::UpdateCredential(Box::new(
                Credential::DeepSeek(DeepSeekCredential::Account(stored)),
            )));
        }
    }

    let base_url = super::deepseek_base_url(config)?;
    let challenge = request_challenge(ctx, base_url).await?;

    let cached = pow_cache()
        .lock()
        .ok()
        .and_then(|guard| guard.get(&challenge.salt).cloned())
        .filter(|entry| entry.created_at.elapsed() < Duration::from_secs(POW_CACHE_TTL_SECS));
    let signature = match cached {
        Some(entry) => entry.signature,
        None => {
            let nonce = solve_challenge(&challenge.salt, challenge.difficulty, POW_MAX_ATTEMPTS)?;
            let signature = nonce.to_string();
            if let Ok(mut guard) = pow_cache().lock() {
                guard.insert(
                    challenge.salt.clone(),
                    CachedSignature {
                        signature: signature.clone(),
                        created_at: Instant::now(),
                    },
                );
            }
            signature
        }
    };

    let session = exchange_session(ctx, base_url, &account.device_id, &challenge.salt, &signature)
        .await?;
    let mut updated = account.clone();
    updated.session_token = session.session_token;
    updated.pow_signature = Some(signature);
    updated.pow_expires_at = if session.expires_at > 0 {
        session.expires_at
    } else {
        now_secs() + POW_CACHE_TTL_SECS as i64
    };
    token_store::save_token_file(TOKEN_STORE_PROVIDER, &account.device_id, &updated).await?;
    Ok(AuthRetryAction::UpdateCredential(Box::new(
        Credential::DeepSeek(DeepSeekCredential::Account(updated)),
    )))
}
