//! Token-file-mode credential storage for provider families that hand out
//! long-lived tokens outside the credential pool's normal refresh flow
//! (DeepSeek POW session tokens, iFlow exchanged API keys). Files live under
//! `<home>/.gproxy/tokens/<provider>-<alias>.json`, mirroring
//! `FileSnapshotSink`'s `<home>/.<app>/...` layout in
//! `gproxy-core/src/snapshot_writer.rs`.
//!
//! There's no file watcher in this stack (no `notify` dependency), so
//! refresh is read-through: callers reload the file on each credential
//! acquisition rather than being pushed updates.

use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;

use gproxy_provider_core::{ProviderError, ProviderResult};

const APP_NAME: &str = "gproxy";

fn token_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!(".{APP_NAME}"))
        .join("tokens")
}

pub(crate) fn token_file_path(provider: &str, alias: &str) -> PathBuf {
    token_dir().join(format!("{provider}-{alias}.json"))
}

/// Returns `None` when the file doesn't exist yet; any other IO/parse error
/// propagates.
pub(crate) async fn load_token_file<T: DeserializeOwned>(
    provider: &str,
    alias: &str,
) -> ProviderResult<Option<T>> {
    let path = token_file_path(provider, alias);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ProviderError::Other(format!(
                "token_file_read_failed({}): {err}",
                path.display()
            )));
        }
    };
    let parsed = serde_json::from_slice(&bytes).map_err(|err| {
        ProviderError::Other(format!("token_file_parse_failed({}): {err}", path.display()))
    })?;
    Ok(Some(parsed))
}

pub(crate) async fn save_token_file<T: Serialize + Sync>(
    provider: &str,
    alias: &str,
    value: &T,
) -> ProviderResult<()> {
    let path = token_file_path(provider, alias);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            ProviderError::Other(format!("token_dir_create_failed({}): {err}", parent.display()))
        })?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| ProviderError::Other(format!("token_file_encode_failed: {err}")))?;
    tokio::fs::write(&path, bytes).await.map_err(|err| {
        ProviderError::Other(format!("token_file_write_failed({}): {err}", path.display()))
    })
}
