//! Camoufox browser-fingerprint headers for DeepSeek account mode, read from
//! `<home>/.gproxy/camoufox-fp/<profile>.json`. Mirrors
//! `FileSnapshotSink`'s `<home>/.<app>/...` layout in
//! `gproxy-core/src/snapshot_writer.rs`.

use std::path::PathBuf;

use serde::Deserialize;

use gproxy_provider_core::{ProviderError, ProviderResult};

const APP_NAME: &str = "gproxy";

#[derive(Debug, Default, Deserialize)]
struct FingerprintProfile {
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    sec_ch_ua: Option<String>,
    #[serde(default)]
    sec_ch_ua_platform: Option<String>,
    #[serde(default)]
    accept_language: Option<String>,
}

fn profile_path(profile: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!(".{APP_NAME}"))
        .join("camoufox-fp")
        .join(format!("{profile}.json"))
}

/// A missing profile file is not an error: callers fall back to sending no
/// extra fingerprint headers.
pub(super) async fn fingerprint_headers(profile: &str) -> ProviderResult<Vec<(String, String)>> {
    let path = profile_path(profile);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(ProviderError::Other(format!(
                "camoufox_fp_read_failed: {err}"
            )));
        }
    };
    let parsed: FingerprintProfile = serde_json::from_slice(&bytes)
        .map_err(|err| ProviderError::Other(format!("camoufox_fp_parse_failed: {err}")))?;

    let mut headers = Vec::new();
    if let Some(ua) = parsed.user_agent {
        headers.push(("User-Agent".to_string(), ua));
    }
    if let Some(v) = parsed.sec_ch_ua {
        headers.push(("sec-ch-ua".to_string(), v));
    }
    if let Some(v) = parsed.sec_ch_ua_platform {
        headers.push(("sec-ch-ua-platform".to_string(), v));
    }
    if let Some(v) = parsed.accept_language {
        headers.push(("Accept-Language".to_string(), v));
    }
    Ok(headers)
}
