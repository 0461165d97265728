//! iFlow speaks OpenAI Chat Completions, with three provider-family quirks
//! on top: an HMAC-SHA256 request signature, a websearch endpoint rewrite,
//! and cookie-mode credentials that exchange for an API key on first use.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tiktoken_rs::o200k_base;

use gproxy_provider_core::{
    AuthRetryAction, Credential, DispatchRule, DispatchTable, Headers, HttpMethod, Proto,
    ProviderConfig, ProviderError, ProviderResult, Request, UpstreamCtx, UpstreamHttpRequest,
    UpstreamProvider, credential::IFlowCredential,
};

use crate::auth_extractor;
use crate::providers::http_client::{SharedClientKind, client_for_ctx};
use crate::token_store;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_STORE_PROVIDER: &str = "iflow";

const PROVIDER_NAME: &str = "iflow";
const DEFAULT_BASE_URL: &str = "https://apis.iflow.cn/v1";
const DEFAULT_WEBSEARCH_PATH: &str = "/chat/retrieve";
const MODEL_IFLOW_QWEN3: &str = "qwen3-max";
const MODEL_IFLOW_DEEPSEEK: &str = "deepseek-v3.2";
const IFLOW_BUSINESS_ERROR_STATUS: u16 = 439;

// iFlow speaks the OpenAI Chat Completions dialect natively; everything else
// is a protocol transform, same shape as deepseek/glm/qwen.
const DISPATCH_TABLE: DispatchTable = DispatchTable::new([
    // Claude
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    // Gemini
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    // OpenAI chat completions
    DispatchRule::Native,
    DispatchRule::Native,
    // OpenAI Responses (map to chat completions)
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    // OpenAI basic ops
    DispatchRule::Native,
    DispatchRule::Native,
    DispatchRule::Native,
    // OAuth / usage (not implemented)
    DispatchRule::Unsupported,
    DispatchRule::Unsupported,
    DispatchRule::Unsupported,
]);

#[derive(Debug, Default)]
pub struct IFlowProvider;

impl IFlowProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for IFlowProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn dispatch_table(&self, _config: &ProviderConfig) -> DispatchTable {
        DISPATCH_TABLE
    }

    async fn build_openai_chat(
        &self,
        _ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
        req: &gproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let base_url = iflow_base_url(config)?;
        let (api_key, session_id, user_agent) = iflow_api_key(credential)?;
        let model = req.body.model.as_str();
        let path = if is_websearch_model(model) {
            websearch_path(config)
        } else {
            "/chat/completions"
        };
        let url = build_url(Some(base_url), DEFAULT_BASE_URL, path);
        let is_stream = req.body.stream.unwrap_or(false);
        let body =
            serde_json::to_vec(&req.body).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, api_key);
        auth_extractor::set_accept_json(&mut headers);
        auth_extractor::set_content_type_json(&mut headers);
        if let Some(ua) = user_agent {
            auth_extractor::set_user_agent(&mut headers, ua);
        }
        finalize_iflow_headers(&mut headers, api_key, session_id)?;
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(Bytes::from(body)),
            is_stream,
        })
    }

    async fn build_openai_input_tokens(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        credential: &Credential,
        req: &gproxy_protocol::openai::count_tokens::request::InputTokenCountRequest,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let _ = iflow_api_key(credential)?;
        let text =
            serde_json::to_string(&req.body).map_err(|err| ProviderError::Other(err.to_string()))?;
        let bpe = o200k_base().map_err(|err| ProviderError::Other(err.to_string()))?;
        let tokens = bpe.encode_ordinary(&text).len() as i64;
        let response = gproxy_protocol::openai::count_tokens::response::InputTokenCountResponse {
            object: gproxy_protocol::openai::count_tokens::types::InputTokenObjectType::ResponseInputTokens,
            input_tokens: tokens,
        };
        let body =
            serde_json::to_vec(&response).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(local_json_request(body))
    }

    async fn build_openai_models_list(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        credential: &Credential,
        _req: &gproxy_protocol::openai::list_models::request::ListModelsRequest,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let _ = iflow_api_key(credential)?;
        let response = gproxy_protocol::openai::list_models::response::ListModelsResponse {
            object: gproxy_protocol::openai::list_models::response::ListObjectType::List,
            data: iflow_models(),
        };
        let body =
            serde_json::to_vec(&response).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(local_json_request(body))
    }

    async fn build_openai_models_get(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        credential: &Credential,
        req: &gproxy_protocol::openai::get_model::request::GetModelRequest,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let _ = iflow_api_key(credential)?;
        let model = req.path.model.as_str();
        let Some(found) = iflow_models().into_iter().find(|m| m.id == model) else {
            return Err(ProviderError::Other("model_not_found".to_string()));
        };
        let body =
            serde_json::to_vec(&found).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(local_json_request(body))
    }

    fn decide_unavailable(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        _credential: &Credential,
        _req: &Request,
        failure: &gproxy_provider_core::provider::UpstreamFailure,
    ) -> Option<gproxy_provider_core::provider::UnavailableDecision> {
        if let gproxy_provider_core::provider::UpstreamFailure::Http { status, .. } = failure {
            if *status == IFLOW_BUSINESS_ERROR_STATUS {
                return Some(gproxy_provider_core::provider::UnavailableDecision {
                    duration: std::time::Duration::from_secs(9_999 * 365 * 24 * 60 * 60),
                    reason: gproxy_provider_core::UnavailableReason::AuthInvalid,
                });
            }
        }
        gproxy_provider_core::provider::default_decide_unavailable(failure)
    }

    fn upgrade_credential<'a>(
        &'a self,
        ctx: &'a UpstreamCtx,
        _config: &'a ProviderConfig,
        credential: &'a Credential,
        _req: &'a Request,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = ProviderResult<Option<Credential>>> + Send + 'a>,
    > {
        Box::pin(async move {
            let Credential::IFlow(iflow) = credential else {
                return Ok(None);
            };
            if iflow.api_key.is_some() {
                return Ok(None);
            }
            if iflow.cookie.is_none() {
                return Ok(None);
            };
            let updated = exchange_and_persist(ctx, iflow).await?;
            Ok(Some(Credential::IFlow(updated)))
        })
    }
}

impl gproxy_provider_core::OAuthLifecycle for IFlowProvider {
    fn handle_upstream_invalid_token<'a>(
        &'a self,
        ctx: &'a UpstreamCtx,
        config: &'a ProviderConfig,
        credential: &'a Credential,
        req: &'a Request,
        failure: &'a gproxy_provider_core::provider::UpstreamFailure,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = ProviderResult<AuthRetryAction>> + Send + 'a>,
    > {
        Box::pin(async move {
            let is_business_error = matches!(
                failure,
                gproxy_provider_core::provider::UpstreamFailure::Http { status, .. }
                    if *status == IFLOW_BUSINESS_ERROR_STATUS || *status == 401
            );
            if !is_business_error {
                return Ok(AuthRetryAction::None);
            }
            let Credential::IFlow(iflow) = credential else {
                return Ok(AuthRetryAction::None);
            };
            if iflow.cookie.is_none() {
                return Ok(AuthRetryAction::None);
            }
            let updated = exchange_and_persist(ctx, iflow).await?;
            let _ = (config, req);
            Ok(AuthRetryAction::UpdateCredential(Box::new(
                Credential::IFlow(updated),
            )))
        })
    }
}

#[derive(Debug, Deserialize)]
struct CookieExchangeResponse {
    api_key: String,
    #[serde(default)]
    session_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct StoredIFlowToken {
    api_key: String,
    session_id: String,
}

fn cookie_alias(cookie: &str) -> String {
    hex_encode(&sha2::Sha256::digest(cookie.as_bytes()))[..16].to_string()
}

/// Exchanges iFlow's cookie for an API key, preferring a still-cached token
/// file over a fresh network round trip, and persists a successful exchange
/// for the next acquisition of this credential.
async fn exchange_and_persist(
    ctx: &UpstreamCtx,
    iflow: &IFlowCredential,
) -> ProviderResult<IFlowCredential> {
    let cookie = iflow
        .cookie
        .as_deref()
        .ok_or_else(|| ProviderError::InvalidConfig("iflow credential has no cookie".to_string()))?;
    let alias = cookie_alias(cookie);

    let mut updated = iflow.clone();
    if let Some(stored) =
        token_store::load_token_file::<StoredIFlowToken>(TOKEN_STORE_PROVIDER, &alias).await?
    {
        updated.api_key = Some(stored.api_key);
        if updated.session_id.is_none() && !stored.session_id.is_empty() {
            updated.session_id = Some(stored.session_id);
        }
        return Ok(updated);
    }

    let exchanged = exchange_cookie_for_api_key(ctx, cookie).await?;
    updated.api_key = Some(exchanged.api_key.clone());
    if updated.session_id.is_none() {
        updated.session_id = Some(exchanged.session_id.clone());
    }
    token_store::save_token_file(
        TOKEN_STORE_PROVIDER,
        &alias,
        &StoredIFlowToken {
            api_key: exchanged.api_key,
            session_id: exchanged.session_id,
        },
    )
    .await?;
    Ok(updated)
}

async fn exchange_cookie_for_api_key(
    ctx: &UpstreamCtx,
    cookie: &str,
) -> ProviderResult<CookieExchangeResponse> {
    let client = client_for_ctx(ctx, SharedClientKind::Global)?;
    let resp = client
        .get(format!("{DEFAULT_BASE_URL}/user/api-key"))
        .header("Cookie", cookie)
        .header("Accept", "application/json")
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
            "iflow_cookie_exchange_failed: {status}"
        )));
    }
    serde_json::from_slice(&bytes).map_err(|err| ProviderError::Other(err.to_string()))
}

fn iflow_base_url(config: &ProviderConfig) -> ProviderResult<&str> {
    match config {
        ProviderConfig::IFlow(cfg) => Ok(cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
        _ => Err(ProviderError::InvalidConfig(
            "expected ProviderConfig::IFlow".to_string(),
        )),
    }
}

fn websearch_path(config: &ProviderConfig) -> &str {
    match config {
        ProviderConfig::IFlow(cfg) => cfg
            .websearch_path
            .as_deref()
            .unwrap_or(DEFAULT_WEBSEARCH_PATH),
        _ => DEFAULT_WEBSEARCH_PATH,
    }
}

fn is_websearch_model(model: &str) -> bool {
    model.ends_with("-search") || model.contains("websearch")
}

fn iflow_api_key(credential: &Credential) -> ProviderResult<(&str, &str, Option<&str>)> {
    match credential {
        Credential::IFlow(IFlowCredential {
            api_key: Some(api_key),
            session_id,
            user_agent,
            ..
        }) => Ok((
            api_key.as_str(),
            session_id.as_deref().unwrap_or(""),
            user_agent.as_deref(),
        )),
        Credential::IFlow(_) => Err(ProviderError::InvalidConfig(
            "iflow credential has no api_key yet; cookie exchange must run first".to_string(),
        )),
        _ => Err(ProviderError::InvalidConfig(
            "expected Credential::IFlow".to_string(),
        )),
    }
}

/// iFlow signs every request with `hex(HMAC-SHA256(apiKey, "ua:sessionId:ts"))`.
fn finalize_iflow_headers(
    headers: &mut Headers,
    api_key: &str,
    session_id: &str,
) -> ProviderResult<()> {
    let ts = now_secs();
    let ua = gproxy_provider_core::header_get(headers, "User-Agent")
        .unwrap_or("gproxy")
        .to_string();
    let message = format!("{ua}:{session_id}:{ts}");
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .map_err(|err| ProviderError::Other(format!("iflow_hmac_key_failed: {err}")))?;
    mac.update(message.as_bytes());
    let signature = hex_encode(&mac.finalize().into_bytes());
    auth_extractor::set_header(headers, "X-IFlow-Signature", &signature);
    auth_extractor::set_header(headers, "X-IFlow-Timestamp", &ts.to_string());
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn local_json_request(body: Vec<u8>) -> UpstreamHttpRequest {
    let mut headers = Vec::new();
    auth_extractor::set_accept_json(&mut headers);
    auth_extractor::set_content_type_json(&mut headers);
    UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: "local://iflow".to_string(),
        headers,
        body: Some(Bytes::from(body)),
        is_stream: false,
    }
}

fn iflow_models() -> Vec<gproxy_protocol::openai::get_model::types::Model> {
    use gproxy_protocol::openai::get_model::types::{Model, ModelObjectType};
    [MODEL_IFLOW_QWEN3, MODEL_IFLOW_DEEPSEEK]
        .into_iter()
        .map(|id| Model {
            id: id.to_string(),
            created: None,
            object: ModelObjectType::Model,
            owned_by: "iflow".to_string(),
        })
        .collect()
}

fn build_url(base_url: Option<&str>, default_base: &str, path: &str) -> String {
    let base = base_url.unwrap_or(default_base).trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") && (path == "v1" || path.starts_with("v1/")) {
        path = path.trim_start_matches("v1/").trim_start_matches("v1");
    }
    format!("{base}/{path}")
}
