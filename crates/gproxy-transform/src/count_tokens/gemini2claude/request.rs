use gproxy_protocol::claude::count_tokens::request::{
    CountTokensHeaders as ClaudeCountTokensHeaders, CountTokensRequest as ClaudeCountTokensRequest,
    CountTokensRequestBody as ClaudeCountTokensRequestBody,
};
use gproxy_protocol::claude::count_tokens::types::{
    BetaMessageContent, BetaMessageParam as ClaudeMessageParam, BetaMessageRole, Model as ClaudeModel,
};
use gproxy_protocol::gemini::count_tokens::request::CountTokensRequest as GeminiCountTokensRequest;
use gproxy_protocol::gemini::count_tokens::types::{Content as GeminiContent, ContentRole, Part};

/// Convert a Gemini count-tokens request into a Claude count-tokens request.
/// Only text parts are carried over; the inline `generateContentRequest` form is not supported.
pub fn transform_request(request: GeminiCountTokensRequest) -> ClaudeCountTokensRequest {
    let model = ClaudeModel::Custom(request.path.model);

    let messages = request
        .body
        .contents
        .unwrap_or_default()
        .into_iter()
        .map(content_to_message)
        .collect();

    ClaudeCountTokensRequest {
        headers: ClaudeCountTokensHeaders::default(),
        body: ClaudeCountTokensRequestBody {
            messages,
            model,
            system: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            output_config: None,
            output_format: None,
            context_management: None,
            mcp_servers: None,
        },
    }
}

fn content_to_message(content: GeminiContent) -> ClaudeMessageParam {
    let role = match content.role {
        Some(ContentRole::Model) => BetaMessageRole::Assistant,
        _ => BetaMessageRole::User,
    };

    let text = content
        .parts
        .into_iter()
        .filter_map(part_text)
        .collect::<Vec<_>>()
        .join("\n");

    ClaudeMessageParam {
        role,
        content: BetaMessageContent::Text(text),
    }
}

fn part_text(part: Part) -> Option<String> {
    part.text
}
