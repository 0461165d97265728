use gproxy_protocol::claude::count_tokens::request::CountTokensRequest as ClaudeCountTokensRequest;
use gproxy_protocol::claude::count_tokens::types::{
    BetaContentBlockParam as ClaudeContentBlockParam, BetaMessageContent as ClaudeMessageContent,
    BetaMessageParam as ClaudeMessageParam, BetaMessageRole as ClaudeMessageRole,
    BetaSystemParam as ClaudeSystemParam, Model as ClaudeModel,
};
use gproxy_protocol::gemini::count_tokens::request::{
    CountTokensPath as GeminiCountTokensPath, CountTokensRequest as GeminiCountTokensRequest,
    CountTokensRequestBody as GeminiCountTokensRequestBody,
};
use gproxy_protocol::gemini::count_tokens::types::{Content as GeminiContent, ContentRole, Part};

/// Convert a Claude count-tokens request into a Gemini count-tokens request.
/// Only text content is carried over; tool schemas and thinking config are not
/// relevant to a token count and are dropped.
pub fn transform_request(request: ClaudeCountTokensRequest) -> GeminiCountTokensRequest {
    let model = match request.body.model {
        ClaudeModel::Custom(value) => value,
        ClaudeModel::Known(known) => serde_json::to_value(known)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string()),
    };

    let mut contents: Vec<GeminiContent> = Vec::new();
    if let Some(system) = system_text(request.body.system) {
        contents.push(GeminiContent {
            parts: vec![text_part(system)],
            role: Some(ContentRole::User),
        });
    }
    contents.extend(request.body.messages.into_iter().map(message_to_content));

    GeminiCountTokensRequest {
        path: GeminiCountTokensPath { model },
        body: GeminiCountTokensRequestBody {
            contents: Some(contents),
            generate_content_request: None,
        },
    }
}

fn system_text(system: Option<ClaudeSystemParam>) -> Option<String> {
    match system? {
        ClaudeSystemParam::Text(text) => Some(text),
        ClaudeSystemParam::Blocks(blocks) => {
            let text = blocks
                .into_iter()
                .map(|block| block.text)
                .collect::<Vec<_>>()
                .join("\n");
            if text.is_empty() { None } else { Some(text) }
        }
    }
}

fn message_to_content(message: ClaudeMessageParam) -> GeminiContent {
    let role = match message.role {
        ClaudeMessageRole::User => ContentRole::User,
        ClaudeMessageRole::Assistant => ContentRole::Model,
    };

    let text = match message.content {
        ClaudeMessageContent::Text(text) => text,
        ClaudeMessageContent::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(block_text)
            .collect::<Vec<_>>()
            .join("\n"),
    };

    GeminiContent {
        parts: vec![text_part(text)],
        role: Some(role),
    }
}

fn text_part(text: String) -> Part {
    Part {
        text: Some(text),
        inline_data: None,
        function_call: None,
        function_response: None,
        file_data: None,
        executable_code: None,
        code_execution_result: None,
        thought: None,
        thought_signature: None,
        part_metadata: None,
        video_metadata: None,
    }
}

fn block_text(block: ClaudeContentBlockParam) -> Option<String> {
    match block {
        ClaudeContentBlockParam::Text(text) => Some(text.text),
        _ => None,
    }
}
