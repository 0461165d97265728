use gproxy_protocol::gemini::count_tokens::request::CountTokensRequest as GeminiCountTokensRequest;
use gproxy_protocol::gemini::count_tokens::types::{Content as GeminiContent, ContentRole, Part};
use gproxy_protocol::openai::count_tokens::request::{
    InputTokenCountRequest as OpenAIInputTokenCountRequest,
    InputTokenCountRequestBody as OpenAIInputTokenCountRequestBody,
};
use gproxy_protocol::openai::create_response::types::{
    EasyInputMessage, EasyInputMessageContent, EasyInputMessageRole, EasyInputMessageType,
    InputItem, InputParam,
};

/// Convert a Gemini count-tokens request into an OpenAI input-token-count request.
/// Only text parts are carried over.
pub fn transform_request(request: GeminiCountTokensRequest) -> OpenAIInputTokenCountRequest {
    let items: Vec<InputItem> = request
        .body
        .contents
        .unwrap_or_default()
        .into_iter()
        .map(content_to_item)
        .collect();

    OpenAIInputTokenCountRequest {
        body: OpenAIInputTokenCountRequestBody {
            model: request.path.model,
            input: Some(InputParam::Items(items)),
            previous_response_id: None,
            tools: None,
            text: None,
            reasoning: None,
            truncation: None,
            instructions: None,
            conversation: None,
            tool_choice: None,
            parallel_tool_calls: None,
        },
    }
}

fn content_to_item(content: GeminiContent) -> InputItem {
    let role = match content.role {
        Some(ContentRole::Model) => EasyInputMessageRole::Assistant,
        _ => EasyInputMessageRole::User,
    };

    let text = content
        .parts
        .into_iter()
        .filter_map(part_text)
        .collect::<Vec<_>>()
        .join("\n");

    InputItem::EasyMessage(EasyInputMessage {
        r#type: EasyInputMessageType::Message,
        role,
        content: EasyInputMessageContent::Text(text),
    })
}

fn part_text(part: Part) -> Option<String> {
    part.text
}
