use gproxy_protocol::gemini::count_tokens::request::{
    CountTokensPath as GeminiCountTokensPath, CountTokensRequest as GeminiCountTokensRequest,
    CountTokensRequestBody as GeminiCountTokensRequestBody,
};
use gproxy_protocol::gemini::count_tokens::types::{Content as GeminiContent, ContentRole, Part};
use gproxy_protocol::openai::count_tokens::request::InputTokenCountRequest as OpenAIInputTokenCountRequest;
use gproxy_protocol::openai::create_response::types::{
    EasyInputMessageContent, EasyInputMessageRole, InputContent, InputItem, InputParam, Item,
};

/// Convert an OpenAI input-token-count request into a Gemini count-tokens request.
/// Only text input is carried over.
pub fn transform_request(request: OpenAIInputTokenCountRequest) -> GeminiCountTokensRequest {
    let contents = match request.body.input {
        Some(InputParam::Text(text)) => vec![text_content(ContentRole::User, text)],
        Some(InputParam::Items(items)) => items.into_iter().filter_map(item_to_content).collect(),
        None => Vec::new(),
    };

    GeminiCountTokensRequest {
        path: GeminiCountTokensPath {
            model: request.body.model,
        },
        body: GeminiCountTokensRequestBody {
            contents: Some(contents),
            generate_content_request: None,
        },
    }
}

fn item_to_content(item: InputItem) -> Option<GeminiContent> {
    match item {
        InputItem::EasyMessage(message) => {
            let role = match message.role {
                EasyInputMessageRole::Assistant => ContentRole::Model,
                _ => ContentRole::User,
            };
            let text = match message.content {
                EasyInputMessageContent::Text(text) => text,
                EasyInputMessageContent::Parts(parts) => parts
                    .into_iter()
                    .filter_map(|part| match part {
                        InputContent::InputText(text) => Some(text.text),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            Some(text_content(role, text))
        }
        InputItem::Item(Item::InputMessage(message)) => {
            let text = message
                .content
                .into_iter()
                .filter_map(|part| match part {
                    InputContent::InputText(text) => Some(text.text),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            Some(text_content(ContentRole::User, text))
        }
        _ => None,
    }
}

fn text_content(role: ContentRole, text: String) -> GeminiContent {
    GeminiContent {
        parts: vec![Part {
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
        }],
        role: Some(role),
    }
}
