use crate::openai::count_tokens::types::InputTokenCount;

pub type InputTokenCountResponse = InputTokenCount;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_input_token_count_payload() {
        let json = r#"{ "object": "response.input_tokens", "input_tokens": 42 }"#;

        let parsed: InputTokenCountResponse =
            serde_json::from_str(json).expect("deserialize input token count payload");
        assert_eq!(parsed.input_tokens, 42);
    }
}
