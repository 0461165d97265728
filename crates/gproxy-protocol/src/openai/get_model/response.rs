use crate::openai::get_model::types::Model;

pub type GetModelResponse = Model;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_get_model_payload() {
        let json = r#"
        {
          "id": "gpt-4.1",
          "created": 1741386163,
          "object": "model",
          "owned_by": "openai"
        }
        "#;

        let parsed: GetModelResponse =
            serde_json::from_str(json).expect("deserialize openai get model payload");
        assert_eq!(parsed.id, "gpt-4.1");
        assert_eq!(parsed.owned_by, "openai");
    }
}
