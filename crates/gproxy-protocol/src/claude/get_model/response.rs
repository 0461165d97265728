use crate::claude::get_model::types::ModelInfo;

pub type GetModelResponse = ModelInfo;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_get_model_payload() {
        let json = r#"
        {
          "id": "claude-opus-4-1-20250805",
          "created_at": "2025-08-05T00:00:00Z",
          "display_name": "Claude Opus 4.1",
          "type": "model"
        }
        "#;

        let parsed: GetModelResponse =
            serde_json::from_str(json).expect("deserialize claude get model payload");
        assert_eq!(parsed.id, "claude-opus-4-1-20250805");
        assert_eq!(parsed.display_name, "Claude Opus 4.1");
    }
}
