use crate::gemini::get_model::types::Model;

pub type GetModelResponse = Model;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_get_model_payload() {
        let json = r#"
        {
          "name": "models/gemini-2.5-pro",
          "version": "001",
          "displayName": "Gemini 2.5 Pro"
        }
        "#;

        let parsed: GetModelResponse =
            serde_json::from_str(json).expect("deserialize gemini get model payload");
        assert_eq!(parsed.name, "models/gemini-2.5-pro");
    }
}
