use crate::openai::list_response_items::types::ResponseItemList;

pub type ListInputItemsResponse = ResponseItemList;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::list_response_items::types::ResponseItemListObjectType;

    #[test]
    fn deserializes_list_input_items_payload() {
        let json = r#"
        {
          "object": "list",
          "data": [],
          "first_id": "msg_1",
          "last_id": "msg_1",
          "has_more": false
        }
        "#;

        let parsed: ListInputItemsResponse =
            serde_json::from_str(json).expect("deserialize list input items payload");
        assert_eq!(parsed.object, ResponseItemListObjectType::List);
        assert!(parsed.data.is_empty());
    }
}
