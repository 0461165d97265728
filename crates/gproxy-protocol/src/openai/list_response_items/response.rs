use crate::openai::list_response_items::types::ResponseItemList;

pub type ListResponseItemsResponse = ResponseItemList;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::list_response_items::types::ResponseItemListObjectType;

    #[test]
    fn deserializes_list_response_items_payload() {
        let json = r#"
        {
          "object": "list",
          "data": [],
          "first_id": "item_1",
          "last_id": "item_1",
          "has_more": false
        }
        "#;

        let parsed: ListResponseItemsResponse =
            serde_json::from_str(json).expect("deserialize list response items payload");
        assert_eq!(parsed.object, ResponseItemListObjectType::List);
        assert!(parsed.data.is_empty());
        assert!(!parsed.has_more);
    }
}
