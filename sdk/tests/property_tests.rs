use proptest::prelude::*;
use sdk::errors::{EngineError, OrcaErrorExt};
use sdk::harmony::{Content, Message};

// Error user hints never echo the raw error payload
proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let errs = vec![
            EngineError::Config(error_str.clone()),
            EngineError::Validation(error_str.clone()),
            EngineError::NotFound(error_str.clone()),
            EngineError::Conflict(error_str.clone()),
            EngineError::transient(error_str.clone()),
            EngineError::permanent(error_str.clone()),
            EngineError::ResourceUnavailable(error_str.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            if error_str.len() > 8 {
                prop_assert!(!hint.contains(error_str.as_str()));
            }
        }
    }
}

// Every content block serializes with exactly one discriminant and no nulls
proptest! {
    #[test]
    fn test_content_has_single_discriminant(text in "\\PC*", url in "https://[a-z]{1,12}/[a-z0-9]{1,8}") {
        let blocks = vec![
            Content::text(text.clone()),
            Content::ImageReference { url, mime_type: None },
            Content::Error { message: text, kind: None },
        ];

        for block in blocks {
            let value = serde_json::to_value(&block).unwrap();
            let obj = value.as_object().unwrap();
            prop_assert_eq!(obj.get("type").and_then(|t| t.as_str()), Some(block.type_name()));
            prop_assert!(obj.values().all(|v| !v.is_null()));
        }
    }

    #[test]
    fn test_user_message_preserves_text(text in "\\PC*") {
        let msg = Message::user(text.clone());
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.text(), text);
        prop_assert_eq!(back.id, msg.id);
    }
}
