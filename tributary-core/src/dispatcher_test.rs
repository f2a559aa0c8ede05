#[cfg(test)]
mod tests {
    use crate::errors::{ConsumerError, CoreError};
    use crate::{Header, Key, Message, MessageConsumer, MessageDispatcher, ShardPosition, TextMessage};
    use chrono::Utc;
    use serde::Deserialize;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Product {
        id: String,
        price: u32,
    }

    fn make_message(key: Key, payload: Option<&str>) -> TextMessage {
        TextMessage::new(
            key,
            Header::new(ShardPosition::from_position("p-1", "5"), Utc::now()),
            payload.map(str::to_string),
        )
    }

    /// Test: Key patterns match the whole compaction key
    ///
    /// Expected
    /// - "product-.*" matches "product-1" but not "old-product-1"
    /// - compound keys are matched on their compaction key
    #[test]
    fn test_key_pattern_matches_whole_compaction_key() {
        let dispatcher = MessageDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher
            .register_raw("product-.*", move |m: &TextMessage| {
                sink.lock().unwrap().push(m.key.compaction_key().to_string());
                Ok(())
            })
            .unwrap();

        dispatcher.accept(&make_message(Key::of("product-1"), Some("{}"))).unwrap();
        dispatcher.accept(&make_message(Key::of("old-product-1"), Some("{}"))).unwrap();
        dispatcher
            .accept(&make_message(Key::compound("shop-1", "product-2"), Some("{}")))
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["product-1", "product-2"]);
    }

    /// Test: Typed registrations receive decoded payloads
    ///
    /// Purpose
    /// - Validate JSON decoding into the registration's payload type
    /// - Ensure tombstones reach typed consumers as None without decoding
    #[test]
    fn test_typed_dispatch_and_tombstones() {
        let dispatcher = MessageDispatcher::new();
        let seen: Arc<Mutex<Vec<Option<Product>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher
            .register::<Product, _>(".*", move |m: Message<Product>| {
                sink.lock().unwrap().push(m.payload);
                Ok(())
            })
            .unwrap();

        dispatcher
            .accept(&make_message(Key::of("1"), Some(r#"{"id":"1","price":10}"#)))
            .unwrap();
        dispatcher.accept(&make_message(Key::of("1"), None)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Some(Product {
                    id: "1".to_string(),
                    price: 10
                }),
                None
            ]
        );
    }

    /// Test: Failing registrations do not affect the others
    ///
    /// Flow
    /// - Register a typed consumer that cannot decode the payload
    /// - Register a raw consumer that always errors
    /// - Register a raw consumer that records the message
    ///
    /// Expected
    /// - accept() succeeds
    /// - the recording consumer still receives the message
    #[test]
    fn test_failures_are_isolated() {
        let dispatcher = MessageDispatcher::new();
        let received = Arc::new(Mutex::new(0usize));

        dispatcher
            .register::<Product, _>(".*", |_m: Message<Product>| Ok(()))
            .unwrap();
        dispatcher
            .register_raw(".*", |_m: &TextMessage| -> Result<(), ConsumerError> {
                Err("consumer failed".into())
            })
            .unwrap();
        let sink = received.clone();
        dispatcher
            .register_raw(".*", move |_m: &TextMessage| {
                *sink.lock().unwrap() += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(dispatcher.len(), 3);

        dispatcher.accept(&make_message(Key::of("k"), Some("not json"))).unwrap();
        assert_eq!(*received.lock().unwrap(), 1);
    }

    #[test]
    fn test_invalid_key_pattern() {
        let dispatcher = MessageDispatcher::new();
        let result = dispatcher.register_raw("(unclosed", |_m: &TextMessage| Ok(()));
        assert!(matches!(result, Err(CoreError::InvalidKeyPattern { .. })));
        assert!(dispatcher.is_empty());
    }
}
