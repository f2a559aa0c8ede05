#[cfg(test)]
mod tests {
    use crate::errors::StateError;
    use crate::{
        ConcurrentMapStateRepository, Header, Key, MessageConsumer, ShardPosition, StateRepository,
        StatefulMessageConsumer, TextMessage, TombstonePolicy,
    };
    use chrono::Utc;
    use serde::Deserialize;
    use std::sync::Arc;

    fn make_message(key: &str, payload: Option<&str>) -> TextMessage {
        TextMessage::new(
            Key::of(key),
            Header::new(ShardPosition::from_position("p-1", "1"), Utc::now()),
            payload.map(str::to_string),
        )
    }

    #[test]
    fn test_repository_basic_operations() {
        let repo = ConcurrentMapStateRepository::<String>::new("products");
        assert_eq!(repo.name(), "products");
        assert_eq!(repo.put("a".to_string(), "1".to_string()), None);
        assert_eq!(repo.put("a".to_string(), "2".to_string()), Some("1".to_string()));
        assert_eq!(repo.get("a").as_deref(), Some("2"));
        assert_eq!(repo.size(), 1);
        assert_eq!(repo.remove("a").as_deref(), Some("2"));
        assert_eq!(repo.get("a"), None);

        repo.put("x".to_string(), "1".to_string());
        repo.put("y".to_string(), "2".to_string());
        let mut keys = repo.key_set();
        keys.sort();
        assert_eq!(keys, vec!["x", "y"]);
        repo.clear();
        assert_eq!(repo.size(), 0);
    }

    /// Test: compute() inserts, updates and removes atomically
    #[test]
    fn test_repository_compute() {
        let repo = ConcurrentMapStateRepository::<u64>::new("counters");
        assert_eq!(repo.compute("c".to_string(), &mut |v| Some(v.copied().unwrap_or(0) + 1)), Some(1));
        assert_eq!(repo.compute("c".to_string(), &mut |v| Some(v.copied().unwrap_or(0) + 1)), Some(2));
        assert_eq!(repo.compute("c".to_string(), &mut |_| None), None);
        assert_eq!(repo.get("c"), None);
        assert_eq!(repo.compute("missing".to_string(), &mut |_| None), None);
        assert_eq!(repo.size(), 0);
    }

    /// Test: consume_all propagates the first error and stops iterating
    #[test]
    fn test_consume_all_aborts_on_error() {
        let repo = ConcurrentMapStateRepository::<String>::new("r");
        for i in 0..10 {
            repo.put(i.to_string(), i.to_string());
        }
        let mut visited = 0;
        let result = repo.consume_all(&mut |_, _| {
            visited += 1;
            if visited == 3 {
                Err(StateError::Aborted("enough".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(StateError::Aborted(_))));
        assert_eq!(visited, 3);
    }

    /// Test: Concurrent writers and a concurrent reader
    ///
    /// Purpose
    /// - Validate the repository tolerates put/remove from several tasks while iterating
    ///
    /// Expected
    /// - every writer's keys are present after all tasks completed
    #[tokio::test]
    async fn test_concurrent_writes_and_iteration() {
        let repo: Arc<dyn StateRepository<String>> =
            Arc::new(ConcurrentMapStateRepository::new("concurrent"));
        let mut handles = Vec::new();
        for writer in 0..4 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250 {
                    repo.put(format!("{}-{}", writer, i), i.to_string());
                    tokio::task::yield_now().await;
                }
            }));
        }
        let reader = {
            let repo = repo.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    let mut count = 0;
                    repo.consume_all(&mut |_, _| {
                        count += 1;
                        Ok(())
                    })
                    .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for handle in handles {
            handle.await.unwrap();
        }
        reader.await.unwrap();
        assert_eq!(repo.size(), 1000);
    }

    /// Test: Write-through consumer and tombstone policies
    ///
    /// Flow
    /// - Write key "a", then send a tombstone for "a" under each policy
    ///
    /// Expected
    /// - Remove: the key is gone
    /// - Retain: the key is kept with an empty value
    /// - Ignore: the previous value stays
    #[test]
    fn test_stateful_consumer_tombstone_policies() {
        for (policy, expected) in [
            (TombstonePolicy::Remove, None),
            (TombstonePolicy::Retain, Some(String::new())),
            (TombstonePolicy::Ignore, Some("v1".to_string())),
        ] {
            let repo: Arc<dyn StateRepository<String>> =
                Arc::new(ConcurrentMapStateRepository::new("t"));
            let consumer = StatefulMessageConsumer::raw(repo.clone(), policy);
            consumer.accept(&make_message("a", Some("v1"))).unwrap();
            assert_eq!(repo.get("a").as_deref(), Some("v1"));
            consumer.accept(&make_message("a", None)).unwrap();
            assert_eq!(repo.get("a"), expected, "policy {:?}", policy);
        }
    }

    #[derive(Debug, Default, Clone, PartialEq, Deserialize)]
    struct Price {
        amount: u32,
    }

    #[test]
    fn test_stateful_consumer_json_and_custom_mappers() {
        let repo: Arc<dyn StateRepository<Price>> = Arc::new(ConcurrentMapStateRepository::new("prices"));
        let consumer = StatefulMessageConsumer::json(repo.clone(), TombstonePolicy::Remove);
        consumer.accept(&make_message("p", Some(r#"{"amount":3}"#))).unwrap();
        assert_eq!(repo.get("p"), Some(Price { amount: 3 }));
        assert!(consumer.accept(&make_message("p", Some("garbage"))).is_err());

        let upper: Arc<dyn StateRepository<usize>> = Arc::new(ConcurrentMapStateRepository::new("len"));
        let consumer = StatefulMessageConsumer::new(
            upper.clone(),
            TombstonePolicy::Remove,
            |m: &TextMessage| m.key.compaction_key().to_uppercase(),
            |_m: &TextMessage, payload: &str| Ok(payload.len()),
        );
        consumer.accept(&make_message("abc", Some("12345"))).unwrap();
        assert_eq!(upper.get("ABC"), Some(5));
        assert_eq!(consumer.repository().size(), 1);
    }
}
