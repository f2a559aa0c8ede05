#[cfg(test)]
mod tests {
    use crate::errors::{ReceiverError, SourceError};
    use crate::{InMemoryLogSource, LogSource, PartitionConsumer, ReceiverOptions};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;
    use tributary_core::errors::ConsumerError;
    use tributary_core::{InterceptorChain, Key, ShardPosition, StartFrom, StopCondition, TextMessage};

    const CHANNEL: &str = "orders";
    const PARTITION: &str = "p-0";

    fn fast_options() -> ReceiverOptions {
        ReceiverOptions {
            max_retries: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            poll_interval_ms: 10,
            shutdown_grace_ms: 1_000,
            log_every_n_messages: 2,
        }
    }

    fn make_consumer(
        source: Arc<InMemoryLogSource>,
        interceptors: Arc<InterceptorChain>,
        stopping: Arc<AtomicBool>,
    ) -> PartitionConsumer {
        PartitionConsumer::new(
            source as Arc<dyn LogSource>,
            CHANNEL,
            PARTITION,
            fast_options(),
            interceptors,
            stopping,
            CancellationToken::new(),
        )
    }

    type Seen = Arc<Mutex<Vec<(String, Option<String>)>>>;

    fn recorder() -> (Seen, impl Fn(&TextMessage) -> Result<(), ConsumerError> + Send + Sync) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = move |m: &TextMessage| -> Result<(), ConsumerError> {
            sink.lock()
                .unwrap()
                .push((m.key.compaction_key().to_string(), m.payload.clone()));
            Ok(())
        };
        (seen, consumer)
    }

    fn fill(source: &InMemoryLogSource, from: u32, to: u32) {
        for i in from..=to {
            source.append(CHANNEL, PARTITION, Key::of(i.to_string()), Some(format!("v{}", i).as_str()));
        }
    }

    /// Test: Consume to the end of the channel
    ///
    /// Purpose
    /// - Validate in-order delivery and the returned resume position
    ///
    /// Flow
    /// - Append 10 records, consume from the horizon with end_of_channel
    ///
    /// Expected
    /// - all records delivered in order
    /// - the returned position is the offset of the last record
    #[tokio::test]
    async fn test_consume_until_end_of_channel() {
        let source = Arc::new(InMemoryLogSource::new().with_batch_size(4));
        fill(&source, 1, 10);
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let (seen, callback) = recorder();

        let position = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await
            .unwrap();

        assert_eq!(position.start_from(), StartFrom::Position);
        assert_eq!(position.position(), "10");
        let keys: Vec<String> = seen.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, (1..=10).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    /// Test: Resume correctness
    ///
    /// Flow
    /// - Consume records 1..5, append 6..8, resume from the returned position
    ///
    /// Expected
    /// - the second run delivers exactly 6..8
    #[tokio::test]
    async fn test_resume_after_position() {
        let source = Arc::new(InMemoryLogSource::new());
        fill(&source, 1, 5);
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );

        let (_, callback) = recorder();
        let position = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await
            .unwrap();

        fill(&source, 6, 8);
        let (seen, callback) = recorder();
        let resumed = consumer
            .consume(position, &StopCondition::end_of_channel(), &callback)
            .await
            .unwrap();
        let keys: Vec<String> = seen.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["6", "7", "8"]);
        assert_eq!(resumed.position(), "8");
    }

    /// Test: Stop condition finishes the current batch
    ///
    /// Flow
    /// - Batch size 5, stop on key "2"
    ///
    /// Expected
    /// - the whole first batch (1..5) is delivered, nothing of the second
    #[tokio::test]
    async fn test_stop_condition_finishes_batch() {
        let source = Arc::new(InMemoryLogSource::new().with_batch_size(5));
        fill(&source, 1, 12);
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let (seen, callback) = recorder();

        let position = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::from_fn(|m| m.key.compaction_key() == "2"),
                &callback,
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(position.position(), "5");
    }

    /// Test: The receiver's stop flag short-circuits the batch
    ///
    /// Flow
    /// - A consumer callback raises the stop flag while handling record 2
    ///
    /// Expected
    /// - records after 2 are not delivered
    /// - the returned position is the last delivered record
    #[tokio::test]
    async fn test_stop_flag_short_circuits_batch() {
        let source = Arc::new(InMemoryLogSource::new().with_batch_size(5));
        fill(&source, 1, 5);
        let stopping = Arc::new(AtomicBool::new(false));
        let consumer = make_consumer(source.clone(), Arc::new(InterceptorChain::new()), stopping.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = move |m: &TextMessage| -> Result<(), ConsumerError> {
            sink.lock().unwrap().push(m.key.compaction_key().to_string());
            if m.key.compaction_key() == "2" {
                stopping.store(true, Ordering::SeqCst);
            }
            Ok(())
        };

        let position = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::shutdown(),
                &callback,
            )
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["1", "2"]);
        assert_eq!(position.position(), "2");
    }

    /// Test: Dropped, undecodable and failing messages still advance the position
    ///
    /// Flow
    /// - Interceptor drops key "2", record 3 is not UTF-8, the consumer fails on key "4"
    ///
    /// Expected
    /// - the consumer sees 1, 4 and 5
    /// - tombstones are delivered with a None payload
    /// - the final position is the last record, 5
    #[tokio::test]
    async fn test_drops_and_failures_advance_position() {
        let source = Arc::new(InMemoryLogSource::new());
        source.append(CHANNEL, PARTITION, Key::of("1"), Some("a"));
        source.append(CHANNEL, PARTITION, Key::of("2"), Some("b"));
        source.append_raw(
            CHANNEL,
            PARTITION,
            Key::of("3"),
            Some(vec![0xff, 0xfe]),
            Utc::now(),
            HashMap::new(),
        );
        source.append(CHANNEL, PARTITION, Key::of("4"), Some("d"));
        source.append(CHANNEL, PARTITION, Key::of("5"), None);

        let interceptors = Arc::new(InterceptorChain::new());
        interceptors.register(|m: TextMessage| if m.key.compaction_key() == "2" { None } else { Some(m) });
        let consumer = make_consumer(source.clone(), interceptors, Arc::new(AtomicBool::new(false)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = move |m: &TextMessage| -> Result<(), ConsumerError> {
            sink.lock()
                .unwrap()
                .push((m.key.compaction_key().to_string(), m.payload.clone()));
            if m.key.compaction_key() == "4" {
                return Err("cannot handle 4".into());
            }
            Ok(())
        };

        let position = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("1".to_string(), Some("a".to_string())),
                ("4".to_string(), Some("d".to_string())),
                ("5".to_string(), None),
            ]
        );
        assert_eq!(position.position(), "5");
    }

    /// Test: Invalid start position falls back to the horizon
    #[tokio::test]
    async fn test_invalid_position_falls_back_to_horizon() {
        let source = Arc::new(InMemoryLogSource::new());
        fill(&source, 1, 10);
        source.expire_before(CHANNEL, PARTITION, "8");
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let (seen, callback) = recorder();

        let position = consumer
            .consume(
                ShardPosition::from_position(PARTITION, "3"),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await
            .unwrap();
        let keys: Vec<String> = seen.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["8", "9", "10"]);
        assert_eq!(position.position(), "10");
    }

    /// Test: Transient cursor failures are retried, persistent ones exhaust the retries
    #[tokio::test]
    async fn test_cursor_retries() {
        let source = Arc::new(InMemoryLogSource::new());
        fill(&source, 1, 2);
        source.fail_next_open(PARTITION, SourceError::Throttled("busy".into()));
        source.fail_next_open(PARTITION, SourceError::Unavailable("down".into()));
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let (seen, callback) = recorder();
        consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(source.cursors_opened(), 3);

        for _ in 0..4 {
            source.fail_next_open(PARTITION, SourceError::Throttled("busy".into()));
        }
        let result = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await;
        assert!(matches!(
            result,
            Err(ReceiverError::RetriesExhausted { attempts: 4, .. })
        ));
    }

    /// Test: An expired cursor is renewed from the current position
    ///
    /// Expected
    /// - no record is delivered twice or skipped
    #[tokio::test]
    async fn test_expired_cursor_is_renewed() {
        let source = Arc::new(InMemoryLogSource::new().with_batch_size(2));
        fill(&source, 1, 6);
        source.fail_next_fetch(
            PARTITION,
            SourceError::ExpiredCursor {
                partition_id: PARTITION.to_string(),
            },
        );
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let (seen, callback) = recorder();
        let position = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 6);
        assert_eq!(position.position(), "6");
        assert_eq!(source.cursors_opened(), 2);
    }

    /// Test: Repeated cursor expiries back off and eventually give up
    ///
    /// Purpose
    /// - Validate that cursor renewal is bounded by max_retries
    ///
    /// Flow
    /// - Queue max_retries expiries, consume to the end of the channel
    /// - Queue many more expiries than max_retries, consume again
    ///
    /// Expected
    /// - the first run renews the cursor each time and delivers every record
    /// - the second run fails with RetriesExhausted after max_retries renewals
    #[tokio::test]
    async fn test_expired_cursor_renewal_is_bounded() {
        let source = Arc::new(InMemoryLogSource::new().with_batch_size(2));
        fill(&source, 1, 6);
        let expired = || SourceError::ExpiredCursor {
            partition_id: PARTITION.to_string(),
        };
        for _ in 0..fast_options().max_retries {
            source.fail_next_fetch(PARTITION, expired());
        }
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let (seen, callback) = recorder();
        let position = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 6);
        assert_eq!(position.position(), "6");
        assert_eq!(source.cursors_opened(), 4);

        for _ in 0..1000 {
            source.fail_next_fetch(PARTITION, expired());
        }
        let result = consumer
            .consume(position, &StopCondition::end_of_channel(), &callback)
            .await;
        assert!(matches!(
            result,
            Err(ReceiverError::RetriesExhausted {
                attempts: 4,
                source: SourceError::ExpiredCursor { .. },
                ..
            })
        ));
        // one cursor for the start plus three renewals
        assert_eq!(source.cursors_opened(), 8);
    }

    /// Test: Other fetch errors are returned immediately
    #[tokio::test]
    async fn test_fatal_fetch_error_propagates() {
        let source = Arc::new(InMemoryLogSource::new());
        fill(&source, 1, 2);
        source.fail_next_fetch(PARTITION, SourceError::Other("corrupt".into()));
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let (_, callback) = recorder();
        let result = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::end_of_channel(),
                &callback,
            )
            .await;
        assert!(matches!(result, Err(ReceiverError::Source(SourceError::Other(_)))));
    }

    /// Test: Idle polling until an empty response stops the consumer
    #[tokio::test]
    async fn test_empty_partition_with_empty_response_condition() {
        let source = Arc::new(InMemoryLogSource::new());
        source.create_partition(CHANNEL, PARTITION);
        let consumer = make_consumer(
            source.clone(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let (seen, callback) = recorder();
        let position = consumer
            .consume(
                ShardPosition::from_horizon(PARTITION),
                &StopCondition::empty_response(),
                &callback,
            )
            .await
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert!(position.is_horizon());
        assert_eq!(source.fetch_count(), 1);
    }

    /// Test: Cancellation interrupts an idle wait
    #[tokio::test]
    async fn test_cancellation_interrupts_idle_wait() {
        let source = Arc::new(InMemoryLogSource::new());
        fill(&source, 1, 1);
        let cancel = CancellationToken::new();
        let consumer = PartitionConsumer::new(
            source.clone() as Arc<dyn LogSource>,
            CHANNEL,
            PARTITION,
            fast_options(),
            Arc::new(InterceptorChain::new()),
            Arc::new(AtomicBool::new(false)),
            cancel.clone(),
        );
        let (_, callback) = recorder();
        let handle = tokio::spawn(async move {
            consumer
                .consume(
                    ShardPosition::from_horizon(PARTITION),
                    &StopCondition::shutdown(),
                    &callback,
                )
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let position = handle.await.unwrap().unwrap();
        assert_eq!(position.position(), "1");
    }
}
