use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tributary_core::{
    Header, InterceptorChain, MessageConsumer, ShardPosition, StartFrom, StopCondition,
    TextMessage,
};

use crate::{
    errors::{ReceiverError, Result, SourceError},
    log_source::{Cursor, LogSource, SourceRecord},
    receiver_options::ReceiverOptions,
    retry_manager::RetryManager,
};

/// Lag above which an idle partition is polled at the slow rate.
const FAR_BEHIND: Duration = Duration::from_secs(10);
const FAR_BEHIND_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Reads a single partition of a channel, from a start position until a stop condition is met.
#[derive(Clone)]
pub struct PartitionConsumer {
    // the log the partition belongs to
    source: Arc<dyn LogSource>,
    // the channel name
    channel: String,
    // the partition consumed by this instance
    partition_id: String,
    options: ReceiverOptions,
    retry_manager: RetryManager,
    interceptors: Arc<InterceptorChain>,
    // level-triggered stop flag shared with the owning receiver
    stopping: Arc<AtomicBool>,
    // cancels in-flight fetches and idle waits
    cancel: CancellationToken,
}

impl PartitionConsumer {
    pub fn new(
        source: Arc<dyn LogSource>,
        channel: impl Into<String>,
        partition_id: impl Into<String>,
        options: ReceiverOptions,
        interceptors: Arc<InterceptorChain>,
        stopping: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        let retry_manager = options.retry_manager();
        PartitionConsumer {
            source,
            channel: channel.into(),
            partition_id: partition_id.into(),
            options,
            retry_manager,
            interceptors,
            stopping,
            cancel,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Consumes the partition starting after `start` and returns the position reached.
    ///
    /// Every record advances the returned position, including records dropped by an interceptor
    /// or not decodable as UTF-8. A satisfied stop condition lets the current batch finish; the
    /// receiver's stop flag ends consumption before the next record.
    pub async fn consume(
        &self,
        start: ShardPosition,
        stop_condition: &StopCondition,
        consumer: &dyn MessageConsumer,
    ) -> Result<ShardPosition> {
        let started = Instant::now();
        let mut position = start;
        let mut consumed: u64 = 0;
        let mut stop_requested = false;
        // consecutive cursor expiries, reset by every successful fetch
        let mut expiries = 0;

        info!(
            target: "partition_consumer",
            channel = %self.channel,
            partition = %self.partition_id,
            start = %position,
            "partition consumption started"
        );

        let Some(mut cursor) = self.acquire_cursor(&mut position).await? else {
            return Ok(position);
        };

        loop {
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        position = %position,
                        "partition consumption cancelled"
                    );
                    return Ok(position);
                }
                fetched = self.source.fetch(&cursor) => fetched,
            };

            let response = match fetched {
                Ok(response) => response,
                Err(error @ SourceError::ExpiredCursor { .. }) => {
                    expiries += 1;
                    if expiries > self.retry_manager.max_retries() {
                        return Err(ReceiverError::RetriesExhausted {
                            partition_id: self.partition_id.clone(),
                            attempts: expiries,
                            source: error,
                        });
                    }
                    let backoff = self.retry_manager.calculate_backoff(expiries - 1);
                    warn!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        position = %position,
                        attempt = expiries,
                        backoff_ms = backoff.as_millis() as u64,
                        "cursor expired, requesting a new one"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(position),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    match self.acquire_cursor(&mut position).await? {
                        Some(renewed) => {
                            cursor = renewed;
                            continue;
                        }
                        None => return Ok(position),
                    }
                }
                Err(error) => return Err(error.into()),
            };
            expiries = 0;

            let lag = response.lag;
            let is_empty = response.records.is_empty();

            for record in response.records {
                if self.stopping.load(Ordering::SeqCst) {
                    info!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        position = %position,
                        "receiver stopping, leaving batch"
                    );
                    return Ok(position);
                }

                position = ShardPosition::from_position(self.partition_id.as_str(), record.offset.as_str())
                    .with_duration_behind(lag);
                consumed += 1;
                self.log_progress(consumed, started, lag);

                let Some(message) = self.decode(record, &position) else {
                    continue;
                };
                let Some(message) = self.interceptors.intercept(message) else {
                    debug!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        position = %position,
                        "message dropped by interceptor"
                    );
                    continue;
                };

                if let Err(e) = consumer.accept(&message) {
                    error!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        key = %message.key,
                        error = %e,
                        "message consumer failed"
                    );
                }
                if !stop_requested && stop_condition.is_satisfied_by(&message) {
                    stop_requested = true;
                }
            }

            if is_empty {
                position = position.with_duration_behind(lag);
                if stop_condition.is_satisfied_when_idle(lag) {
                    stop_requested = true;
                }
            }

            match response.next_cursor {
                Some(next) => cursor = next,
                None => {
                    info!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        "partition closed and fully consumed"
                    );
                    break;
                }
            }

            if stop_requested || response.end_of_partition || self.stopping.load(Ordering::SeqCst) {
                break;
            }

            if is_empty {
                let wait = if lag > FAR_BEHIND {
                    FAR_BEHIND_POLL_INTERVAL
                } else {
                    self.options.poll_interval()
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(position),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        info!(
            target: "partition_consumer",
            channel = %self.channel,
            partition = %self.partition_id,
            messages = consumed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            position = %position,
            "partition consumption finished"
        );
        Ok(position)
    }

    /// Opens a cursor at `position`, retrying transient failures. A position no longer retained
    /// by the log is replaced by the horizon. Returns `None` when the run was cancelled.
    async fn acquire_cursor(&self, position: &mut ShardPosition) -> Result<Option<Cursor>> {
        let mut attempts = 0;

        loop {
            match self
                .source
                .open_cursor(&self.channel, &self.partition_id, position)
                .await
            {
                Ok(cursor) => return Ok(Some(cursor)),
                Err(SourceError::InvalidPosition { .. })
                    if position.start_from() == StartFrom::Position =>
                {
                    warn!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        position = %position,
                        "given position not accessible, falling back to horizon"
                    );
                    *position = ShardPosition::from_horizon(self.partition_id.as_str());
                }
                Err(error) if self.retry_manager.is_retryable_error(&error) => {
                    attempts += 1;
                    if attempts > self.retry_manager.max_retries() {
                        return Err(ReceiverError::RetriesExhausted {
                            partition_id: self.partition_id.clone(),
                            attempts,
                            source: error,
                        });
                    }
                    let backoff = self.retry_manager.calculate_backoff(attempts - 1);
                    warn!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "unable to open cursor, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn decode(&self, record: SourceRecord, position: &ShardPosition) -> Option<TextMessage> {
        let payload = match record.payload {
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(
                        target: "partition_consumer",
                        partition = %self.partition_id,
                        position = %position,
                        error = %e,
                        "payload is not valid UTF-8, skipping record"
                    );
                    return None;
                }
            },
            None => None,
        };
        let header =
            Header::new(position.clone(), record.arrival_time).with_attributes(record.attributes);
        Some(TextMessage::new(record.key, header, payload))
    }

    fn log_progress(&self, consumed: u64, started: Instant, lag: Duration) {
        let every = self.options.log_every_n_messages;
        if every == 0 || consumed % every != 0 {
            return;
        }
        let elapsed = started.elapsed().as_secs_f64();
        let per_second = if elapsed > 0.0 {
            consumed as f64 / elapsed
        } else {
            0.0
        };
        info!(
            target: "partition_consumer",
            channel = %self.channel,
            partition = %self.partition_id,
            messages = consumed,
            per_second = %format!("{:.1}", per_second),
            behind_ms = lag.as_millis() as u64,
            "consumption progress"
        );
    }
}
