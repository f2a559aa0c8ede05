use chrono::{DateTime, Utc};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::message::TextMessage;

type MessagePredicate = Arc<dyn Fn(&TextMessage) -> bool + Send + Sync>;
type IdlePredicate = Arc<dyn Fn(Duration) -> bool + Send + Sync>;

/// Decides when a partition consumer should stop reading.
///
/// A condition is evaluated after every dispatched message and after every empty batch. The
/// idle check receives the lag behind the partition head reported with the empty batch. When a
/// condition is satisfied the consumer finishes the batch it is processing and returns.
#[derive(Clone)]
pub struct StopCondition {
    on_message: MessagePredicate,
    on_idle: IdlePredicate,
}

impl StopCondition {
    pub fn new<M, I>(on_message: M, on_idle: I) -> Self
    where
        M: Fn(&TextMessage) -> bool + Send + Sync + 'static,
        I: Fn(Duration) -> bool + Send + Sync + 'static,
    {
        StopCondition {
            on_message: Arc::new(on_message),
            on_idle: Arc::new(on_idle),
        }
    }

    /// Never stops on its own; consumption ends when the receiver is stopped or cancelled.
    pub fn shutdown() -> Self {
        StopCondition::new(|_| false, |_| false)
    }

    /// Stops as soon as the consumer has caught up with the head of the partition.
    pub fn end_of_channel() -> Self {
        StopCondition::new(
            |message| message.header.shard_position.duration_behind() == Some(Duration::ZERO),
            |lag| lag.is_zero(),
        )
    }

    /// Stops on the first batch without records.
    pub fn empty_response() -> Self {
        StopCondition::new(|_| false, |_| true)
    }

    /// Stops once the wall clock has passed `timestamp`.
    pub fn timestamp(timestamp: DateTime<Utc>) -> Self {
        StopCondition::new(move |_| Utc::now() > timestamp, move |_| Utc::now() > timestamp)
    }

    /// Stops on the first message that arrived after `now`.
    pub fn arrival_time_after(now: DateTime<Utc>) -> Self {
        StopCondition::new(
            move |message| message.header.arrival_timestamp > now,
            |_| false,
        )
    }

    /// A message-only condition; empty batches never satisfy it.
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&TextMessage) -> bool + Send + Sync + 'static,
    {
        StopCondition::new(predicate, |_| false)
    }

    pub fn and(self, other: StopCondition) -> Self {
        let (m1, i1) = (self.on_message, self.on_idle);
        let (m2, i2) = (other.on_message, other.on_idle);
        StopCondition::new(
            move |message| m1(message) && m2(message),
            move |lag| i1(lag) && i2(lag),
        )
    }

    pub fn or(self, other: StopCondition) -> Self {
        let (m1, i1) = (self.on_message, self.on_idle);
        let (m2, i2) = (other.on_message, other.on_idle);
        StopCondition::new(
            move |message| m1(message) || m2(message),
            move |lag| i1(lag) || i2(lag),
        )
    }

    pub fn is_satisfied_by(&self, message: &TextMessage) -> bool {
        (self.on_message)(message)
    }

    pub fn is_satisfied_when_idle(&self, lag: Duration) -> bool {
        (self.on_idle)(lag)
    }
}

impl Default for StopCondition {
    fn default() -> Self {
        StopCondition::shutdown()
    }
}

impl Debug for StopCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("StopCondition")
    }
}
