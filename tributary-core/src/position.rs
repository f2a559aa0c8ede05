use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Where consumption of a single partition (re)starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartFrom {
    /// Replay the partition from the oldest retained record.
    Horizon,
    /// Resume strictly after the recorded position.
    Position,
    /// Resume at or after the recorded timestamp.
    Timestamp,
}

/// The resume marker of one partition (shard) of a channel.
///
/// `position` is only meaningful for [`StartFrom::Position`], `timestamp` only for
/// [`StartFrom::Timestamp`]. `duration_behind` is an informational estimate of the lag behind
/// the head of the partition and is not part of the position's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardPosition {
    partition_id: String,
    start_from: StartFrom,
    position: String,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_behind: Option<Duration>,
}

impl ShardPosition {
    pub fn from_horizon(partition_id: impl Into<String>) -> Self {
        ShardPosition {
            partition_id: partition_id.into(),
            start_from: StartFrom::Horizon,
            position: String::new(),
            timestamp: None,
            duration_behind: None,
        }
    }

    /// Resume after `position`. An empty position is the horizon.
    pub fn from_position(partition_id: impl Into<String>, position: impl Into<String>) -> Self {
        let position = position.into();
        let start_from = if position.is_empty() {
            StartFrom::Horizon
        } else {
            StartFrom::Position
        };
        ShardPosition {
            partition_id: partition_id.into(),
            start_from,
            position,
            timestamp: None,
            duration_behind: None,
        }
    }

    pub fn from_timestamp(partition_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        ShardPosition {
            partition_id: partition_id.into(),
            start_from: StartFrom::Timestamp,
            position: String::new(),
            timestamp: Some(timestamp),
            duration_behind: None,
        }
    }

    pub fn with_duration_behind(mut self, duration_behind: Duration) -> Self {
        self.duration_behind = Some(duration_behind);
        self
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn start_from(&self) -> StartFrom {
        self.start_from
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn duration_behind(&self) -> Option<Duration> {
        self.duration_behind
    }

    pub fn is_horizon(&self) -> bool {
        self.start_from == StartFrom::Horizon
    }
}

impl PartialEq for ShardPosition {
    fn eq(&self, other: &Self) -> bool {
        self.partition_id == other.partition_id
            && self.start_from == other.start_from
            && self.position == other.position
            && self.timestamp == other.timestamp
    }
}

impl Eq for ShardPosition {}

impl Display for ShardPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.start_from {
            StartFrom::Horizon => write!(f, "{}@horizon", self.partition_id),
            StartFrom::Position => write!(f, "{}@{}", self.partition_id, self.position),
            StartFrom::Timestamp => match self.timestamp {
                Some(ts) => write!(f, "{}@{}", self.partition_id, ts.to_rfc3339()),
                None => write!(f, "{}@timestamp", self.partition_id),
            },
        }
    }
}

/// Resumable read position across all partitions of a channel.
///
/// A partition missing from the map is read from the horizon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPosition {
    shards: BTreeMap<String, ShardPosition>,
}

impl ChannelPosition {
    pub fn from_horizon() -> Self {
        ChannelPosition::default()
    }

    pub fn channel_position(shard_positions: impl IntoIterator<Item = ShardPosition>) -> Self {
        shard_positions.into_iter().collect()
    }

    /// Position of a single partition, or the horizon if nothing is known about it.
    pub fn shard(&self, partition_id: &str) -> ShardPosition {
        self.shards
            .get(partition_id)
            .cloned()
            .unwrap_or_else(|| ShardPosition::from_horizon(partition_id))
    }

    pub fn shards(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardPosition> {
        self.shards.values()
    }

    pub fn contains(&self, partition_id: &str) -> bool {
        self.shards.contains_key(partition_id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Union keyed by partition id; entries of `other` win on collision.
    pub fn merge(&self, other: &ChannelPosition) -> ChannelPosition {
        let mut shards = self.shards.clone();
        for (partition_id, position) in &other.shards {
            shards.insert(partition_id.clone(), position.clone());
        }
        ChannelPosition { shards }
    }

    pub fn merge_all<'a>(positions: impl IntoIterator<Item = &'a ChannelPosition>) -> ChannelPosition {
        positions
            .into_iter()
            .fold(ChannelPosition::from_horizon(), |acc, p| acc.merge(p))
    }

    pub fn with_shard(mut self, shard_position: ShardPosition) -> ChannelPosition {
        self.shards
            .insert(shard_position.partition_id.clone(), shard_position);
        self
    }

    /// The largest lag reported by any partition, if any partition reported one.
    pub fn max_duration_behind(&self) -> Option<Duration> {
        self.shards.values().filter_map(|s| s.duration_behind).max()
    }
}

impl FromIterator<ShardPosition> for ChannelPosition {
    fn from_iter<I: IntoIterator<Item = ShardPosition>>(iter: I) -> Self {
        let shards = iter
            .into_iter()
            .map(|s| (s.partition_id.clone(), s))
            .collect();
        ChannelPosition { shards }
    }
}

impl Display for ChannelPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, shard) in self.shards.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", shard)?;
        }
        write!(f, "]")
    }
}
