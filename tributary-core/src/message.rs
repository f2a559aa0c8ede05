use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use crate::position::ShardPosition;

const NO_KEY: &str = "nil";

// A message key. Compound keys are used when several logical entities share one physical
// partition key: the partition key routes the message, the compaction key identifies the entity
// in a compacted state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Simple(String),
    Compound {
        partition_key: String,
        compaction_key: String,
    },
}

impl Key {
    /// A simple key; the empty key is normalized to `"nil"`.
    pub fn of(key: impl Into<String>) -> Self {
        let key = key.into();
        if key.is_empty() {
            Key::Simple(NO_KEY.to_string())
        } else {
            Key::Simple(key)
        }
    }

    /// A compound key, collapsed into a simple one when both parts are equal.
    pub fn compound(partition_key: impl Into<String>, compaction_key: impl Into<String>) -> Self {
        let partition_key = partition_key.into();
        let compaction_key = compaction_key.into();
        if partition_key == compaction_key {
            Key::of(partition_key)
        } else {
            Key::Compound {
                partition_key,
                compaction_key,
            }
        }
    }

    pub fn partition_key(&self) -> &str {
        match self {
            Key::Simple(key) => key,
            Key::Compound { partition_key, .. } => partition_key,
        }
    }

    pub fn compaction_key(&self) -> &str {
        match self {
            Key::Simple(key) => key,
            Key::Compound { compaction_key, .. } => compaction_key,
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::Simple(key) => write!(f, "{}", key),
            Key::Compound {
                partition_key,
                compaction_key,
            } => write!(f, "{}:{}", partition_key, compaction_key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    // Position of the message within its partition, carrying the lag behind the partition head
    pub shard_position: ShardPosition,
    // Approximate time the message arrived in the log
    pub arrival_timestamp: DateTime<Utc>,
    // User-defined properties/attributes
    pub attributes: HashMap<String, String>,
}

impl Header {
    pub fn new(shard_position: ShardPosition, arrival_timestamp: DateTime<Utc>) -> Self {
        Header {
            shard_position,
            arrival_timestamp,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A keyed log message. A `None` payload is the deletion marker (tombstone) for its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<P = String> {
    pub key: Key,
    pub header: Header,
    pub payload: Option<P>,
}

/// A message whose payload is still the raw text read from the log.
pub type TextMessage = Message<String>;

impl<P> Message<P> {
    pub fn new(key: Key, header: Header, payload: Option<P>) -> Self {
        Message {
            key,
            header,
            payload,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// The same message with a different payload type.
    pub fn with_payload<T>(self, payload: Option<T>) -> Message<T> {
        Message {
            key: self.key,
            header: self.header,
            payload,
        }
    }
}

impl<P> Display for Message<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key:_{}_position:_{}_tombstone:_{}",
            self.key,
            self.header.shard_position,
            self.payload.is_none()
        )
    }
}
