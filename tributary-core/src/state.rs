use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

use crate::dispatcher::MessageConsumer;
use crate::errors::{ConsumerError, CoreError, StateError};
use crate::message::TextMessage;

/// Mutable keyed store holding the current materialized value per key.
///
/// Implementations must tolerate concurrent `put`/`remove` from several partition tasks while
/// another task iterates with `consume_all`.
pub trait StateRepository<V>: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` and returns the previous value of the key, if any.
    fn put(&self, key: String, value: V) -> Option<V>;

    /// Atomically replaces the value of `key` with the result of `f`. Returning `None` removes the
    /// entry. Returns the new value.
    fn compute(&self, key: String, f: &mut dyn FnMut(Option<&V>) -> Option<V>) -> Option<V>;

    fn remove(&self, key: &str) -> Option<V>;

    fn key_set(&self) -> Vec<String>;

    /// Visits every entry. An error returned by `f` aborts the iteration and is propagated.
    fn consume_all(
        &self,
        f: &mut dyn FnMut(&str, &V) -> Result<(), StateError>,
    ) -> Result<(), StateError>;

    fn clear(&self);

    fn size(&self) -> usize;
}

/// In-memory [`StateRepository`] backed by a sharded concurrent map.
#[derive(Debug)]
pub struct ConcurrentMapStateRepository<V> {
    name: String,
    entries: DashMap<String, V>,
}

impl<V> ConcurrentMapStateRepository<V> {
    pub fn new(name: impl Into<String>) -> Self {
        ConcurrentMapStateRepository {
            name: name.into(),
            entries: DashMap::new(),
        }
    }
}

impl<V> StateRepository<V> for ConcurrentMapStateRepository<V>
where
    V: Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn put(&self, key: String, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    fn compute(&self, key: String, f: &mut dyn FnMut(Option<&V>) -> Option<V>) -> Option<V> {
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => match f(Some(entry.get())) {
                Some(value) => {
                    entry.insert(value.clone());
                    Some(value)
                }
                None => {
                    entry.remove();
                    None
                }
            },
            Entry::Vacant(entry) => {
                let value = f(None)?;
                entry.insert(value.clone());
                Some(value)
            }
        }
    }

    fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    fn key_set(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    fn consume_all(
        &self,
        f: &mut dyn FnMut(&str, &V) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        for entry in self.entries.iter() {
            f(entry.key(), entry.value())?;
        }
        Ok(())
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn size(&self) -> usize {
        self.entries.len()
    }
}

/// What a write-through consumer does with a deletion marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TombstonePolicy {
    /// Remove the key from the repository.
    #[default]
    Remove,
    /// Keep the key with an empty (default) value. Snapshots never contain such entries.
    Retain,
    /// Leave the repository untouched.
    Ignore,
}

type KeyMapper = Arc<dyn Fn(&TextMessage) -> String + Send + Sync>;
type ValueMapper<V> = Arc<dyn Fn(&TextMessage, &str) -> Result<V, ConsumerError> + Send + Sync>;

/// A [`MessageConsumer`] writing every message through to a [`StateRepository`].
pub struct StatefulMessageConsumer<V> {
    repository: Arc<dyn StateRepository<V>>,
    tombstone_policy: TombstonePolicy,
    key_mapper: KeyMapper,
    value_mapper: ValueMapper<V>,
}

impl<V> StatefulMessageConsumer<V>
where
    V: Default + Send + Sync + 'static,
{
    /// `value_mapper` receives the message and its (present) payload text.
    pub fn new<K, M>(
        repository: Arc<dyn StateRepository<V>>,
        tombstone_policy: TombstonePolicy,
        key_mapper: K,
        value_mapper: M,
    ) -> Self
    where
        K: Fn(&TextMessage) -> String + Send + Sync + 'static,
        M: Fn(&TextMessage, &str) -> Result<V, ConsumerError> + Send + Sync + 'static,
    {
        StatefulMessageConsumer {
            repository,
            tombstone_policy,
            key_mapper: Arc::new(key_mapper),
            value_mapper: Arc::new(value_mapper),
        }
    }

    pub fn repository(&self) -> &Arc<dyn StateRepository<V>> {
        &self.repository
    }
}

impl StatefulMessageConsumer<String> {
    /// Stores the payload text under the compaction key. This is the compaction write-through.
    pub fn raw(repository: Arc<dyn StateRepository<String>>, tombstone_policy: TombstonePolicy) -> Self {
        StatefulMessageConsumer::new(
            repository,
            tombstone_policy,
            |message| message.key.compaction_key().to_string(),
            |_, payload| Ok(payload.to_string()),
        )
    }
}

impl<V> StatefulMessageConsumer<V>
where
    V: DeserializeOwned + Default + Send + Sync + 'static,
{
    /// Stores the payload decoded from JSON under the compaction key.
    pub fn json(repository: Arc<dyn StateRepository<V>>, tombstone_policy: TombstonePolicy) -> Self {
        StatefulMessageConsumer::new(
            repository,
            tombstone_policy,
            |message| message.key.compaction_key().to_string(),
            |_, payload| serde_json::from_str(payload).map_err(|e| CoreError::from(e).into()),
        )
    }
}

impl<V> MessageConsumer for StatefulMessageConsumer<V>
where
    V: Default + Send + Sync + 'static,
{
    fn accept(&self, message: &TextMessage) -> Result<(), ConsumerError> {
        let key = (self.key_mapper)(message);
        match message.payload.as_deref() {
            Some(payload) => {
                let value = (self.value_mapper)(message, payload)?;
                self.repository.put(key, value);
            }
            None => {
                trace!(
                    target: "state_repository",
                    repository = self.repository.name(),
                    key = %key,
                    policy = ?self.tombstone_policy,
                    "tombstone received"
                );
                match self.tombstone_policy {
                    TombstonePolicy::Remove => {
                        self.repository.remove(&key);
                    }
                    TombstonePolicy::Retain => {
                        self.repository.put(key, V::default());
                    }
                    TombstonePolicy::Ignore => {}
                }
            }
        }
        Ok(())
    }
}
