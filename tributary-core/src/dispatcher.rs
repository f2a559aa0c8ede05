use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

use crate::errors::{ConsumerError, CoreError, Result};
use crate::message::{Message, TextMessage};

/// Receives the raw text messages of a channel.
pub trait MessageConsumer: Send + Sync {
    fn accept(&self, message: &TextMessage) -> std::result::Result<(), ConsumerError>;
}

impl<F> MessageConsumer for F
where
    F: Fn(&TextMessage) -> std::result::Result<(), ConsumerError> + Send + Sync,
{
    fn accept(&self, message: &TextMessage) -> std::result::Result<(), ConsumerError> {
        self(message)
    }
}

type Handler = Arc<dyn Fn(&TextMessage) -> std::result::Result<(), ConsumerError> + Send + Sync>;

struct Registration {
    key_pattern: Regex,
    handler: Handler,
}

/// Routes every message to all registrations whose key pattern matches the compaction key.
///
/// The dispatcher is itself a [`MessageConsumer`], so it can be handed directly to a receiver.
#[derive(Default)]
pub struct MessageDispatcher {
    registrations: RwLock<Vec<Arc<Registration>>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        MessageDispatcher::default()
    }

    /// Register a callback receiving the message unchanged.
    pub fn register_raw<F>(&self, key_pattern: &str, callback: F) -> Result<()>
    where
        F: Fn(&TextMessage) -> std::result::Result<(), ConsumerError> + Send + Sync + 'static,
    {
        let key_pattern = compile_key_pattern(key_pattern)?;
        self.push(Registration {
            key_pattern,
            handler: Arc::new(callback),
        });
        Ok(())
    }

    /// Register a callback receiving the payload decoded from JSON into `T`.
    ///
    /// Tombstones are passed on with a `None` payload without touching the decoder.
    pub fn register<T, F>(&self, key_pattern: &str, callback: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: Fn(Message<T>) -> std::result::Result<(), ConsumerError> + Send + Sync + 'static,
    {
        let key_pattern = compile_key_pattern(key_pattern)?;
        let handler = move |message: &TextMessage| {
            let payload = match message.payload.as_deref() {
                Some(text) => Some(serde_json::from_str::<T>(text).map_err(CoreError::from)?),
                None => None,
            };
            callback(message.clone().with_payload(payload))
        };
        self.push(Registration {
            key_pattern,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, registration: Registration) {
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(registration));
    }
}

impl MessageConsumer for MessageDispatcher {
    fn accept(&self, message: &TextMessage) -> std::result::Result<(), ConsumerError> {
        debug!(target: "message_dispatcher", key = %message.key, "dispatching message");
        let registrations = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for registration in registrations
            .iter()
            .filter(|r| r.key_pattern.is_match(message.key.compaction_key()))
        {
            if let Err(e) = (registration.handler)(message) {
                error!(
                    target: "message_dispatcher",
                    key = %message.key,
                    key_pattern = %registration.key_pattern,
                    error = %e,
                    "message consumer failed"
                );
            }
        }
        Ok(())
    }
}

// Patterns match the whole key, not a substring of it.
fn compile_key_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| CoreError::InvalidKeyPattern {
        pattern: pattern.to_string(),
        source,
    })
}
