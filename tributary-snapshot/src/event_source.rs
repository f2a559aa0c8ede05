use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use tributary_client::LogReceiver;
use tributary_core::{
    ChannelPosition, Header, InterceptorChain, Key, MessageConsumer, MessageDispatcher,
    ShardPosition, StopCondition, TextMessage,
};

use crate::codec::SnapshotCodec;
use crate::errors::Result;
use crate::snapshot_file::snapshot_timestamp;
use crate::snapshot_store::SnapshotStore;

/// Attribute carrying the archive name on messages replayed from a snapshot.
pub const SNAPSHOT_ATTRIBUTE: &str = "snapshot";

/// Bootstraps consumers of a channel from its latest snapshot and then follows the live log
/// from the position the snapshot was captured at.
///
/// Snapshot entries and live messages take the same path: the receiver's interceptors, then the
/// dispatcher.
pub struct EventSource {
    receiver: LogReceiver,
    store: SnapshotStore,
    codec: SnapshotCodec,
    dispatcher: Arc<MessageDispatcher>,
}

impl EventSource {
    pub fn new(receiver: LogReceiver, store: SnapshotStore) -> Self {
        let codec = SnapshotCodec::new(store.config().read_buffer_entries);
        EventSource {
            receiver,
            store,
            codec,
            dispatcher: Arc::new(MessageDispatcher::new()),
        }
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn interceptors(&self) -> &Arc<InterceptorChain> {
        self.receiver.interceptors()
    }

    pub fn receiver(&self) -> &LogReceiver {
        &self.receiver
    }

    /// Replays the latest snapshot, then consumes the channel until `stop_condition` holds.
    /// Returns the position reached.
    ///
    /// A source stopped before or during the replay still replays the whole snapshot and then
    /// returns its position without reading the live log.
    pub async fn consume(&self, stop_condition: StopCondition) -> Result<ChannelPosition> {
        let start_from = self.replay_snapshot().await?;
        if self.receiver.is_stopping() {
            return Ok(start_from);
        }
        let consumer: Arc<dyn MessageConsumer> = self.dispatcher.clone();
        Ok(self
            .receiver
            .consume(start_from, stop_condition, consumer)
            .await?)
    }

    /// Dispatches every entry of the latest snapshot and returns the snapshot's position, the
    /// horizon when the channel has no snapshot.
    pub async fn replay_snapshot(&self) -> Result<ChannelPosition> {
        let channel = self.receiver.channel_name();
        let Some(path) = self.store.retrieve_latest(channel).await? else {
            return Ok(ChannelPosition::from_horizon());
        };
        let snapshot = file_name(&path);
        let arrival = snapshot_timestamp(&snapshot).unwrap_or_else(Utc::now);

        let (position, mut entries) = self.codec.read(&path).await?;
        let mut replayed: u64 = 0;
        // the snapshot position is only valid once every entry was dispatched, so a stop
        // request is honoured after the replay
        while let Some(entry) = entries.next().await {
            let (key, value) = entry?;
            let header = Header::new(ShardPosition::from_horizon(String::new()), arrival)
                .with_attributes(HashMap::from([(
                    SNAPSHOT_ATTRIBUTE.to_string(),
                    snapshot.clone(),
                )]));
            let message = TextMessage::new(Key::of(key), header, Some(value));
            replayed += 1;

            let Some(message) = self.interceptors().intercept(message) else {
                debug!(
                    target: "event_source",
                    channel = %channel,
                    "snapshot entry dropped by interceptor"
                );
                continue;
            };
            if let Err(e) = self.dispatcher.accept(&message) {
                error!(
                    target: "event_source",
                    channel = %channel,
                    key = %message.key,
                    error = %e,
                    "snapshot entry consumer failed"
                );
            }
        }

        info!(
            target: "event_source",
            channel = %channel,
            snapshot = %snapshot,
            entries = replayed,
            position = %position,
            "snapshot replayed"
        );
        Ok(position)
    }

    pub fn stop(&self) {
        self.receiver.stop();
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
