use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use tributary_client::{LogReceiver, LogSource, ReceiverOptions};
use tributary_core::{
    ChannelPosition, ConcurrentMapStateRepository, InterceptorChain, StateRepository,
    StatefulMessageConsumer, StopCondition, TombstonePolicy,
};

use crate::codec::SnapshotCodec;
use crate::errors::Result;
use crate::snapshot_file::snapshot_file_name;
use crate::snapshot_store::SnapshotStore;

const PARTIAL_SUFFIX: &str = ".partial";

/// Configuration of compaction runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionOptions {
    // What a deletion marker does to the compacted state
    pub tombstone_policy: TombstonePolicy,
}

/// Folds a channel into a snapshot archive: the previous snapshot plus everything the channel
/// received since, reduced to the latest value per compaction key.
pub struct CompactionService {
    source: Arc<dyn LogSource>,
    store: SnapshotStore,
    codec: SnapshotCodec,
    receiver_options: ReceiverOptions,
    options: CompactionOptions,
    interceptors: Arc<InterceptorChain>,
}

impl CompactionService {
    pub fn new(
        source: Arc<dyn LogSource>,
        store: SnapshotStore,
        receiver_options: ReceiverOptions,
        options: CompactionOptions,
    ) -> Self {
        let codec = SnapshotCodec::new(store.config().read_buffer_entries);
        CompactionService {
            source,
            store,
            codec,
            receiver_options,
            options,
            interceptors: Arc::new(InterceptorChain::new()),
        }
    }

    /// Messages dropped by `interceptors` never reach the compacted state.
    pub fn with_interceptors(mut self, interceptors: Arc<InterceptorChain>) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Runs one compaction of `channel` and returns the name of the published archive.
    ///
    /// A failed run publishes nothing and leaves earlier archives in place.
    pub async fn compact(&self, channel: &str) -> Result<String> {
        let started = Instant::now();
        let repository = Arc::new(ConcurrentMapStateRepository::<String>::new(format!(
            "compaction-{}",
            channel
        )));

        let compacted = self.run(channel, Arc::clone(&repository)).await;
        repository.clear();

        match &compacted {
            Ok(name) => info!(
                target: "compaction",
                channel = %channel,
                snapshot = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "compaction finished"
            ),
            Err(e) => warn!(
                target: "compaction",
                channel = %channel,
                error = %e,
                "compaction failed"
            ),
        }
        compacted
    }

    async fn run(
        &self,
        channel: &str,
        repository: Arc<ConcurrentMapStateRepository<String>>,
    ) -> Result<String> {
        let start_from = self.load_latest(channel, repository.as_ref()).await?;

        let receiver = LogReceiver::new(
            Arc::clone(&self.source),
            channel,
            self.receiver_options.clone(),
        )
        .with_interceptors(Arc::clone(&self.interceptors));
        let consumer = Arc::new(StatefulMessageConsumer::raw(
            repository.clone(),
            self.options.tombstone_policy,
        ));
        let stop_condition = compaction_stop_condition(Utc::now());
        let position = receiver
            .consume(start_from, stop_condition, consumer)
            .await?;

        info!(
            target: "compaction",
            channel = %channel,
            entries = repository.size(),
            position = %position,
            "channel consumed, writing snapshot"
        );

        let local_dir = &self.store.config().local_dir;
        tokio::fs::create_dir_all(local_dir).await?;
        let name = snapshot_file_name(channel, Utc::now());
        let temp = local_dir.join(format!("{}{}", name, PARTIAL_SUFFIX));

        self.codec
            .write_snapshot_file(position, repository, temp.clone())
            .await?;
        let uploaded = self.store.upload(&temp, &name).await;
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            warn!(
                target: "compaction",
                file = %temp.display(),
                error = %e,
                "unable to remove temporary snapshot file"
            );
        }
        uploaded?;

        // the new archive is published; failing to prune only leaves extra archives behind
        if let Err(e) = self.store.prune(channel).await {
            warn!(
                target: "compaction",
                channel = %channel,
                error = %e,
                "unable to prune old snapshots"
            );
        }
        Ok(name)
    }

    /// Loads the newest snapshot of `channel` into `repository` and returns its position, the
    /// horizon when there is none.
    async fn load_latest(
        &self,
        channel: &str,
        repository: &dyn StateRepository<String>,
    ) -> Result<ChannelPosition> {
        let Some(path) = self.store.retrieve_latest(channel).await? else {
            return Ok(ChannelPosition::from_horizon());
        };
        let (position, entries) = self.codec.read(&path).await?;
        let loaded = entries.load_into(repository).await?;
        info!(
            target: "compaction",
            channel = %channel,
            snapshot = %path.display(),
            entries = loaded,
            position = %position,
            "previous snapshot loaded"
        );
        Ok(position)
    }
}

/// A run ends once an empty fetch confirms the partition is drained, or on the first message
/// that arrived after `started`.
pub(crate) fn compaction_stop_condition(started: DateTime<Utc>) -> StopCondition {
    StopCondition::end_of_channel()
        .and(StopCondition::empty_response())
        .or(StopCondition::arrival_time_after(started))
}
