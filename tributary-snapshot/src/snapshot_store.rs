use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::errors::{Result, SnapshotError};
use crate::object_store::ObjectStore;
use crate::snapshot_file::{
    is_snapshot_of, snapshot_channel, snapshot_file_prefix, snapshot_timestamp,
};
use crate::storage_config::SnapshotConfig;

const DOWNLOAD_SUFFIX: &str = ".download";

/// A snapshot archive published in the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub name: String,
    /// path of the archive inside the object store
    pub path: String,
    pub size: u64,
    /// capture time encoded in the name
    pub timestamp: Option<DateTime<Utc>>,
}

/// Publishes snapshot archives to an object store and keeps a local cache of the latest ones.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    store: ObjectStore,
    config: SnapshotConfig,
    // read instead of the store when set
    forced_snapshot: Option<PathBuf>,
}

impl SnapshotStore {
    pub fn new(store: ObjectStore, config: SnapshotConfig) -> Self {
        SnapshotStore {
            store,
            config,
            forced_snapshot: None,
        }
    }

    /// Makes [`retrieve_latest`](Self::retrieve_latest) return `path` instead of consulting the
    /// object store.
    pub fn with_forced_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.forced_snapshot = Some(path.into());
        self
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    /// Archives of `channel` in the object store, newest first.
    pub async fn list_snapshots(&self, channel: &str) -> Result<Vec<SnapshotMetadata>> {
        let mut snapshots: Vec<SnapshotMetadata> = self
            .store
            .list(&self.config.prefix)
            .await?
            .into_iter()
            .filter(|object| is_snapshot_of(channel, &object.name))
            .map(|object| SnapshotMetadata {
                timestamp: snapshot_timestamp(&object.name),
                name: object.name,
                path: object.path,
                size: object.size,
            })
            .collect();
        // timestamped names of one channel sort in capture order
        snapshots.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(snapshots)
    }

    pub async fn find_latest(&self, channel: &str) -> Result<Option<SnapshotMetadata>> {
        Ok(self.list_snapshots(channel).await?.into_iter().next())
    }

    /// Returns a local copy of the archive, downloading it unless an equally sized copy younger
    /// than `local_cache_max_age_secs` is already present.
    pub async fn retrieve(&self, metadata: &SnapshotMetadata) -> Result<PathBuf> {
        let local_dir = &self.config.local_dir;
        tokio::fs::create_dir_all(local_dir).await?;
        let local = local_dir.join(&metadata.name);

        if let Ok(meta) = tokio::fs::metadata(&local).await {
            let age = meta
                .modified()
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .unwrap_or(Duration::ZERO);
            if meta.len() == metadata.size && age <= self.max_cache_age() {
                debug!(
                    target: "snapshot_store",
                    snapshot = %metadata.name,
                    size = metadata.size,
                    "reusing local snapshot"
                );
                return Ok(local);
            }
        }

        if let Some(channel) = snapshot_channel(&metadata.name) {
            self.remove_local_snapshots(channel).await;
        }

        let temp = local_dir.join(format!("{}{}", metadata.name, DOWNLOAD_SUFFIX));
        if let Err(e) = self.download(&metadata.path, &temp).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        tokio::fs::rename(&temp, &local).await?;

        info!(
            target: "snapshot_store",
            snapshot = %metadata.name,
            size = metadata.size,
            local = %local.display(),
            "snapshot downloaded"
        );
        Ok(local)
    }

    /// Local copy of the newest archive of `channel`, or the forced snapshot when one is set.
    /// `None` when the channel has no snapshot yet.
    pub async fn retrieve_latest(&self, channel: &str) -> Result<Option<PathBuf>> {
        if let Some(forced) = &self.forced_snapshot {
            if tokio::fs::metadata(forced).await.is_err() {
                return Err(SnapshotError::Config(format!(
                    "forced snapshot '{}' does not exist",
                    forced.display()
                )));
            }
            info!(
                target: "snapshot_store",
                channel = %channel,
                snapshot = %forced.display(),
                "using forced local snapshot"
            );
            return Ok(Some(forced.clone()));
        }

        match self.find_latest(channel).await? {
            Some(metadata) => Ok(Some(self.retrieve(&metadata).await?)),
            None => {
                info!(
                    target: "snapshot_store",
                    channel = %channel,
                    "no snapshot found"
                );
                Ok(None)
            }
        }
    }

    /// Streams `local_file` into the object store as `name`.
    pub async fn upload(&self, local_file: &Path, name: &str) -> Result<SnapshotMetadata> {
        let path = self.remote_path(name);
        let chunk_size = self.chunk_size();
        let mut file = tokio::fs::File::open(local_file).await?;
        let mut writer = self.store.open_streaming_writer(&path, chunk_size).await?;

        let mut buf = vec![0u8; chunk_size];
        let written = loop {
            let read = match file.read(&mut buf).await {
                Ok(0) => break writer.close().await,
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            };
            if let Err(e) = writer.write(&buf[..read]).await {
                break Err(e);
            }
        };

        let size = match written {
            Ok(size) => size,
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!(
                        target: "snapshot_store",
                        snapshot = %name,
                        error = %abort,
                        "unable to abort snapshot upload"
                    );
                }
                return Err(e);
            }
        };

        info!(
            target: "snapshot_store",
            snapshot = %name,
            path = %path,
            size,
            provider = self.store.provider(),
            "snapshot uploaded"
        );
        Ok(SnapshotMetadata {
            name: name.to_string(),
            path,
            size,
            timestamp: snapshot_timestamp(name),
        })
    }

    /// Deletes all but the newest `keep_snapshots` archives of `channel`, remotely and locally.
    /// Returns the number of archives deleted.
    pub async fn prune(&self, channel: &str) -> Result<usize> {
        let keep = self.config.keep_snapshots.max(1);
        let mut deleted = 0;

        for snapshot in self.list_snapshots(channel).await?.into_iter().skip(keep) {
            self.store.delete_object(&snapshot.path).await?;
            debug!(
                target: "snapshot_store",
                snapshot = %snapshot.name,
                "remote snapshot deleted"
            );
            deleted += 1;
        }

        let mut local = self.local_snapshots(channel).await?;
        local.sort_by(|a, b| b.cmp(a));
        for name in local.into_iter().skip(keep) {
            let path = self.config.local_dir.join(&name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(
                    target: "snapshot_store",
                    file = %path.display(),
                    error = %e,
                    "unable to delete local snapshot"
                ),
            }
        }

        if deleted > 0 {
            info!(
                target: "snapshot_store",
                channel = %channel,
                deleted,
                keep,
                "old snapshots pruned"
            );
        }
        Ok(deleted)
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let chunk_size = self.chunk_size();
        let mut reader = self.store.open_ranged_reader(remote).await?;
        let mut file = tokio::fs::File::create(local).await?;
        loop {
            let chunk = reader.read_chunk(chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// File names of the local archives of `channel`.
    async fn local_snapshots(&self, channel: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config.local_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if is_snapshot_of(channel, name) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Removes cached archives of `channel` and leftovers of interrupted downloads.
    async fn remove_local_snapshots(&self, channel: &str) {
        let prefix = snapshot_file_prefix(channel);
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.local_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let stale = is_snapshot_of(channel, name)
                || (name.starts_with(&prefix) && name.ends_with(DOWNLOAD_SUFFIX));
            if !stale {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => debug!(
                    target: "snapshot_store",
                    file = %name,
                    "stale local snapshot removed"
                ),
                Err(e) => warn!(
                    target: "snapshot_store",
                    file = %name,
                    error = %e,
                    "unable to remove stale local snapshot"
                ),
            }
        }
    }

    fn remote_path(&self, name: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    fn chunk_size(&self) -> usize {
        self.config.transfer_chunk_bytes.max(1)
    }

    fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.config.local_cache_max_age_secs)
    }
}
