use opendal::services::{Fs, Gcs, Memory, S3};
use opendal::{EntryMode, ErrorKind, Operator};
use std::collections::HashMap;
use tracing::warn;

use crate::errors::{Result, SnapshotError};
use crate::storage_config::{
    normalize_prefix, split_bucket_prefix, split_fs_root, BackendConfig, CloudBackend,
    LocalBackend,
};

/// An object found by [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// last path segment
    pub name: String,
    /// path relative to the store root, usable with the other store operations
    pub path: String,
    pub size: u64,
}

/// Thin wrapper over an opendal [`Operator`] holding snapshot archives.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    /// Optional extra prefix for key joining (used by Local backends)
    root_prefix: String,
    op: Operator,
    provider: &'static str,
}

fn builder_error(provider: &'static str) -> impl FnOnce(opendal::Error) -> SnapshotError {
    move |e| SnapshotError::Config(format!("opendal {} builder: {}", provider, e))
}

/// Operator rooted at `prefix` inside the bucket named by a `s3://bucket/prefix` style root.
fn cloud_operator(
    backend: CloudBackend,
    root: &str,
    options: &HashMap<String, String>,
) -> Result<Operator> {
    let (bucket, prefix) = split_bucket_prefix(root).map_err(SnapshotError::Config)?;
    let known = backend.option_keys();
    for key in options.keys().filter(|key| !known.contains(&key.as_str())) {
        warn!(
            target: "object_store",
            provider = backend.provider(),
            option = %key,
            accepted = ?known,
            "ignoring unknown storage option"
        );
    }
    let option = |key: &str| options.get(key).map(String::as_str);
    let root = format!("/{}", prefix);

    // opendal 0.54 builders consume self
    let op = match backend {
        CloudBackend::S3 => {
            let mut builder = S3::default().bucket(&bucket).root(&root);
            if let Some(endpoint) = option("endpoint") {
                builder = builder.endpoint(endpoint);
            }
            if let Some(region) = option("region") {
                builder = builder.region(region);
            }
            if let (Some(key_id), Some(secret)) = (option("access_key"), option("secret_key")) {
                builder = builder.access_key_id(key_id).secret_access_key(secret);
            }
            Operator::new(builder).map(|op| op.finish())
        }
        CloudBackend::Gcs => {
            let mut builder = Gcs::default().bucket(&bucket).root(&root);
            if let Some(endpoint) = option("endpoint") {
                builder = builder.endpoint(endpoint);
            }
            if let Some(path) = option("credential_file") {
                builder = builder.credential_path(path);
            }
            Operator::new(builder).map(|op| op.finish())
        }
    };
    op.map_err(builder_error(backend.provider()))
}

impl ObjectStore {
    pub fn new(cfg: BackendConfig) -> Result<Self> {
        let (op, root_prefix, provider) = match cfg {
            BackendConfig::Cloud {
                backend,
                root,
                options,
            } => (
                cloud_operator(backend, &root, &options)?,
                String::new(),
                backend.provider(),
            ),
            BackendConfig::Local {
                backend: LocalBackend::Fs,
                root,
            } => {
                let dir = split_fs_root(&root).map_err(SnapshotError::Config)?;
                let op = Operator::new(Fs::default().root(&dir))
                    .map_err(builder_error("fs"))?
                    .finish();
                (op, String::new(), "fs")
            }
            // the memory service has no root, the namespace becomes a key prefix
            BackendConfig::Local {
                backend: LocalBackend::Memory,
                root,
            } => {
                let op = Operator::new(Memory::default())
                    .map_err(builder_error("memory"))?
                    .finish();
                (op, normalize_prefix(&root), "memory")
            }
        };
        Ok(Self {
            root_prefix,
            op,
            provider,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Lists the files directly under `dir`. A missing directory lists as empty.
    pub async fn list(&self, dir: &str) -> Result<Vec<ObjectInfo>> {
        let key = self.join(dir);
        let key = if key.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", key)
        };
        let entries = match self.op.list(&key).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SnapshotError::storage("list", key)(e)),
        };

        let mut objects = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.metadata().mode() != EntryMode::FILE {
                continue;
            }
            let path = self.strip_root(entry.path());
            // not every backend reports sizes in listings
            let size = match entry.metadata().content_length() {
                0 => self.stat(&path).await?.unwrap_or(0),
                n => n,
            };
            objects.push(ObjectInfo {
                name: entry.name().trim_end_matches('/').to_string(),
                path,
                size,
            });
        }
        Ok(objects)
    }

    /// Returns the object's size, `None` when it does not exist.
    pub async fn stat(&self, path: &str) -> Result<Option<u64>> {
        let key = self.join(path);
        match self.op.stat(&key).await {
            Ok(meta) => Ok(Some(meta.content_length())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SnapshotError::storage("stat", key)(e)),
        }
    }

    pub async fn put_object(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut writer = self.open_streaming_writer(path, bytes.len().max(1)).await?;
        writer.write(bytes).await?;
        writer.close().await?;
        Ok(())
    }

    pub async fn get_object(&self, path: &str) -> Result<Vec<u8>> {
        let key = self.join(path);
        let data = self
            .op
            .read(&key)
            .await
            .map_err(SnapshotError::storage("read", key))?;
        Ok(data.to_vec())
    }

    /// Creates a streaming writer with the given chunk size. Cloud backends turn chunks into
    /// multipart uploads.
    pub async fn open_streaming_writer(&self, path: &str, chunk_size: usize) -> Result<ObjectWriter> {
        let key = self.join(path);
        let writer = self
            .op
            .writer_with(&key)
            .chunk(chunk_size)
            .await
            .map_err(SnapshotError::storage("open writer", key.clone()))?;
        Ok(ObjectWriter {
            inner: writer,
            key,
            bytes_written: 0,
        })
    }

    /// Creates a reader for chunked range reads from the start of the object.
    pub async fn open_ranged_reader(&self, path: &str) -> Result<ObjectRangeReader> {
        let key = self.join(path);
        let reader = self
            .op
            .reader(&key)
            .await
            .map_err(SnapshotError::storage("open reader", key.clone()))?;
        let size = self
            .op
            .stat(&key)
            .await
            .map_err(SnapshotError::storage("stat", key.clone()))?
            .content_length();
        Ok(ObjectRangeReader {
            inner: reader,
            key,
            offset: 0,
            size,
        })
    }

    /// Deletes an object. No-op if it does not exist.
    pub async fn delete_object(&self, path: &str) -> Result<()> {
        let key = self.join(path);
        self.op
            .delete(&key)
            .await
            .map_err(SnapshotError::storage("delete", key))
    }

    #[inline]
    fn join(&self, path: &str) -> String {
        let p = path.trim_matches('/');
        if self.root_prefix.is_empty() {
            p.to_string()
        } else if p.is_empty() {
            self.root_prefix.clone()
        } else {
            format!("{}/{}", self.root_prefix, p)
        }
    }

    fn strip_root(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.root_prefix.is_empty() {
            return key.to_string();
        }
        key.strip_prefix(self.root_prefix.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key)
            .to_string()
    }
}

/// Streaming object writer.
pub struct ObjectWriter {
    inner: opendal::Writer,
    key: String,
    bytes_written: u64,
}

impl ObjectWriter {
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let buffer = opendal::Buffer::from(buf.to_vec());
        self.inner
            .write(buffer)
            .await
            .map_err(SnapshotError::storage("write", self.key.clone()))?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<u64> {
        self.inner
            .close()
            .await
            .map_err(SnapshotError::storage("close", self.key.clone()))?;
        Ok(self.bytes_written)
    }

    pub async fn abort(&mut self) -> Result<()> {
        self.inner
            .abort()
            .await
            .map_err(SnapshotError::storage("abort", self.key.clone()))
    }
}

/// Ranged reader that supports chunked reads via explicit ranges.
pub struct ObjectRangeReader {
    inner: opendal::Reader,
    key: String,
    offset: u64,
    size: u64,
}

impl ObjectRangeReader {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the next chunk of up to `chunk_size` bytes; empty at the end of the object.
    pub async fn read_chunk(&mut self, chunk_size: usize) -> Result<Vec<u8>> {
        if self.offset >= self.size {
            return Ok(Vec::new());
        }
        let end: u64 = std::cmp::min(self.offset + (chunk_size as u64), self.size);
        let buf = self
            .inner
            .read(self.offset..end)
            .await
            .map_err(SnapshotError::storage("read", self.key.clone()))?;
        self.offset += buf.len() as u64;
        Ok(buf.to_vec())
    }
}
