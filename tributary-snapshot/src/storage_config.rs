use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudBackend {
    S3,
    Gcs,
}

impl CloudBackend {
    pub(crate) fn provider(self) -> &'static str {
        match self {
            CloudBackend::S3 => "s3",
            CloudBackend::Gcs => "gcs",
        }
    }

    /// Keys of `BackendConfig::Cloud::options` understood by this backend.
    pub(crate) fn option_keys(self) -> &'static [&'static str] {
        match self {
            CloudBackend::S3 => &["endpoint", "region", "access_key", "secret_key"],
            CloudBackend::Gcs => &["endpoint", "credential_file"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalBackend {
    Fs,
    Memory,
}

/// Where snapshot archives are published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Cloud backends hosted out of process (S3, GCS)
    Cloud {
        backend: CloudBackend,
        /// A URI-like root, e.g. s3://bucket/prefix, gcs://bucket/prefix
        root: String,
        /// Optional backend-specific options (endpoint, region, credentials, etc.)
        #[serde(default)]
        options: HashMap<String, String>,
    },
    /// Local backends (fs, memory)
    Local {
        backend: LocalBackend,
        /// For fs: an absolute directory like file:///var/lib/tributary or /var/lib/tributary
        /// For memory: a logical namespace like memory:// (prefix is used as a virtual root)
        root: String,
    },
}

/// Snapshot publishing and local caching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Key prefix of the archives inside the object store
    pub prefix: String,
    /// Directory for downloaded archives and archives being written
    pub local_dir: PathBuf,
    /// Number of archives kept per channel, locally and remotely (at least 1)
    pub keep_snapshots: usize,
    /// A local copy older than this is downloaded again even if it matches the remote archive
    pub local_cache_max_age_secs: u64,
    /// Chunk size of ranged downloads and multipart uploads
    pub transfer_chunk_bytes: usize,
    /// Number of entries buffered between the archive parser and its reader
    pub read_buffer_entries: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            prefix: "snapshots".to_string(),
            local_dir: std::env::temp_dir().join("tributary-snapshots"),
            keep_snapshots: 6,
            local_cache_max_age_secs: 24 * 60 * 60,
            transfer_chunk_bytes: 8 * 1024 * 1024, // 8 MiB
            read_buffer_entries: 1024,
        }
    }
}

pub(crate) fn split_bucket_prefix(uri: &str) -> Result<(String, String), String> {
    // Accept formats: s3://bucket, s3://bucket/prefix, gcs://bucket/prefix
    match uri.split_once("://") {
        Some((_, rest)) => {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(format!("invalid uri, missing bucket: {}", uri));
            }
            Ok((bucket.to_string(), normalize_prefix(prefix)))
        }
        // If no scheme, treat entire string as bucket and no prefix
        None => Ok((uri.to_string(), String::new())),
    }
}

pub(crate) fn split_fs_root(uri_or_path: &str) -> Result<String, String> {
    // Accept file:///abs/path or /abs/path
    let path = uri_or_path.strip_prefix("file://").unwrap_or(uri_or_path);
    if path.is_empty() {
        return Err(format!("invalid fs root: '{}'", uri_or_path));
    }
    Ok(path.to_string())
}

pub(crate) fn normalize_prefix(p: &str) -> String {
    let p = p.strip_prefix("memory://").unwrap_or(p);
    p.trim_matches('/').to_string()
}
