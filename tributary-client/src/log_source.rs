use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use tributary_core::{Key, ShardPosition};

use crate::errors::SourceError;

pub type SourceResult<T> = std::result::Result<T, SourceError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition_id: String,
    // closed partitions accept no more records (e.g. after a reshard)
    pub is_open: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionPage {
    pub partitions: Vec<PartitionInfo>,
    pub next_page_token: Option<String>,
}

/// Opaque iterator handle into one partition, issued by the log source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub channel: String,
    pub partition_id: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub key: Key,
    // None marks a deletion of the key
    pub payload: Option<Vec<u8>>,
    // opaque, monotonically increasing within the partition
    pub offset: String,
    pub arrival_time: DateTime<Utc>,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub records: Vec<SourceRecord>,
    // None once a closed partition has been read completely
    pub next_cursor: Option<Cursor>,
    // estimated lag behind the head of the partition after this batch
    pub lag: Duration,
    // set by finite sources once the cursor reached the last record
    pub end_of_partition: bool,
}

/// The partitioned, ordered log a receiver reads from.
///
/// Implementations wrap a concrete streaming service client. All methods may be called
/// concurrently from one task per partition.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Lists one page of the partitions of `channel`. `page_token` is the token returned with the
    /// previous page, `None` for the first page.
    async fn list_partitions(
        &self,
        channel: &str,
        page_token: Option<&str>,
    ) -> SourceResult<PartitionPage>;

    /// Resolves a resume position into a cursor. Fails with [`SourceError::InvalidPosition`] when
    /// the position is no longer retained by the log.
    async fn open_cursor(
        &self,
        channel: &str,
        partition_id: &str,
        position: &ShardPosition,
    ) -> SourceResult<Cursor>;

    async fn fetch(&self, cursor: &Cursor) -> SourceResult<FetchResponse>;
}
