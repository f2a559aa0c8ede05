use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tributary_core::{Key, ShardPosition, StartFrom};

use crate::errors::SourceError;
use crate::log_source::{
    Cursor, FetchResponse, LogSource, PartitionInfo, PartitionPage, SourceRecord, SourceResult,
};

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_PAGE_SIZE: usize = 100;

/// A [`LogSource`] keeping every channel in memory.
///
/// Offsets are per-partition sequence numbers starting at 1. Besides reading, it supports
/// closing partitions, expiring old records and injecting one-shot faults, which makes it
/// the log source of choice for tests and local runs.
#[derive(Debug)]
pub struct InMemoryLogSource {
    state: Mutex<State>,
    batch_size: usize,
    page_size: usize,
    end_of_partition: bool,
    fetches: AtomicUsize,
    cursors_opened: AtomicUsize,
}

#[derive(Debug, Default)]
struct State {
    channels: HashMap<String, BTreeMap<String, PartitionLog>>,
    fetch_faults: HashMap<String, VecDeque<SourceError>>,
    open_faults: HashMap<String, VecDeque<SourceError>>,
}

#[derive(Debug)]
struct PartitionLog {
    records: Vec<(u64, SourceRecord)>,
    next_seq: u64,
    first_retained: u64,
    closed: bool,
}

impl Default for PartitionLog {
    fn default() -> Self {
        PartitionLog {
            records: Vec::new(),
            next_seq: 1,
            first_retained: 1,
            closed: false,
        }
    }
}

impl Default for InMemoryLogSource {
    fn default() -> Self {
        InMemoryLogSource::new()
    }
}

impl InMemoryLogSource {
    pub fn new() -> Self {
        InMemoryLogSource {
            state: Mutex::new(State::default()),
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            end_of_partition: false,
            fetches: AtomicUsize::new(0),
            cursors_opened: AtomicUsize::new(0),
        }
    }

    /// Maximum number of records returned by one fetch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Maximum number of partitions returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Behave like a finite log: flag `end_of_partition` once a fetch reaches the last record.
    pub fn with_end_of_partition(mut self, end_of_partition: bool) -> Self {
        self.end_of_partition = end_of_partition;
        self
    }

    pub fn create_partition(&self, channel: &str, partition_id: &str) {
        let mut state = self.lock();
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .entry(partition_id.to_string())
            .or_default();
    }

    /// Appends a record arriving now and returns its offset.
    pub fn append(
        &self,
        channel: &str,
        partition_id: &str,
        key: Key,
        payload: Option<&str>,
    ) -> String {
        self.append_at(channel, partition_id, key, payload, Utc::now())
    }

    pub fn append_at(
        &self,
        channel: &str,
        partition_id: &str,
        key: Key,
        payload: Option<&str>,
        arrival_time: DateTime<Utc>,
    ) -> String {
        self.append_raw(
            channel,
            partition_id,
            key,
            payload.map(|p| p.as_bytes().to_vec()),
            arrival_time,
            HashMap::new(),
        )
    }

    /// Appends a record with an arbitrary byte payload and attributes.
    pub fn append_raw(
        &self,
        channel: &str,
        partition_id: &str,
        key: Key,
        payload: Option<Vec<u8>>,
        arrival_time: DateTime<Utc>,
        attributes: HashMap<String, String>,
    ) -> String {
        let mut state = self.lock();
        let log = state
            .channels
            .entry(channel.to_string())
            .or_default()
            .entry(partition_id.to_string())
            .or_default();
        let seq = log.next_seq;
        log.next_seq += 1;
        let offset = seq.to_string();
        log.records.push((
            seq,
            SourceRecord {
                key,
                payload,
                offset: offset.clone(),
                arrival_time,
                attributes,
            },
        ));
        offset
    }

    /// Marks a partition as closed. Readers finish the remaining records and then see the end
    /// of the partition.
    pub fn close_partition(&self, channel: &str, partition_id: &str) {
        let mut state = self.lock();
        if let Some(log) = state
            .channels
            .get_mut(channel)
            .and_then(|partitions| partitions.get_mut(partition_id))
        {
            log.closed = true;
        }
    }

    /// Drops every record with an offset lower than `offset`, like a retention period would.
    pub fn expire_before(&self, channel: &str, partition_id: &str, offset: &str) {
        let Ok(limit) = offset.parse::<u64>() else {
            return;
        };
        let mut state = self.lock();
        if let Some(log) = state
            .channels
            .get_mut(channel)
            .and_then(|partitions| partitions.get_mut(partition_id))
        {
            log.records.retain(|(seq, _)| *seq >= limit);
            log.first_retained = log.first_retained.max(limit.min(log.next_seq));
        }
    }

    /// The next fetch on `partition_id` fails with `error`.
    pub fn fail_next_fetch(&self, partition_id: &str, error: SourceError) {
        self.lock()
            .fetch_faults
            .entry(partition_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// The next cursor request on `partition_id` fails with `error`.
    pub fn fail_next_open(&self, partition_id: &str, error: SourceError) {
        self.lock()
            .open_faults
            .entry(partition_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn cursors_opened(&self) -> usize {
        self.cursors_opened.load(Ordering::SeqCst)
    }

    /// Number of retained records of a partition.
    pub fn len(&self, channel: &str, partition_id: &str) -> usize {
        self.lock()
            .channels
            .get(channel)
            .and_then(|partitions| partitions.get(partition_id))
            .map(|log| log.records.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unknown_partition(channel: &str, partition_id: &str) -> SourceError {
    SourceError::Other(format!(
        "unknown partition {} of channel {}",
        partition_id, channel
    ))
}

#[async_trait]
impl LogSource for InMemoryLogSource {
    async fn list_partitions(
        &self,
        channel: &str,
        page_token: Option<&str>,
    ) -> SourceResult<PartitionPage> {
        let start = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SourceError::Other(format!("invalid page token '{}'", token)))?,
            None => 0,
        };
        let state = self.lock();
        let Some(partitions) = state.channels.get(channel) else {
            return Ok(PartitionPage::default());
        };
        let page: Vec<PartitionInfo> = partitions
            .iter()
            .skip(start)
            .take(self.page_size)
            .map(|(partition_id, log)| PartitionInfo {
                partition_id: partition_id.clone(),
                is_open: !log.closed,
            })
            .collect();
        let next = start + page.len();
        let next_page_token = (next < partitions.len()).then(|| next.to_string());
        Ok(PartitionPage {
            partitions: page,
            next_page_token,
        })
    }

    async fn open_cursor(
        &self,
        channel: &str,
        partition_id: &str,
        position: &ShardPosition,
    ) -> SourceResult<Cursor> {
        self.cursors_opened.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(error) = state
            .open_faults
            .get_mut(partition_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let log = state
            .channels
            .get(channel)
            .and_then(|partitions| partitions.get(partition_id))
            .ok_or_else(|| unknown_partition(channel, partition_id))?;

        let next = match position.start_from() {
            StartFrom::Horizon => log.first_retained,
            StartFrom::Position => {
                let invalid = || SourceError::InvalidPosition {
                    partition_id: partition_id.to_string(),
                    position: position.position().to_string(),
                };
                let seq = position.position().parse::<u64>().map_err(|_| invalid())?;
                if seq >= log.next_seq || seq + 1 < log.first_retained {
                    return Err(invalid());
                }
                seq + 1
            }
            StartFrom::Timestamp => {
                let timestamp = position.timestamp().unwrap_or(DateTime::<Utc>::MIN_UTC);
                log.records
                    .iter()
                    .find(|(_, record)| record.arrival_time >= timestamp)
                    .map(|(seq, _)| *seq)
                    .unwrap_or(log.next_seq)
            }
        };

        Ok(Cursor {
            channel: channel.to_string(),
            partition_id: partition_id.to_string(),
            token: next.to_string(),
        })
    }

    async fn fetch(&self, cursor: &Cursor) -> SourceResult<FetchResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(error) = state
            .fetch_faults
            .get_mut(&cursor.partition_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let log = state
            .channels
            .get(&cursor.channel)
            .and_then(|partitions| partitions.get(&cursor.partition_id))
            .ok_or_else(|| unknown_partition(&cursor.channel, &cursor.partition_id))?;

        let next = cursor
            .token
            .parse::<u64>()
            .map_err(|_| SourceError::Other(format!("invalid cursor '{}'", cursor.token)))?;
        if next < log.first_retained {
            return Err(SourceError::ExpiredCursor {
                partition_id: cursor.partition_id.clone(),
            });
        }

        let records: Vec<SourceRecord> = log
            .records
            .iter()
            .filter(|(seq, _)| *seq >= next)
            .take(self.batch_size)
            .map(|(_, record)| record.clone())
            .collect();
        let new_next = records
            .last()
            .and_then(|r| r.offset.parse::<u64>().ok())
            .map(|seq| seq + 1)
            .unwrap_or(next);
        let caught_up = new_next >= log.next_seq;

        let lag = match (caught_up, records.last(), log.records.last()) {
            (false, Some(last), Some((_, head))) => (head.arrival_time - last.arrival_time)
                .to_std()
                .unwrap_or_default()
                .max(Duration::from_millis(1)),
            (false, _, _) => Duration::from_millis(1),
            (true, _, _) => Duration::ZERO,
        };

        let next_cursor = if caught_up && log.closed {
            None
        } else {
            Some(Cursor {
                channel: cursor.channel.clone(),
                partition_id: cursor.partition_id.clone(),
                token: new_next.to_string(),
            })
        };

        Ok(FetchResponse {
            records,
            next_cursor,
            lag,
            end_of_partition: self.end_of_partition && caught_up,
        })
    }
}
