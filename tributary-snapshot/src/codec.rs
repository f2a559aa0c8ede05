use futures::Stream;
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use tributary_core::{ChannelPosition, ShardPosition, StartFrom, StateRepository};

use crate::errors::{Result, SnapshotError};

/// Name of the single archive entry holding the JSON document.
pub const DATA_ENTRY: &str = "data";

const POSITIONS_FIELD: &str = "startSequenceNumbers";
const DATA_FIELD: &str = "data";
const HORIZON_SEQUENCE_NUMBER: &str = "0";

#[derive(Debug, Serialize, Deserialize)]
struct PositionRecord {
    shard: String,
    #[serde(rename = "sequenceNumber", default)]
    sequence_number: Option<String>,
}

impl PositionRecord {
    fn of(position: &ShardPosition) -> Self {
        let sequence_number = match position.start_from() {
            StartFrom::Position => position.position().to_string(),
            StartFrom::Horizon | StartFrom::Timestamp => HORIZON_SEQUENCE_NUMBER.to_string(),
        };
        PositionRecord {
            shard: position.partition_id().to_string(),
            sequence_number: Some(sequence_number),
        }
    }

    fn into_position(self) -> ShardPosition {
        match self.sequence_number.as_deref() {
            None | Some("") | Some(HORIZON_SEQUENCE_NUMBER) => ShardPosition::from_horizon(self.shard),
            Some(sequence_number) => ShardPosition::from_position(self.shard, sequence_number),
        }
    }
}

/// Reads and writes snapshot archives: a ZIP file with one deflated `data` entry holding
///
/// ```text
/// { "startSequenceNumbers": [ { "shard": "..", "sequenceNumber": ".." } ],
///   "data": [ { "<key>": "<value>" } ] }
/// ```
///
/// Both directions stream; neither materializes the JSON document in memory.
#[derive(Debug, Clone)]
pub struct SnapshotCodec {
    // entries buffered between the parsing thread and the reader
    read_buffer: usize,
}

impl Default for SnapshotCodec {
    fn default() -> Self {
        SnapshotCodec::new(1024)
    }
}

impl SnapshotCodec {
    pub fn new(read_buffer: usize) -> Self {
        SnapshotCodec {
            read_buffer: read_buffer.max(1),
        }
    }

    /// Writes `position` and every non-empty entry of `repository` as an archive into `writer`.
    /// Blocking; returns the finished writer.
    pub fn write<W: Write + Seek>(
        &self,
        position: &ChannelPosition,
        repository: &dyn StateRepository<String>,
        writer: W,
    ) -> Result<W> {
        let mut zip = ZipWriter::new(writer);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(true);
        zip.start_file(DATA_ENTRY, options)?;

        write!(zip, "{{\"{}\":[", POSITIONS_FIELD)?;
        for (i, shard_position) in position.iter().enumerate() {
            if i > 0 {
                zip.write_all(b",")?;
            }
            serde_json::to_writer(&mut zip, &PositionRecord::of(shard_position))?;
        }
        write!(zip, "],\"{}\":[", DATA_FIELD)?;

        let mut written: u64 = 0;
        repository.consume_all(&mut |key, value| {
            // retained tombstones
            if value.is_empty() {
                return Ok(());
            }
            if written > 0 {
                zip.write_all(b",")?;
            }
            zip.write_all(b"{")?;
            serde_json::to_writer(&mut zip, key).map_err(std::io::Error::from)?;
            zip.write_all(b":")?;
            serde_json::to_writer(&mut zip, value).map_err(std::io::Error::from)?;
            zip.write_all(b"}")?;
            written += 1;
            Ok(())
        })?;
        zip.write_all(b"]}")?;

        let writer = zip.finish()?;
        debug!(
            target: "snapshot_codec",
            repository = repository.name(),
            entries = written,
            shards = position.len(),
            "snapshot written"
        );
        Ok(writer)
    }

    /// Writes the archive to `path` on a blocking thread. A partially written file is removed
    /// when writing fails. Returns the archive size in bytes.
    pub async fn write_snapshot_file(
        &self,
        position: ChannelPosition,
        repository: Arc<dyn StateRepository<String>>,
        path: PathBuf,
    ) -> Result<u64> {
        let codec = self.clone();
        tokio::task::spawn_blocking(move || {
            let written = File::create(&path)
                .map_err(SnapshotError::from)
                .and_then(|file| codec.write(&position, repository.as_ref(), BufWriter::new(file)))
                .and_then(|mut writer| {
                    writer.flush()?;
                    Ok(std::fs::metadata(&path)?.len())
                });
            if written.is_err() {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            target: "snapshot_codec",
                            path = %path.display(),
                            error = %e,
                            "unable to remove partial snapshot file"
                        );
                    }
                }
            }
            written
        })
        .await?
    }

    /// Opens the archive at `path` and returns its position together with a lazy stream of its
    /// entries. Parsing runs on a blocking thread and stops early when the stream is dropped.
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<(ChannelPosition, SnapshotEntries)> {
        let path = path.as_ref().to_path_buf();
        let (position_tx, position_rx) = oneshot::channel();
        let (entry_tx, entry_rx) = mpsc::channel(self.read_buffer);

        let parser = tokio::task::spawn_blocking(move || {
            let mut sink = EntrySink {
                position: Some(position_tx),
                entries: entry_tx,
                receiver_gone: false,
                out_of_order: false,
            };
            let parsed = parse_archive(&path, &mut sink);
            sink.finish(parsed);
        });

        match position_rx.await {
            Ok(Ok(position)) => Ok((position, SnapshotEntries::new(entry_rx))),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // the parser ended without reporting, which only happens when it panicked
                parser.await?;
                Err(SnapshotError::Format(
                    "snapshot parser ended without a position".to_string(),
                ))
            }
        }
    }
}

fn parse_archive(path: &Path, sink: &mut EntrySink) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let entry = archive.by_name(DATA_ENTRY)?;
    let mut de = serde_json::Deserializer::from_reader(BufReader::new(entry));
    match DocumentSeed(&mut *sink).deserialize(&mut de) {
        Ok(()) => {}
        Err(_) if sink.receiver_gone => return Ok(()),
        Err(e) if sink.out_of_order => return Err(SnapshotError::Format(e.to_string())),
        Err(e) => return Err(e.into()),
    }
    de.end()?;
    Ok(())
}

/// Hands parsed values from the blocking parser to the async side.
struct EntrySink {
    position: Option<oneshot::Sender<Result<ChannelPosition>>>,
    entries: mpsc::Sender<Result<(String, String)>>,
    receiver_gone: bool,
    out_of_order: bool,
}

impl EntrySink {
    fn send_position(&mut self, position: ChannelPosition) {
        if let Some(tx) = self.position.take() {
            if tx.send(Ok(position)).is_err() {
                self.receiver_gone = true;
            }
        }
    }

    /// Returns false once the reading side has gone away.
    fn send_entry(&mut self, key: String, value: String) -> bool {
        if self.entries.blocking_send(Ok((key, value))).is_err() {
            self.receiver_gone = true;
        }
        !self.receiver_gone
    }

    fn finish(mut self, parsed: Result<()>) {
        match parsed {
            Ok(()) => {
                // no position array at all: the snapshot covers the whole channel from the start
                self.send_position(ChannelPosition::from_horizon());
            }
            Err(e) => match self.position.take() {
                Some(tx) => {
                    let _ = tx.send(Err(e));
                }
                None => {
                    let _ = self.entries.blocking_send(Err(e));
                }
            },
        }
    }
}

struct DocumentSeed<'a>(&'a mut EntrySink);

impl<'de, 'a> DeserializeSeed<'de> for DocumentSeed<'a> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de, 'a> Visitor<'de> for DocumentSeed<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a snapshot document")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(field) = map.next_key::<String>()? {
            match field.as_str() {
                POSITIONS_FIELD => {
                    let records: Vec<PositionRecord> = map.next_value()?;
                    let position = records
                        .into_iter()
                        .map(PositionRecord::into_position)
                        .collect::<ChannelPosition>();
                    self.0.send_position(position);
                    if self.0.receiver_gone {
                        return Err(de::Error::custom("snapshot reader dropped"));
                    }
                }
                DATA_FIELD => {
                    if self.0.position.is_some() {
                        self.0.out_of_order = true;
                        return Err(de::Error::custom(format!(
                            "'{}' must precede '{}'",
                            POSITIONS_FIELD, DATA_FIELD
                        )));
                    }
                    map.next_value_seed(DataSeed(&mut *self.0))?;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }
}

struct DataSeed<'a>(&'a mut EntrySink);

impl<'de, 'a> DeserializeSeed<'de> for DataSeed<'a> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, 'a> Visitor<'de> for DataSeed<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of key/value objects")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while seq.next_element_seed(EntrySeed(&mut *self.0))?.is_some() {}
        Ok(())
    }
}

struct EntrySeed<'a>(&'a mut EntrySink);

impl<'de, 'a> DeserializeSeed<'de> for EntrySeed<'a> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de, 'a> Visitor<'de> for EntrySeed<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a key/value object")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            let value = match map.next_value::<serde_json::Value>()? {
                serde_json::Value::Null => continue,
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            if !self.0.send_entry(key, value) {
                return Err(de::Error::custom("snapshot reader dropped"));
            }
        }
        Ok(())
    }
}

/// Lazily parsed `(key, value)` entries of a snapshot. Finite and single-pass.
pub struct SnapshotEntries {
    inner: ReceiverStream<Result<(String, String)>>,
}

impl SnapshotEntries {
    fn new(receiver: mpsc::Receiver<Result<(String, String)>>) -> Self {
        SnapshotEntries {
            inner: ReceiverStream::new(receiver),
        }
    }

    /// Puts every entry into `repository` and returns the number of entries loaded.
    pub async fn load_into(mut self, repository: &dyn StateRepository<String>) -> Result<u64> {
        let mut loaded = 0;
        while let Some(entry) = self.next().await {
            let (key, value) = entry?;
            repository.put(key, value);
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Stream for SnapshotEntries {
    type Item = Result<(String, String)>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
