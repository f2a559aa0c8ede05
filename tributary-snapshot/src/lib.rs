//! Tributary-Snapshot
//!
//! Tributary-Snapshot -- compaction of partitioned message logs into resumable snapshot archives

pub mod errors;

mod storage_config;
pub use storage_config::{BackendConfig, CloudBackend, LocalBackend, SnapshotConfig};

// opendal wrapper holding the published archives
mod object_store;
pub use object_store::{ObjectInfo, ObjectRangeReader, ObjectStore, ObjectWriter};

pub mod snapshot_file;

mod codec;
pub use codec::{SnapshotCodec, SnapshotEntries};

mod snapshot_store;
pub use snapshot_store::{SnapshotMetadata, SnapshotStore};

mod compaction;
pub use compaction::{CompactionOptions, CompactionService};

mod event_source;
pub use event_source::{EventSource, SNAPSHOT_ATTRIBUTE};
