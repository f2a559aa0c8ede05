use chrono::{DateTime, NaiveDateTime, Utc};

/// File suffix of snapshot archives.
pub const SNAPSHOT_SUFFIX: &str = ".json.zip";

const SNAPSHOT_MARKER: &str = "-snapshot-";
const NAME_PREFIX: &str = "compaction-";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

/// Common prefix of every archive of `channel`.
pub fn snapshot_file_prefix(channel: &str) -> String {
    format!("{}{}{}", NAME_PREFIX, channel, SNAPSHOT_MARKER)
}

/// Archive name for a snapshot of `channel` captured at `captured_at`.
///
/// Names of one channel sort lexicographically in capture order.
pub fn snapshot_file_name(channel: &str, captured_at: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        snapshot_file_prefix(channel),
        captured_at.format(TIMESTAMP_FORMAT),
        SNAPSHOT_SUFFIX
    )
}

pub fn is_snapshot_of(channel: &str, file_name: &str) -> bool {
    file_name.ends_with(SNAPSHOT_SUFFIX)
        && file_name
            .strip_prefix(&snapshot_file_prefix(channel))
            .is_some_and(|rest| snapshot_timestamp_part(rest).is_some())
}

/// Channel name embedded in an archive name.
pub fn snapshot_channel(file_name: &str) -> Option<&str> {
    let (head, _) = file_name.rsplit_once(SNAPSHOT_MARKER)?;
    head.strip_prefix(NAME_PREFIX)
}

/// Capture timestamp encoded in an archive name.
pub fn snapshot_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let (_, rest) = file_name.rsplit_once(SNAPSHOT_MARKER)?;
    snapshot_timestamp_part(rest)
}

fn snapshot_timestamp_part(rest: &str) -> Option<DateTime<Utc>> {
    let stamp = rest.strip_suffix(SNAPSHOT_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
