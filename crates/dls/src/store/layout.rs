//! Directory and file naming.

use super::{MetaType, Time};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `channel.xml` inside a channel directory.
pub const CHANNEL_XML: &str = "channel.xml";

/// `channel.idx` chunk cache inside a channel directory.
pub const CHANNEL_INDEX: &str = "channel.idx";

/// `chunk.xml` inside a chunk directory.
pub const CHUNK_XML: &str = "chunk.xml";

/// Directory holding the job's message chunks.
pub const MESSAGES_DIR: &str = "messages";

/// Message file inside a message chunk.
pub const MESSAGES_FILE: &str = "messages";

/// Message index inside a message chunk.
pub const MESSAGES_INDEX: &str = "messages.idx";

/// Parses `<prefix><digits>` and returns the number. Anything else is `None`.
pub fn parse_numbered(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Lists `<prefix><digits>` entries of `dir`, sorted by number.
pub fn list_numbered(dir: &Path, prefix: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(n) = parse_numbered(name, prefix) {
            entries.push((n, entry.path()));
        }
    }
    entries.sort_by_key(|(n, _)| *n);
    Ok(entries)
}

/// `<dls_dir>/job<id>`
pub fn job_dir(dls_dir: &Path, job_id: u32) -> PathBuf {
    dls_dir.join(format!("job{}", job_id))
}

/// `<job_dir>/channel<index>`
pub fn channel_dir(job_dir: &Path, index: u32) -> PathBuf {
    job_dir.join(format!("channel{}", index))
}

/// `<channel_dir>/chunk<time>`
pub fn chunk_dir(channel_dir: &Path, time: Time) -> PathBuf {
    channel_dir.join(format!("chunk{}", time))
}

/// `<chunk_dir>/level<level>`
pub fn level_dir(chunk_dir: &Path, level: u32) -> PathBuf {
    chunk_dir.join(format!("level{}", level))
}

/// `<level_dir>/data_<meta>.idx`
pub fn global_index_path(level_dir: &Path, meta: MetaType) -> PathBuf {
    level_dir.join(format!("data_{}.idx", meta.suffix()))
}

/// `<level_dir>/data<file_time>_<meta>`
pub fn data_file_path(level_dir: &Path, file_time: Time, meta: MetaType) -> PathBuf {
    level_dir.join(format!("data{}_{}", file_time, meta.suffix()))
}

/// `<level_dir>/data<file_time>_<meta>.idx`
pub fn local_index_path(level_dir: &Path, file_time: Time, meta: MetaType) -> PathBuf {
    level_dir.join(format!("data{}_{}.idx", file_time, meta.suffix()))
}

/// `<job_dir>/messages/chunk<time>`
pub fn message_chunk_dir(job_dir: &Path, time: Time) -> PathBuf {
    job_dir.join(MESSAGES_DIR).join(format!("chunk{}", time))
}
