//! Block records in data files.
//!
//! Every block is one self-delimiting line:
//!
//! ```text
//! <d t="START_TIME" s="VALUE_COUNT" d="BASE64_PAYLOAD"/>
//! ```
//!
//! A record with `s="0"` is the flush record written when an MDCT stream is
//! closed. It has no local index row and is only reached by reading past the
//! last indexed block.

use crate::error::{DlsError, Result};
use crate::store::xml::{parse_tag, Parsed, Tag};
use crate::store::Time;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default number of bytes read per step while looking for a record's end.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;

/// One block record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Time of the first value.
    pub start_time: Time,
    /// Number of values; 0 for a flush record.
    pub count: u32,
    /// Compressed payload (already base64-decoded).
    pub payload: Vec<u8>,
}

impl Record {
    /// Returns `true` for the MDCT flush-continuation record.
    pub fn is_flush(&self) -> bool {
        self.count == 0
    }

    /// Renders the record line, including the trailing newline.
    pub fn render(&self) -> String {
        let mut line = Tag::single("d")
            .with_attr("t", self.start_time)
            .with_attr("s", self.count)
            .with_attr("d", STANDARD.encode(&self.payload))
            .to_string();
        line.push('\n');
        line
    }

    fn from_tag(tag: &Tag, context: &Path) -> Result<Self> {
        let encoded: String = tag.parse_attr("d", context)?;
        let payload = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| DlsError::Decode(format!("base64 in {}: {}", context.display(), e)))?;
        Ok(Self {
            start_time: tag.parse_attr("t", context)?,
            count: tag.parse_attr("s", context)?,
            payload,
        })
    }
}

/// Streaming reader that parses tags from an arbitrary file offset.
pub struct RecordReader {
    path: PathBuf,
    file: File,
    buf: Vec<u8>,
    /// File offset of `buf[0]`.
    buf_pos: u64,
    read_chunk_size: usize,
}

impl RecordReader {
    /// Opens a data file positioned at offset 0.
    pub fn open(path: impl AsRef<Path>, read_chunk_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file,
            buf: Vec::new(),
            buf_pos: 0,
            read_chunk_size: read_chunk_size.max(64),
        })
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Moves to `position` and drops buffered bytes.
    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.buf.clear();
        self.buf_pos = position;
        Ok(())
    }

    /// File offset of the next unparsed byte.
    pub fn position(&self) -> u64 {
        self.buf_pos
    }

    /// Reads the next record.
    ///
    /// Returns `Ok(None)` on a clean end of file. A file ending inside a
    /// record is [`DlsError::Corrupt`].
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some(tag) = self.next_tag()? {
            if tag.title() == "d" {
                return Record::from_tag(&tag, &self.path).map(Some);
            }
            debug!("Skipping <{}> tag in {}", tag.title(), self.path.display());
        }
        Ok(None)
    }

    /// Reads the next tag of any title.
    pub fn next_tag(&mut self) -> Result<Option<Tag>> {
        loop {
            if !self.buf.is_empty() {
                let text = match std::str::from_utf8(&self.buf) {
                    Ok(text) => text,
                    // A multi-byte character split by the read step.
                    Err(e) if e.error_len().is_none() => {
                        std::str::from_utf8(&self.buf[..e.valid_up_to()]).unwrap_or_default()
                    }
                    Err(_) => {
                        return Err(DlsError::corrupt(
                            &self.path,
                            format!("non-text bytes after {}", self.buf_pos),
                        ))
                    }
                };
                if let Parsed::Tag(tag, used) =
                    parse_tag(text).map_err(|e| DlsError::corrupt(&self.path, e))?
                {
                    self.buf.drain(..used);
                    self.buf_pos += used as u64;
                    return Ok(Some(tag));
                }
            }

            let old_len = self.buf.len();
            self.buf.resize(old_len + self.read_chunk_size, 0);
            let read = self.file.read(&mut self.buf[old_len..])?;
            self.buf.truncate(old_len + read);
            if read == 0 {
                if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(DlsError::PartialRecord {
                    path: self.path.clone(),
                    position: self.buf_pos,
                });
            }
        }
    }
}
