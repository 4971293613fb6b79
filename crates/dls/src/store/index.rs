//! Fixed-size binary index files.
//!
//! An index file is a headerless array of records. Every field is a
//! little-endian `u64`, so the record count is `file_size / SIZE` and any
//! other file size means the file is corrupt.
//!
//! | Record                | Fields                          | Size |
//! |-----------------------|---------------------------------|------|
//! | [`GlobalIndexRecord`] | start_time, end_time            | 16   |
//! | [`LocalIndexRecord`]  | start_time, end_time, position  | 24   |
//! | [`ChannelIndexRecord`]| start_time, end_time            | 16   |
//! | [`MessageIndexRecord`]| time, position                  | 16   |
//!
//! An `end_time` of 0 in a global or channel index row marks a data file or
//! chunk that is still being written.

use crate::error::{DlsError, Result};
use crate::store::Time;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// End time sentinel for rows whose file or chunk is still open.
pub const OPEN_END: Time = 0;

/// A fixed-size record stored in an index file.
pub trait IndexRecord: Sized + Copy + fmt::Debug {
    /// Serialized size in bytes.
    const SIZE: usize;

    /// Writes the record.
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()>;

    /// Reads one record.
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self>;
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Coverage of one data file within a (level, meta type) stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalIndexRecord {
    /// Time of the first value in the file.
    pub start_time: Time,
    /// Time of the last value, or [`OPEN_END`] while the file is written.
    pub end_time: Time,
}

impl GlobalIndexRecord {
    /// Returns `true` if the data file has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.end_time == OPEN_END
    }
}

impl IndexRecord for GlobalIndexRecord {
    const SIZE: usize = 16;

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // Start time (8 bytes)
        writer.write_all(&self.start_time.to_le_bytes())?;
        // End time (8 bytes)
        writer.write_all(&self.end_time.to_le_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            start_time: read_u64(reader)?,
            end_time: read_u64(reader)?,
        })
    }
}

/// Coverage and byte offset of one block within a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalIndexRecord {
    /// Time of the first value in the block.
    pub start_time: Time,
    /// Time of the last value in the block.
    pub end_time: Time,
    /// Byte offset of the block record in the data file.
    pub position: u64,
}

impl IndexRecord for LocalIndexRecord {
    const SIZE: usize = 24;

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // Start time (8 bytes)
        writer.write_all(&self.start_time.to_le_bytes())?;
        // End time (8 bytes)
        writer.write_all(&self.end_time.to_le_bytes())?;
        // Position (8 bytes)
        writer.write_all(&self.position.to_le_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            start_time: read_u64(reader)?,
            end_time: read_u64(reader)?,
            position: read_u64(reader)?,
        })
    }
}

/// Cached coverage of one chunk, kept in `channel.idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelIndexRecord {
    /// Chunk start time. Also the chunk directory's name.
    pub start_time: Time,
    /// Chunk end time, or [`OPEN_END`] if the chunk must be re-verified.
    pub end_time: Time,
}

impl IndexRecord for ChannelIndexRecord {
    const SIZE: usize = 16;

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.start_time.to_le_bytes())?;
        writer.write_all(&self.end_time.to_le_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            start_time: read_u64(reader)?,
            end_time: read_u64(reader)?,
        })
    }
}

/// Time and byte offset of one job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIndexRecord {
    /// Message time.
    pub time: Time,
    /// Byte offset in the message file.
    pub position: u64,
}

impl IndexRecord for MessageIndexRecord {
    const SIZE: usize = 16;

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.time.to_le_bytes())?;
        writer.write_all(&self.position.to_le_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            time: read_u64(reader)?,
            position: read_u64(reader)?,
        })
    }
}

/// An open index file of records of type `R`.
pub struct IndexFile<R> {
    path: PathBuf,
    file: File,
    len: u64,
    writable: bool,
    _record: PhantomData<R>,
}

impl<R: IndexRecord> IndexFile<R> {
    /// Opens an existing index read-only.
    ///
    /// # Errors
    ///
    /// [`DlsError::MissingIndex`] if the file does not exist,
    /// [`DlsError::Corrupt`] if its size is not a multiple of the record size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DlsError::MissingIndex(path.to_path_buf()),
            _ => DlsError::Io(e),
        })?;
        Self::from_file(path, file, false)
    }

    /// Opens an index for appending, creating it if necessary.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file, true)
    }

    fn from_file(path: &Path, file: File, writable: bool) -> Result<Self> {
        let size = file.metadata()?.len();
        if size % R::SIZE as u64 != 0 {
            return Err(DlsError::corrupt(
                path,
                format!("size {} is not a multiple of {}", size, R::SIZE),
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len: size / R::SIZE as u64,
            writable,
            _record: PhantomData,
        })
    }

    /// Number of records.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads record `i`.
    pub fn get(&mut self, i: u64) -> Result<R> {
        if i >= self.len {
            return Err(DlsError::corrupt(
                &self.path,
                format!("record {} out of range ({} records)", i, self.len),
            ));
        }
        self.file.seek(SeekFrom::Start(i * R::SIZE as u64))?;
        Ok(R::read_from(&mut self.file)?)
    }

    /// Reads the first record, if any.
    pub fn first(&mut self) -> Result<Option<R>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.get(0).map(Some)
    }

    /// Reads the last record, if any.
    pub fn last(&mut self) -> Result<Option<R>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.get(self.len - 1).map(Some)
    }

    /// Reads all records in file order.
    pub fn read_all(&mut self) -> Result<Vec<R>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::with_capacity((self.len as usize) * R::SIZE);
        (&mut self.file)
            .take(self.len * R::SIZE as u64)
            .read_to_end(&mut raw)?;
        let mut cursor = raw.as_slice();
        let mut records = Vec::with_capacity(self.len as usize);
        for _ in 0..self.len {
            records.push(R::read_from(&mut cursor)?);
        }
        Ok(records)
    }

    /// Appends a record at the end of the file.
    pub fn append(&mut self, record: &R) -> Result<()> {
        self.check_writable()?;
        self.file.seek(SeekFrom::Start(self.len * R::SIZE as u64))?;
        let mut buf = Vec::with_capacity(R::SIZE);
        record.write_to(&mut buf)?;
        self.file.write_all(&buf)?;
        self.len += 1;
        Ok(())
    }

    /// Overwrites record `i`.
    pub fn set(&mut self, i: u64, record: &R) -> Result<()> {
        self.check_writable()?;
        if i >= self.len {
            return Err(DlsError::corrupt(
                &self.path,
                format!("cannot change record {} of {}", i, self.len),
            ));
        }
        self.file.seek(SeekFrom::Start(i * R::SIZE as u64))?;
        let mut buf = Vec::with_capacity(R::SIZE);
        record.write_to(&mut buf)?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(DlsError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("index {} opened read-only", self.path.display()),
            )))
        }
    }
}

/// Replaces the index at `path` with `records`.
///
/// The records are written to a temporary file in the same directory which is
/// then renamed over `path`, so readers see either the old or the new index.
pub fn rewrite_atomic<R: IndexRecord>(path: &Path, records: &[R]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = io::BufWriter::new(temp.as_file_mut());
        for record in records {
            record.write_to(&mut writer)?;
        }
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| DlsError::Io(e.error))?;
    Ok(())
}
