//! `channel.xml` and `chunk.xml`.

use crate::error::{DlsError, Result};
use crate::store::xml::{self, Tag};
use crate::store::{ByteOrder, ScalarType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Smallest allowed MDCT block size.
pub const MDCT_MIN_BLOCK_SIZE: u32 = 1 << 4;

/// Largest allowed MDCT block size.
pub const MDCT_MAX_BLOCK_SIZE: u32 = 1 << 10;

/// Compression format of a chunk, with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Format {
    /// Lossless zlib.
    Zlib,
    /// Lapped transform; floating-point channels only.
    Mdct {
        /// Window length, a power of two in `[16, 1024]`.
        block_size: u32,
        /// Maximum absolute reconstruction error.
        accuracy: f64,
    },
    /// Uniform quantization; floating-point channels only.
    Quant {
        /// Maximum absolute reconstruction error.
        accuracy: f64,
    },
}

impl Format {
    /// Name persisted in `chunk.xml`.
    pub fn name(&self) -> &'static str {
        match self {
            Format::Zlib => "ZLIB",
            Format::Mdct { .. } => "MDCT",
            Format::Quant { .. } => "QUANT",
        }
    }

    /// Runtime index of the format.
    pub fn index(&self) -> u32 {
        match self {
            Format::Zlib => 0,
            Format::Mdct { .. } => 1,
            Format::Quant { .. } => 2,
        }
    }

    /// Returns `true` if decoding is exact.
    pub fn is_lossless(&self) -> bool {
        matches!(self, Format::Zlib)
    }

    /// Checks the format parameters and the scalar type combination.
    pub fn check(&self, scalar: ScalarType) -> std::result::Result<(), String> {
        match *self {
            Format::Zlib => Ok(()),
            Format::Mdct {
                block_size,
                accuracy,
            } => {
                if !scalar.is_float() {
                    return Err(format!("MDCT is not suitable for {}", scalar));
                }
                if !block_size.is_power_of_two()
                    || !(MDCT_MIN_BLOCK_SIZE..=MDCT_MAX_BLOCK_SIZE).contains(&block_size)
                {
                    return Err(format!("invalid MDCT block size {}", block_size));
                }
                check_accuracy(accuracy)
            }
            Format::Quant { accuracy } => {
                if !scalar.is_float() {
                    return Err(format!("quantization is not suitable for {}", scalar));
                }
                check_accuracy(accuracy)
            }
        }
    }
}

fn check_accuracy(accuracy: f64) -> std::result::Result<(), String> {
    if accuracy.is_finite() && accuracy > 0.0 {
        Ok(())
    } else {
        Err(format!("invalid accuracy {}", accuracy))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contents of `channel.xml`: the identity used to reuse channel directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelXml {
    /// Channel name.
    pub name: String,
    /// Physical unit.
    pub unit: String,
    /// Sample type.
    pub scalar: ScalarType,
}

impl ChannelXml {
    /// Reads `channel.xml` from `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let tag = xml::read_wrapped(path, "dlschannel", "channel")?;
        Ok(Self {
            name: tag.parse_attr("name", path)?,
            unit: tag.parse_attr("unit", path)?,
            scalar: tag.parse_attr("type", path)?,
        })
    }

    /// Writes `channel.xml` to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let tag = Tag::single("channel")
            .with_attr("name", &self.name)
            .with_attr("unit", &self.unit)
            .with_attr("type", self.scalar);
        fs::write(path, xml::render_wrapped("dlschannel", &tag))?;
        Ok(())
    }
}

/// Contents of `chunk.xml`. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkXml {
    /// Samples per second.
    pub sample_frequency: f64,
    /// Values per block at level 0.
    pub block_size: u32,
    /// Requested aggregates, see [`crate::store::MetaType::mask_bit`].
    pub meta_mask: u32,
    /// Values per aggregate between two levels.
    pub meta_reduction: u32,
    /// Compression format.
    pub format: Format,
    /// Byte order of the producing machine.
    pub architecture: ByteOrder,
}

impl ChunkXml {
    /// Reads `chunk.xml` from `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let tag = xml::read_wrapped(path, "dlschunk", "chunk")?;
        let format_name: String = tag.parse_attr("format", path)?;
        let format = match format_name.as_str() {
            "ZLIB" => Format::Zlib,
            "MDCT" => Format::Mdct {
                block_size: tag.parse_attr("mdct_block_size", path)?,
                accuracy: tag.parse_attr("mdct_accuracy", path)?,
            },
            "QUANT" => Format::Quant {
                accuracy: tag.parse_attr("accuracy", path)?,
            },
            other => {
                return Err(DlsError::UnsupportedFormat(format!(
                    "{} in {}",
                    other,
                    path.display()
                )))
            }
        };
        let meta = Self {
            sample_frequency: tag.parse_attr("sample_frequency", path)?,
            block_size: tag.parse_attr("block_size", path)?,
            meta_mask: tag.parse_attr("meta_mask", path)?,
            meta_reduction: tag.parse_attr("meta_reduction", path)?,
            format,
            architecture: tag.parse_attr("architecture", path)?,
        };
        if !(meta.sample_frequency > 0.0) || meta.meta_reduction < 2 || meta.block_size == 0 {
            return Err(DlsError::corrupt(path, "invalid chunk parameters"));
        }
        Ok(meta)
    }

    /// Writes `chunk.xml` to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut tag = Tag::single("chunk")
            .with_attr("sample_frequency", self.sample_frequency)
            .with_attr("block_size", self.block_size)
            .with_attr("meta_mask", self.meta_mask)
            .with_attr("meta_reduction", self.meta_reduction)
            .with_attr("format", self.format.name());
        match self.format {
            Format::Zlib => {}
            Format::Mdct {
                block_size,
                accuracy,
            } => {
                tag.push_attr("mdct_block_size", block_size);
                tag.push_attr("mdct_accuracy", accuracy);
            }
            Format::Quant { accuracy } => tag.push_attr("accuracy", accuracy),
        }
        tag.push_attr("architecture", self.architecture.as_str());
        fs::write(path, xml::render_wrapped("dlschunk", &tag))?;
        Ok(())
    }
}
