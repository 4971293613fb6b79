//! On-disk format shared by the writer and the reader.
//!
//! # Directory Layout
//!
//! ```text
//! job<N>/
//! ├── channel<M>/
//! │   ├── channel.xml                      name, unit, scalar type
//! │   ├── channel.idx                      chunk cache (advisory)
//! │   └── chunk<T>/
//! │       ├── chunk.xml                    immutable format parameters
//! │       └── level<L>/
//! │           ├── data_<meta>.idx          global index, one row per data file
//! │           ├── data<F>_<meta>           block records
//! │           └── data<F>_<meta>.idx       local index, one row per block
//! └── messages/
//!     └── chunk<T>/
//!         ├── messages
//!         └── messages.idx
//! ```
//!
//! All times are microseconds since the epoch ([`Time`]).

pub mod codec;
pub mod index;
pub mod layout;
pub mod message;
pub mod meta;
pub mod record;
pub mod xml;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Microseconds since the Unix epoch.
pub type Time = u64;

/// Microseconds per second.
pub const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Which aggregate a stored value stream represents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum MetaType {
    /// Raw values, level 0 only.
    #[default]
    Gen,
    /// Arithmetic mean of `meta_reduction` values of the finer level.
    Mean,
    /// Minimum of `meta_reduction` values of the finer level.
    Min,
    /// Maximum of `meta_reduction` values of the finer level.
    Max,
}

impl MetaType {
    /// Meta types that can be requested through a meta mask, in mask bit order.
    pub const AGGREGATES: [MetaType; 3] = [MetaType::Mean, MetaType::Min, MetaType::Max];

    /// File name suffix (`data_<suffix>.idx`).
    pub fn suffix(self) -> &'static str {
        match self {
            MetaType::Gen => "gen",
            MetaType::Mean => "mean",
            MetaType::Min => "min",
            MetaType::Max => "max",
        }
    }

    /// Bit in the persisted `meta_mask`. `Gen` is always stored and has no bit.
    pub fn mask_bit(self) -> u32 {
        match self {
            MetaType::Gen => 0,
            MetaType::Mean => 1,
            MetaType::Min => 2,
            MetaType::Max => 4,
        }
    }

    /// Expands a meta mask into the aggregate types it selects.
    pub fn from_mask(mask: u32) -> Vec<MetaType> {
        Self::AGGREGATES
            .iter()
            .copied()
            .filter(|m| mask & m.mask_bit() != 0)
            .collect()
    }
}

impl fmt::Display for MetaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Byte order of raw sample bytes and binary block payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Least significant byte first.
    LittleEndian,
    /// Most significant byte first.
    BigEndian,
}

impl ByteOrder {
    /// Byte order of the running machine.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }

    /// Name persisted in `chunk.xml`.
    pub fn as_str(self) -> &'static str {
        match self {
            ByteOrder::LittleEndian => "LittleEndian",
            ByteOrder::BigEndian => "BigEndian",
        }
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LittleEndian" => Ok(ByteOrder::LittleEndian),
            "BigEndian" => Ok(ByteOrder::BigEndian),
            other => Err(format!("unknown architecture \"{}\"", other)),
        }
    }
}

/// Scalar type of a channel's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    /// `i8`
    Char,
    /// `u8`
    UChar,
    /// `i16`
    Short,
    /// `u16`
    UShort,
    /// `i32`
    Int,
    /// `u32`
    UInt,
    /// `i64`
    Long,
    /// `u64`
    ULong,
    /// `f32`
    Float,
    /// `f64`
    Double,
}

impl ScalarType {
    /// Name persisted in `channel.xml`.
    pub fn as_str(self) -> &'static str {
        match self {
            ScalarType::Char => "TCHAR",
            ScalarType::UChar => "TUCHAR",
            ScalarType::Short => "TSHORT",
            ScalarType::UShort => "TUSHORT",
            ScalarType::Int => "TINT",
            ScalarType::UInt => "TUINT",
            ScalarType::Long => "TLINT",
            ScalarType::ULong => "TULINT",
            ScalarType::Float => "TFLT",
            ScalarType::Double => "TDBL",
        }
    }

    /// Returns `true` for the floating-point types.
    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::Float | ScalarType::Double)
    }

    /// Size of one sample in bytes.
    pub fn size(self) -> usize {
        match self {
            ScalarType::Char | ScalarType::UChar => 1,
            ScalarType::Short | ScalarType::UShort => 2,
            ScalarType::Int | ScalarType::UInt | ScalarType::Float => 4,
            ScalarType::Long | ScalarType::ULong | ScalarType::Double => 8,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScalarType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "TCHAR" => ScalarType::Char,
            "TUCHAR" => ScalarType::UChar,
            "TSHORT" => ScalarType::Short,
            "TUSHORT" => ScalarType::UShort,
            "TINT" => ScalarType::Int,
            "TUINT" => ScalarType::UInt,
            "TLINT" => ScalarType::Long,
            "TULINT" => ScalarType::ULong,
            "TFLT" => ScalarType::Float,
            "TDBL" => ScalarType::Double,
            other => return Err(format!("unknown channel type \"{}\"", other)),
        })
    }
}

/// A sample value type that can be stored in a channel.
///
/// Implemented for every Rust type that backs a [`ScalarType`]. Encoders and
/// decoders are generic over `Sample`; [`with_sample_type!`] picks the
/// monomorphized instance for a runtime [`ScalarType`].
pub trait Sample: Copy + PartialOrd + Default + fmt::Debug + Send + 'static {
    /// The scalar type this Rust type represents.
    const SCALAR: ScalarType;

    /// Size in bytes.
    const SIZE: usize;

    /// Decodes one value from exactly `Self::SIZE` bytes.
    fn from_bytes(bytes: &[u8], order: ByteOrder) -> Self;

    /// Appends the encoded value to `out`.
    fn put_bytes(self, out: &mut Vec<u8>, order: ByteOrder);

    /// Lossy conversion to `f64` for aggregation and delivery.
    fn to_f64(self) -> f64;

    /// Conversion from `f64`, saturating for integer types.
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_sample {
    ($($ty:ty => $scalar:ident),* $(,)?) => {
        $(
            impl Sample for $ty {
                const SCALAR: ScalarType = ScalarType::$scalar;
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_bytes(bytes: &[u8], order: ByteOrder) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    match order {
                        ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
                        ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                    }
                }

                fn put_bytes(self, out: &mut Vec<u8>, order: ByteOrder) {
                    match order {
                        ByteOrder::LittleEndian => out.extend_from_slice(&self.to_le_bytes()),
                        ByteOrder::BigEndian => out.extend_from_slice(&self.to_be_bytes()),
                    }
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    if Self::SCALAR.is_float() {
                        value as $ty
                    } else {
                        value.round() as $ty
                    }
                }
            }
        )*
    };
}

impl_sample! {
    i8 => Char,
    u8 => UChar,
    i16 => Short,
    u16 => UShort,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong,
    f32 => Float,
    f64 => Double,
}

/// Runs `$body` with `$t` bound to the Rust type behind a [`ScalarType`].
///
/// ```rust,ignore
/// let size = with_sample_type!(scalar, T => T::SIZE);
/// ```
#[macro_export]
macro_rules! with_sample_type {
    ($scalar:expr, $t:ident => $body:expr) => {
        match $scalar {
            $crate::store::ScalarType::Char => {
                type $t = i8;
                $body
            }
            $crate::store::ScalarType::UChar => {
                type $t = u8;
                $body
            }
            $crate::store::ScalarType::Short => {
                type $t = i16;
                $body
            }
            $crate::store::ScalarType::UShort => {
                type $t = u16;
                $body
            }
            $crate::store::ScalarType::Int => {
                type $t = i32;
                $body
            }
            $crate::store::ScalarType::UInt => {
                type $t = u32;
                $body
            }
            $crate::store::ScalarType::Long => {
                type $t = i64;
                $body
            }
            $crate::store::ScalarType::ULong => {
                type $t = u64;
                $body
            }
            $crate::store::ScalarType::Float => {
                type $t = f32;
                $body
            }
            $crate::store::ScalarType::Double => {
                type $t = f64;
                $body
            }
        }
    };
}

/// Decodes a raw sample buffer. Trailing bytes that do not form a full value
/// are ignored; callers validate the length first.
pub fn decode_samples<T: Sample>(bytes: &[u8], order: ByteOrder) -> Vec<T> {
    bytes
        .chunks_exact(T::SIZE)
        .map(|raw| T::from_bytes(raw, order))
        .collect()
}

/// Encodes samples into a raw buffer.
pub fn encode_samples<T: Sample>(values: &[T], order: ByteOrder) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    for v in values {
        v.put_bytes(&mut out, order);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_type_names() {
        for name in [
            "TCHAR", "TUCHAR", "TSHORT", "TUSHORT", "TINT", "TUINT", "TLINT", "TULINT", "TFLT",
            "TDBL",
        ] {
            let scalar: ScalarType = name.parse().unwrap();
            assert_eq!(scalar.as_str(), name);
        }
        assert!("TSTRING".parse::<ScalarType>().is_err());
    }

    #[test]
    fn test_dispatch_matches_size() {
        for scalar in [ScalarType::Char, ScalarType::UShort, ScalarType::Float, ScalarType::Double] {
            let size = with_sample_type!(scalar, T => T::SIZE);
            assert_eq!(size, scalar.size());
            let kind = with_sample_type!(scalar, T => T::SCALAR);
            assert_eq!(kind, scalar);
        }
    }

    #[test]
    fn test_sample_byte_orders() {
        let values: Vec<i32> = vec![1, -2, 70_000];
        for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
            let raw = encode_samples(&values, order);
            assert_eq!(decode_samples::<i32>(&raw, order), values);
        }
        let be = encode_samples(&[1u16], ByteOrder::BigEndian);
        assert_eq!(be, vec![0, 1]);
    }

    #[test]
    fn test_from_f64_rounds_integers() {
        assert_eq!(<i16 as Sample>::from_f64(2.6), 3);
        assert_eq!(<u8 as Sample>::from_f64(-4.0), 0);
        assert_eq!(<u8 as Sample>::from_f64(300.0), 255);
        assert_eq!(<f32 as Sample>::from_f64(2.5), 2.5);
    }

    #[test]
    fn test_meta_mask() {
        assert_eq!(
            MetaType::from_mask(2 | 4),
            vec![MetaType::Min, MetaType::Max]
        );
        assert!(MetaType::from_mask(0).is_empty());
    }
}
