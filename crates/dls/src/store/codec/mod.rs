//! Block payload codecs.
//!
//! A codec turns a block of samples into the binary payload of one record
//! and back. Payloads are base64-encoded by [`crate::store::record`].
//!
//! | Format | Exactness                         | Types        | State |
//! |--------|-----------------------------------|--------------|-------|
//! | ZLIB   | lossless                          | all          | none  |
//! | QUANT  | error ≤ accuracy                  | float/double | none  |
//! | MDCT   | error ≤ accuracy                  | float/double | lapped, needs the next record |
//!
//! Stateful decoding is expressed through [`Decoded::carried`]: values that
//! complete the *previous* record and only become available once the current
//! record (or a flush record) is decoded.

mod mdct;
mod quant;
mod zlib;

pub use mdct::MdctCodec;
pub use quant::QuantCodec;
pub use zlib::{deflate, inflate, ZlibCodec};

use crate::error::{DlsError, Result};
use crate::store::meta::Format;
use crate::store::{ByteOrder, Sample};

/// Result of decoding one record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decoded<T> {
    /// Tail of the previously decoded record, completed by this one.
    pub carried: Vec<T>,
    /// Values of this record that are complete.
    pub values: Vec<T>,
}

/// Compression codec for one value stream.
pub trait Codec<T: Sample>: Send {
    /// Encodes one block into a record payload.
    fn compress(&mut self, values: &[T]) -> Result<Vec<u8>>;

    /// Returns the payload of the flush record that completes the last
    /// block, or `None` if the format needs none.
    fn flush_compress(&mut self) -> Result<Option<Vec<u8>>>;

    /// Decodes the payload of a record holding `count` values.
    fn decompress(&mut self, payload: &[u8], count: usize) -> Result<Decoded<T>>;

    /// Decodes a flush record and returns the completed tail of the previous
    /// record.
    fn flush_decompress(&mut self, payload: &[u8]) -> Result<Vec<T>>;

    /// Returns `true` while decoded values of the last record are withheld
    /// waiting for the next record.
    fn has_pending(&self) -> bool {
        false
    }

    /// Resets encoder and decoder state.
    fn clear(&mut self);
}

/// Creates the codec for `format`.
///
/// # Errors
///
/// [`DlsError::UnsupportedFormat`] if the format cannot store `T`.
pub fn create<T: Sample>(format: &Format, order: ByteOrder) -> Result<Box<dyn Codec<T>>> {
    format
        .check(T::SCALAR)
        .map_err(DlsError::UnsupportedFormat)?;
    Ok(match *format {
        Format::Zlib => Box::new(ZlibCodec::<T>::new(order)),
        Format::Quant { accuracy } => Box::new(QuantCodec::<T>::new(accuracy, order)),
        Format::Mdct {
            block_size,
            accuracy,
        } => Box::new(MdctCodec::<T>::new(block_size as usize, accuracy, order)),
    })
}

/// Encodes `i64` words in the given byte order.
pub(crate) fn put_words(words: &[i64], order: ByteOrder) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 8);
    for w in words {
        w.put_bytes(&mut out, order);
    }
    out
}

/// Decodes `i64` words; the length must be a multiple of 8.
pub(crate) fn get_words(bytes: &[u8], order: ByteOrder) -> Result<Vec<i64>> {
    if bytes.len() % 8 != 0 {
        return Err(DlsError::Decode(format!(
            "payload length {} is not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|raw| i64::from_bytes(raw, order))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_rejects_lossy_for_integers() {
        let quant = Format::Quant { accuracy: 0.5 };
        assert!(matches!(
            create::<i32>(&quant, ByteOrder::LittleEndian),
            Err(DlsError::UnsupportedFormat(_))
        ));
        assert!(create::<f32>(&quant, ByteOrder::LittleEndian).is_ok());
        assert!(create::<u16>(&Format::Zlib, ByteOrder::BigEndian).is_ok());
    }

    #[test]
    fn test_words_roundtrip() {
        let words = [0i64, -1, i64::MAX, 42];
        let raw = put_words(&words, ByteOrder::BigEndian);
        assert_eq!(get_words(&raw, ByteOrder::BigEndian).unwrap(), words);
        assert!(get_words(&raw[1..], ByteOrder::BigEndian).is_err());
    }
}
