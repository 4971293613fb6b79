use super::{Codec, Decoded};
use crate::error::{DlsError, Result};
use crate::store::{decode_samples, encode_samples, ByteOrder, Sample};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::marker::PhantomData;

/// Compresses `data` with zlib.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompresses zlib `data`.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| DlsError::Decode(format!("inflate: {}", e)))?;
    Ok(out)
}

/// Lossless codec: raw sample bytes, zlib-compressed.
pub struct ZlibCodec<T> {
    order: ByteOrder,
    _sample: PhantomData<T>,
}

impl<T: Sample> ZlibCodec<T> {
    /// Creates a codec for samples in `order`.
    pub fn new(order: ByteOrder) -> Self {
        Self {
            order,
            _sample: PhantomData,
        }
    }
}

impl<T: Sample> Codec<T> for ZlibCodec<T> {
    fn compress(&mut self, values: &[T]) -> Result<Vec<u8>> {
        deflate(&encode_samples(values, self.order))
    }

    fn flush_compress(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn decompress(&mut self, payload: &[u8], count: usize) -> Result<Decoded<T>> {
        let raw = inflate(payload)?;
        if raw.len() != count * T::SIZE {
            return Err(DlsError::Decode(format!(
                "expected {} bytes for {} values, got {}",
                count * T::SIZE,
                count,
                raw.len()
            )));
        }
        Ok(Decoded {
            carried: Vec::new(),
            values: decode_samples(&raw, self.order),
        })
    }

    fn flush_decompress(&mut self, _payload: &[u8]) -> Result<Vec<T>> {
        Ok(Vec::new())
    }

    fn clear(&mut self) {}
}
