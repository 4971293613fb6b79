use super::{deflate, get_words, inflate, put_words, Codec, Decoded};
use crate::error::{DlsError, Result};
use crate::store::{ByteOrder, Sample};
use std::marker::PhantomData;

/// Uniform quantizer with step `2 * accuracy`.
///
/// Quantized levels are delta coded against the previous value of the same
/// block and zlib-compressed. Rounding to the nearest level bounds the error
/// by `accuracy`.
pub struct QuantCodec<T> {
    step: f64,
    order: ByteOrder,
    _sample: PhantomData<T>,
}

impl<T: Sample> QuantCodec<T> {
    /// Creates a quantizer with the given maximum error.
    pub fn new(accuracy: f64, order: ByteOrder) -> Self {
        Self {
            step: 2.0 * accuracy,
            order,
            _sample: PhantomData,
        }
    }
}

impl<T: Sample> Codec<T> for QuantCodec<T> {
    fn compress(&mut self, values: &[T]) -> Result<Vec<u8>> {
        let mut previous = 0i64;
        let deltas: Vec<i64> = values
            .iter()
            .map(|v| {
                let level = (v.to_f64() / self.step).round() as i64;
                let delta = level.wrapping_sub(previous);
                previous = level;
                delta
            })
            .collect();
        deflate(&put_words(&deltas, self.order))
    }

    fn flush_compress(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn decompress(&mut self, payload: &[u8], count: usize) -> Result<Decoded<T>> {
        let deltas = get_words(&inflate(payload)?, self.order)?;
        if deltas.len() != count {
            return Err(DlsError::Decode(format!(
                "expected {} quantized values, got {}",
                count,
                deltas.len()
            )));
        }
        let mut level = 0i64;
        let values = deltas
            .into_iter()
            .map(|d| {
                level = level.wrapping_add(d);
                T::from_f64(level as f64 * self.step)
            })
            .collect();
        Ok(Decoded {
            carried: Vec::new(),
            values,
        })
    }

    fn flush_decompress(&mut self, _payload: &[u8]) -> Result<Vec<T>> {
        Ok(Vec::new())
    }

    fn clear(&mut self) {}
}
