use super::{deflate, get_words, inflate, put_words, Codec, Decoded};
use crate::error::{DlsError, Result};
use crate::store::{ByteOrder, Sample};
use std::f64::consts::PI;
use std::marker::PhantomData;

/// Lapped transform codec (sine-window MLT, 50% overlap).
///
/// A window of `block_size` values produces `block_size / 2` coefficients;
/// the window advances by one hop of `block_size / 2` values. Each record is
/// padded to whole hops. Frame `h` of a record covers the previous hop and
/// hop `h`, so the last hop of a record is only complete once the first
/// frame of the next record, or the flush record written on close, has been
/// decoded.
///
/// Coefficients are quantized with step `accuracy / sqrt(block_size)`. Each
/// reconstructed value sums two frames whose windows satisfy
/// `w[n]^2 + w[n+hop]^2 = 1`, which bounds the error by `accuracy / sqrt(2)`.
pub struct MdctCodec<T> {
    hop: usize,
    /// Windowed, scaled basis: `basis[k * 2 * hop + n]`.
    basis: Vec<f64>,
    step: f64,
    order: ByteOrder,
    enc_prev: Vec<f64>,
    enc_started: bool,
    dec_overlap: Option<Vec<f64>>,
    dec_pending: usize,
    _sample: PhantomData<T>,
}

impl<T: Sample> MdctCodec<T> {
    /// Creates a codec with window length `block_size`.
    pub fn new(block_size: usize, accuracy: f64, order: ByteOrder) -> Self {
        let hop = block_size / 2;
        let len = 2 * hop;
        let scale = (2.0 / hop as f64).sqrt();
        let mut basis = Vec::with_capacity(hop * len);
        for k in 0..hop {
            for n in 0..len {
                let window = (PI * (n as f64 + 0.5) / len as f64).sin();
                let phase =
                    PI / hop as f64 * (n as f64 + 0.5 + hop as f64 / 2.0) * (k as f64 + 0.5);
                basis.push(scale * window * phase.cos());
            }
        }
        Self {
            hop,
            basis,
            step: accuracy / (len as f64).sqrt(),
            order,
            enc_prev: vec![0.0; hop],
            enc_started: false,
            dec_overlap: None,
            dec_pending: 0,
            _sample: PhantomData,
        }
    }

    fn forward(&self, frame: &[f64], out: &mut Vec<i64>) {
        let len = 2 * self.hop;
        for k in 0..self.hop {
            let row = &self.basis[k * len..(k + 1) * len];
            let coefficient: f64 = row.iter().zip(frame).map(|(b, x)| b * x).sum();
            out.push((coefficient / self.step).round() as i64);
        }
    }

    fn inverse(&self, coefficients: &[i64]) -> Vec<f64> {
        let len = 2 * self.hop;
        let mut out = vec![0.0; len];
        for (k, &q) in coefficients.iter().enumerate() {
            if q == 0 {
                continue;
            }
            let c = q as f64 * self.step;
            let row = &self.basis[k * len..(k + 1) * len];
            for (o, b) in out.iter_mut().zip(row) {
                *o += c * b;
            }
        }
        out
    }

    /// Adds the withheld overlap to the first half of `frame` and returns the
    /// completed hop, if an overlap was withheld.
    fn complete(&mut self, frame: &[f64]) -> Option<Vec<f64>> {
        let overlap = self.dec_overlap.take()?;
        Some(
            overlap
                .iter()
                .zip(&frame[..self.hop])
                .map(|(a, b)| a + b)
                .collect(),
        )
    }
}

impl<T: Sample> Codec<T> for MdctCodec<T> {
    fn compress(&mut self, values: &[T]) -> Result<Vec<u8>> {
        if values.is_empty() {
            return Err(DlsError::Decode("cannot transform an empty block".into()));
        }
        let hops = values.len().div_ceil(self.hop);
        let mut padded: Vec<f64> = values.iter().map(|v| v.to_f64()).collect();
        padded.resize(hops * self.hop, 0.0);

        let mut coefficients = Vec::with_capacity(hops * self.hop);
        let mut frame = Vec::with_capacity(2 * self.hop);
        for hop in padded.chunks_exact(self.hop) {
            frame.clear();
            frame.extend_from_slice(&self.enc_prev);
            frame.extend_from_slice(hop);
            self.forward(&frame, &mut coefficients);
            self.enc_prev.copy_from_slice(hop);
        }
        self.enc_started = true;
        deflate(&put_words(&coefficients, self.order))
    }

    fn flush_compress(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.enc_started {
            return Ok(None);
        }
        let mut frame = self.enc_prev.clone();
        frame.resize(2 * self.hop, 0.0);
        let mut coefficients = Vec::with_capacity(self.hop);
        self.forward(&frame, &mut coefficients);
        self.enc_prev.iter_mut().for_each(|v| *v = 0.0);
        self.enc_started = false;
        deflate(&put_words(&coefficients, self.order)).map(Some)
    }

    fn decompress(&mut self, payload: &[u8], count: usize) -> Result<Decoded<T>> {
        let hops = count.div_ceil(self.hop);
        let coefficients = get_words(&inflate(payload)?, self.order)?;
        if count == 0 || coefficients.len() != hops * self.hop {
            self.clear();
            return Err(DlsError::Decode(format!(
                "expected {} coefficients for {} values, got {}",
                hops * self.hop,
                count,
                coefficients.len()
            )));
        }

        let mut decoded = Decoded {
            carried: Vec::new(),
            values: Vec::with_capacity((hops - 1) * self.hop),
        };
        for (h, chunk) in coefficients.chunks_exact(self.hop).enumerate() {
            let frame = self.inverse(chunk);
            if let Some(done) = self.complete(&frame) {
                if h == 0 {
                    decoded.carried = done[..self.dec_pending]
                        .iter()
                        .map(|v| T::from_f64(*v))
                        .collect();
                } else {
                    decoded.values.extend(done.iter().map(|v| T::from_f64(*v)));
                }
            }
            self.dec_overlap = Some(frame[self.hop..].to_vec());
        }
        self.dec_pending = count - (hops - 1) * self.hop;
        Ok(decoded)
    }

    fn flush_decompress(&mut self, payload: &[u8]) -> Result<Vec<T>> {
        let coefficients = get_words(&inflate(payload)?, self.order)?;
        if coefficients.len() != self.hop {
            self.clear();
            return Err(DlsError::Decode(format!(
                "flush record holds {} coefficients, expected {}",
                coefficients.len(),
                self.hop
            )));
        }
        let frame = self.inverse(&coefficients);
        let tail = match self.complete(&frame) {
            Some(done) => done[..self.dec_pending]
                .iter()
                .map(|v| T::from_f64(*v))
                .collect(),
            None => Vec::new(),
        };
        self.dec_pending = 0;
        Ok(tail)
    }

    fn has_pending(&self) -> bool {
        self.dec_overlap.is_some() && self.dec_pending > 0
    }

    fn clear(&mut self) {
        self.enc_prev.iter_mut().for_each(|v| *v = 0.0);
        self.enc_started = false;
        self.dec_overlap = None;
        self.dec_pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (i as f64 * 0.05).sin() * 10.0 + (i as f64 * 0.31).cos())
            .collect()
    }

    #[test]
    fn test_mdct_stream_within_accuracy() {
        let accuracy = 0.01;
        let input = signal(250);
        let mut encoder = MdctCodec::<f64>::new(32, accuracy, ByteOrder::LittleEndian);
        let records: Vec<(Vec<u8>, usize)> = input
            .chunks(100)
            .map(|block| (encoder.compress(block).unwrap(), block.len()))
            .collect();
        let flush = encoder.flush_compress().unwrap().unwrap();

        let mut decoder = MdctCodec::<f64>::new(32, accuracy, ByteOrder::LittleEndian);
        let mut output = Vec::new();
        for (payload, count) in &records {
            let decoded = decoder.decompress(payload, *count).unwrap();
            output.extend(decoded.carried);
            output.extend(decoded.values);
        }
        assert!(decoder.has_pending());
        output.extend(decoder.flush_decompress(&flush).unwrap());
        assert!(!decoder.has_pending());

        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() <= accuracy, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_mdct_mid_stream_start_withholds_nothing_extra() {
        let input = signal(192);
        let mut encoder = MdctCodec::<f32>::new(64, 0.1, ByteOrder::LittleEndian);
        let values: Vec<f32> = input.iter().map(|v| *v as f32).collect();
        encoder.compress(&values[..96]).unwrap();
        let second = encoder.compress(&values[96..]).unwrap();

        // Starting at the second record: its first frame has no overlap, so
        // nothing is carried and the last hop is withheld.
        let mut decoder = MdctCodec::<f32>::new(64, 0.1, ByteOrder::LittleEndian);
        let decoded = decoder.decompress(&second, 96).unwrap();
        assert!(decoded.carried.is_empty());
        assert_eq!(decoded.values.len(), 64);
        for (a, b) in values[96..160].iter().zip(&decoded.values) {
            assert!((a - b).abs() <= 0.1);
        }
    }

    #[test]
    fn test_mdct_rejects_wrong_length() {
        let mut codec = MdctCodec::<f64>::new(16, 0.1, ByteOrder::LittleEndian);
        let payload = codec.compress(&[1.0; 8]).unwrap();
        assert!(codec.decompress(&payload, 20).is_err());
        assert!(codec.flush_decompress(&payload[..0]).is_err());
    }
}
