//! Decoded value blocks handed to callers.

use crate::store::{MetaType, Sample, Time};
use serde::{Deserialize, Serialize};

/// Serializes values as base64 of their little-endian bytes, so NaN and
/// infinities survive JSON.
mod value_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(text).map_err(D::Error::custom)?;
        if bytes.len() % 8 != 0 {
            return Err(D::Error::custom(format!(
                "{} value bytes are not a multiple of 8",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect())
    }
}

/// A run of equidistant values of one meta type and level.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Data {
    /// Time of the first value.
    pub start_time: Time,
    /// Distance between two values in microseconds.
    pub time_per_value: f64,
    /// Aggregate the values represent.
    pub meta_type: MetaType,
    /// Level the values were read from.
    pub meta_level: u32,
    /// The values.
    #[serde(with = "value_bytes")]
    pub values: Vec<f64>,
}

impl Data {
    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if there are no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Time of value `i`.
    pub fn time(&self, i: usize) -> Time {
        self.start_time + (i as f64 * self.time_per_value).round() as Time
    }

    /// Iterates over `(time, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Time, f64)> + '_ {
        self.values.iter().enumerate().map(|(i, v)| (self.time(i), *v))
    }

    /// Replaces the contents with the values of `block` that fall into
    /// `[range.0, range.1)`, keeping every `decimation`-th of them.
    ///
    /// `counter` counts values across calls, so consecutive blocks decimate
    /// as one stream. Returns the number of values kept.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn import<T: Sample>(
        &mut self,
        block_start: f64,
        time_per_value: f64,
        meta_type: MetaType,
        meta_level: u32,
        block: &[T],
        range: (Time, Time),
        decimation: u32,
        counter: &mut u64,
    ) -> usize {
        let decimation = u64::from(decimation.max(1));
        self.values.clear();
        self.meta_type = meta_type;
        self.meta_level = meta_level;
        self.time_per_value = time_per_value * decimation as f64;

        let (start, end) = (range.0 as f64, range.1 as f64);
        for (i, value) in block.iter().enumerate() {
            let time = block_start + i as f64 * time_per_value;
            if time < start {
                continue;
            }
            if time >= end {
                break;
            }
            if *counter % decimation == 0 {
                if self.values.is_empty() {
                    self.start_time = time.round() as Time;
                }
                self.values.push(value.to_f64());
            }
            *counter += 1;
        }
        self.values.len()
    }
}

/// Receives decoded blocks.
///
/// Returning the block hands it back to the reader, which reuses its buffer
/// for the next block. Returning `None` keeps it.
pub trait DataSink {
    /// Delivers one block.
    fn deliver(&mut self, data: Data) -> Option<Data>;
}

impl<F: FnMut(Data) -> Option<Data>> DataSink for F {
    fn deliver(&mut self, data: Data) -> Option<Data> {
        self(data)
    }
}

/// Sink that keeps every block.
#[derive(Debug, Default)]
pub struct Collect(pub Vec<Data>);

impl DataSink for Collect {
    fn deliver(&mut self, data: Data) -> Option<Data> {
        self.0.push(data);
        None
    }
}
