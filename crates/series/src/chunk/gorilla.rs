//! Gorilla-compressed sample chunk.
//!
//! Samples are appended in place: the encoders keep their running state so a
//! new sample costs a handful of bits without re-encoding the chunk.
//!
//! # Algorithm Overview
//!
//! ## Timestamp Encoding (Delta-of-Delta)
//!
//! - First value: 64 bits raw
//! - Subsequent values, by delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! ## Value Encoding (XOR-based)
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits
//!
//! Arithmetic on timestamps wraps, so every `i64` sequence and every `f64`
//! bit pattern round-trips exactly.

use super::{Sample, Timestamp};
use crate::error::{Result, SeriesError};
use bitvec::prelude::*;

/// Bit stream type used by both encoders.
pub type Bits = BitVec<u8, Msb0>;

/// Pushes the low `n` bits of `value`, most significant first.
fn write_bits(output: &mut Bits, value: u64, n: u32) {
    for i in (0..n).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Reads `n` bits starting at `pos`, advancing it. Returns `None` past the end.
fn read_bits(data: &Bits, pos: &mut usize, n: u32) -> Option<u64> {
    if *pos + n as usize > data.len() {
        return None;
    }
    let mut value: u64 = 0;
    for _ in 0..n {
        value = (value << 1) | u64::from(data[*pos]);
        *pos += 1;
    }
    Some(value)
}

/// Encoder for timestamps using delta-of-delta encoding.
#[derive(Debug, Clone, Default)]
pub struct TimestampEncoder {
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl TimestampEncoder {
    /// Creates a new timestamp encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a timestamp into the output bit vector.
    pub fn encode(&mut self, timestamp: i64, output: &mut Bits) {
        if !self.started {
            self.started = true;
            self.prev_ts = timestamp;
            self.prev_delta = 0;
            write_bits(output, timestamp as u64, 64);
            return;
        }

        let delta = timestamp.wrapping_sub(self.prev_ts);
        let dod = delta.wrapping_sub(self.prev_delta);

        if dod == 0 {
            output.push(false);
        } else if (-63..=64).contains(&dod) {
            write_bits(output, 0b10, 2);
            write_bits(output, (dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            write_bits(output, 0b110, 3);
            write_bits(output, (dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            write_bits(output, 0b1110, 4);
            write_bits(output, (dod + 2047) as u64, 12);
        } else {
            write_bits(output, 0b1111, 4);
            write_bits(output, dod as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = timestamp;
    }
}

/// Decoder for delta-of-delta encoded timestamps.
#[derive(Debug, Clone)]
pub struct TimestampDecoder<'a> {
    data: &'a Bits,
    pos: usize,
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    /// Creates a new timestamp decoder.
    pub fn new(data: &'a Bits) -> Self {
        Self {
            data,
            pos: 0,
            started: false,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    /// Decodes the next timestamp, or `None` when the stream is exhausted or truncated.
    pub fn decode_next(&mut self) -> Option<i64> {
        if !self.started {
            let ts = read_bits(self.data, &mut self.pos, 64)? as i64;
            self.started = true;
            self.prev_ts = ts;
            self.prev_delta = 0;
            return Some(ts);
        }

        // Count the leading '1' prefix bits (at most 4).
        let mut prefix = 0;
        while prefix < 4 {
            let bit = read_bits(self.data, &mut self.pos, 1)?;
            if bit == 0 {
                break;
            }
            prefix += 1;
        }

        let dod = match prefix {
            0 => 0,
            1 => read_bits(self.data, &mut self.pos, 7)? as i64 - 63,
            2 => read_bits(self.data, &mut self.pos, 9)? as i64 - 255,
            3 => read_bits(self.data, &mut self.pos, 12)? as i64 - 2047,
            _ => read_bits(self.data, &mut self.pos, 64)? as i64,
        };

        let delta = self.prev_delta.wrapping_add(dod);
        let ts = self.prev_ts.wrapping_add(delta);
        self.prev_delta = delta;
        self.prev_ts = ts;
        Some(ts)
    }
}

/// Encoder for float values using XOR compression.
#[derive(Debug, Clone, Default)]
pub struct ValueEncoder {
    started: bool,
    has_window: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    /// Creates a new value encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a float value into the output bit vector.
    pub fn encode(&mut self, value: f64, output: &mut Bits) {
        let bits = value.to_bits();

        if !self.started {
            self.started = true;
            self.prev_value = bits;
            write_bits(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_value;
        if xor == 0 {
            output.push(false);
        } else {
            // The leading count field is 5 bits wide.
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if self.has_window && leading >= self.prev_leading && trailing >= self.prev_trailing {
                write_bits(output, 0b10, 2);
                let meaningful = 64 - self.prev_leading - self.prev_trailing;
                write_bits(output, xor >> self.prev_trailing, meaningful);
            } else {
                write_bits(output, 0b11, 2);
                let meaningful = 64 - leading - trailing;
                write_bits(output, u64::from(leading), 5);
                write_bits(output, u64::from(meaningful - 1), 6);
                write_bits(output, xor >> trailing, meaningful);
                self.prev_leading = leading;
                self.prev_trailing = trailing;
                self.has_window = true;
            }
        }

        self.prev_value = bits;
    }
}

/// Decoder for XOR-encoded float values.
#[derive(Debug, Clone)]
pub struct ValueDecoder<'a> {
    data: &'a Bits,
    pos: usize,
    started: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    /// Creates a new value decoder.
    pub fn new(data: &'a Bits) -> Self {
        Self {
            data,
            pos: 0,
            started: false,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Decodes the next value, or `None` when the stream is exhausted or malformed.
    pub fn decode_next(&mut self) -> Option<f64> {
        if !self.started {
            let bits = read_bits(self.data, &mut self.pos, 64)?;
            self.started = true;
            self.prev_value = bits;
            return Some(f64::from_bits(bits));
        }

        let xor = if read_bits(self.data, &mut self.pos, 1)? == 0 {
            0
        } else if read_bits(self.data, &mut self.pos, 1)? == 0 {
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            read_bits(self.data, &mut self.pos, meaningful)? << self.prev_trailing
        } else {
            let leading = read_bits(self.data, &mut self.pos, 5)? as u32;
            let meaningful = read_bits(self.data, &mut self.pos, 6)? as u32 + 1;
            if leading + meaningful > 64 {
                return None;
            }
            let trailing = 64 - leading - meaningful;
            let value = read_bits(self.data, &mut self.pos, meaningful)?;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            value << trailing
        };

        let bits = self.prev_value ^ xor;
        self.prev_value = bits;
        Some(f64::from_bits(bits))
    }
}

/// Iterator over the samples of a [`GorillaChunk`].
#[derive(Debug, Clone)]
pub struct GorillaIter<'a> {
    timestamps: TimestampDecoder<'a>,
    values: ValueDecoder<'a>,
    remaining: u32,
}

impl Iterator for GorillaIter<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.remaining == 0 {
            return None;
        }
        let timestamp = self.timestamps.decode_next()?;
        let value = self.values.decode_next()?;
        self.remaining -= 1;
        Some(Sample::new(timestamp, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

/// A chunk storing its samples as two Gorilla bit streams.
#[derive(Debug, Clone, Default)]
pub struct GorillaChunk {
    timestamps: Bits,
    values: Bits,
    count: u32,
    first_ts: Timestamp,
    last_ts: Timestamp,
    ts_encoder: TimestampEncoder,
    val_encoder: ValueEncoder,
}

impl GorillaChunk {
    /// Creates an empty chunk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compresses an ascending run of samples into a chunk.
    pub fn from_samples(samples: &[Sample]) -> Self {
        let mut chunk = Self::new();
        for sample in samples {
            chunk.push(*sample);
        }
        chunk
    }

    /// Rebuilds a chunk from persisted bit streams.
    ///
    /// The streams are fully decoded and re-encoded so the encoder state is
    /// restored exactly.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::CorruptEncoding` if the streams hold fewer than
    /// `count` samples, carry trailing bits, or are not strictly ascending.
    pub fn from_bits(timestamps: Bits, values: Bits, count: u32) -> Result<Self> {
        let raw = Self {
            timestamps,
            values,
            count,
            ..Self::default()
        };
        let samples: Vec<Sample> = raw.iter().collect();
        if samples.len() != count as usize {
            return Err(SeriesError::CorruptEncoding(format!(
                "gorilla chunk declares {count} samples, decoded {}",
                samples.len()
            )));
        }
        if samples.windows(2).any(|w| w[0].timestamp >= w[1].timestamp) {
            return Err(SeriesError::CorruptEncoding(
                "gorilla chunk timestamps are not ascending".to_string(),
            ));
        }
        let chunk = Self::from_samples(&samples);
        if chunk.timestamps != raw.timestamps || chunk.values != raw.values {
            return Err(SeriesError::CorruptEncoding(
                "gorilla chunk carries trailing or non-canonical bits".to_string(),
            ));
        }
        Ok(chunk)
    }

    /// Appends a sample newer than every stored one.
    pub fn push(&mut self, sample: Sample) {
        if self.count == 0 {
            self.first_ts = sample.timestamp;
        }
        self.ts_encoder.encode(sample.timestamp, &mut self.timestamps);
        self.val_encoder.encode(sample.value, &mut self.values);
        self.last_ts = sample.timestamp;
        self.count += 1;
    }

    /// Returns an iterator over the stored samples.
    pub fn iter(&self) -> GorillaIter<'_> {
        GorillaIter {
            timestamps: TimestampDecoder::new(&self.timestamps),
            values: ValueDecoder::new(&self.values),
            remaining: self.count,
        }
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// Returns true if the chunk holds no samples.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// First stored timestamp.
    pub fn first_timestamp(&self) -> Option<Timestamp> {
        (self.count > 0).then_some(self.first_ts)
    }

    /// Last stored timestamp.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        (self.count > 0).then_some(self.last_ts)
    }

    /// Encoded size of both streams in bytes.
    pub fn size_bytes(&self) -> usize {
        self.timestamps.len().div_ceil(8) + self.values.len().div_ceil(8)
    }

    /// Timestamp bit stream.
    pub fn timestamp_bits(&self) -> &Bits {
        &self.timestamps
    }

    /// Value bit stream.
    pub fn value_bits(&self) -> &Bits {
        &self.values
    }
}
