//! Persistence codec for a single series.
//!
//! A dump holds everything reachable from one series: options, labels,
//! `sourceKey`, every chunk, and every outgoing rule together with the full
//! state of its open bucket, so compaction resumes exactly after a restore.
//!
//! # Layout (version 1, little-endian)
//!
//! ```text
//! +--------+---------+------------------------------+--------+
//! | "ATSS" | version | body                         | crc32  |
//! | 4B     | u16     | see below                    | u32    |
//! +--------+---------+------------------------------+--------+
//!
//! body:
//!   name str16 | retention_ms u64 | chunk_size u32 | encoding u8 | dup_policy u8
//!   labels: u16 count, (str16 key, str16 value)*
//!   source_key: u8 flag, str16
//!   last sample: u8 flag, i64 timestamp, f64 value
//!   chunks: u32 count, per chunk:
//!     u8 encoding = 0 | u32 count | (i64, f64)*
//!     u8 encoding = 1 | u32 count | u32 ts bits | bytes | u32 value bits | bytes
//!   rules: u16 count, per rule:
//!     str16 dest | u8 kind | u64 bucket_ms | u8 open flag | i64 bucket_start
//!     | u64 count | f64 sum, min, max | f64 first, i64 first_ts
//!     | f64 last, i64 last_ts | f64 mean, m2
//! ```
//!
//! The CRC32 covers magic, version and body.

use crate::aggregation::{Accumulator, Aggregation};
use crate::chunk::gorilla::Bits;
use crate::chunk::{Chunk, GorillaChunk, Sample, UncompressedChunk, SAMPLE_SIZE};
use crate::config::{ChunkEncoding, DuplicatePolicy, SeriesOptions};
use crate::error::{Result, SeriesError};
use crate::namespace::{read_series, write_series, Namespace, SeriesHandle};
use crate::rule::CompactionRule;
use crate::series::Series;
use std::io::{Read, Write};
use tracing::debug;

/// Magic bytes opening every dump.
pub const MAGIC: [u8; 4] = *b"ATSS";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 6;
const TRAILER_SIZE: usize = 4;

/// Encodes a series into a self-contained, checksummed buffer.
///
/// # Errors
///
/// Returns `SeriesError::InvalidArgument` if a string or collection is too
/// long for its length prefix.
pub fn encode_series(series: &Series) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(estimate_size(series));
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

    let options = series.options();
    put_str(&mut out, series.name())?;
    out.extend_from_slice(&options.retention_ms.to_le_bytes());
    out.extend_from_slice(&len_u32(options.chunk_size_bytes, "chunk size")?.to_le_bytes());
    out.push(options.encoding as u8);
    out.push(options.duplicate_policy as u8);

    out.extend_from_slice(&len_u16(options.labels.len(), "label count")?.to_le_bytes());
    for (key, value) in &options.labels {
        put_str(&mut out, key)?;
        put_str(&mut out, value)?;
    }

    match series.source_key() {
        Some(source) => {
            out.push(1);
            put_str(&mut out, source)?;
        }
        None => out.push(0),
    }

    let last = series.last_sample();
    out.push(u8::from(last.is_some()));
    let last = last.unwrap_or(Sample::new(0, 0.0));
    out.extend_from_slice(&last.timestamp.to_le_bytes());
    out.extend_from_slice(&last.value.to_le_bytes());

    let chunks = series.chunks();
    out.extend_from_slice(&len_u32(chunks.len(), "chunk count")?.to_le_bytes());
    for chunk in chunks {
        put_chunk(&mut out, chunk)?;
    }

    let rules = series.rules();
    out.extend_from_slice(&len_u16(rules.len(), "rule count")?.to_le_bytes());
    for rule in rules {
        put_rule(&mut out, rule)?;
    }

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());

    debug!(
        "Encoded series {} ({} chunks, {} rules, {} bytes)",
        series.name(),
        chunks.len(),
        rules.len(),
        out.len()
    );
    Ok(out)
}

/// Decodes a buffer produced by [`encode_series`].
///
/// The returned series is detached: rule destinations are resolved by name
/// when compaction next needs them (see [`link_destinations`]).
///
/// # Errors
///
/// - `SeriesError::InvalidMagic` if the buffer does not start with `ATSS`
/// - `SeriesError::UnsupportedVersion` for any version other than 1
/// - `SeriesError::ChecksumMismatch` if the CRC trailer does not match
/// - `SeriesError::CorruptEncoding` for truncation, unknown tags, bad UTF-8,
///   non-ascending samples or trailing bytes
pub fn decode_series(bytes: &[u8]) -> Result<Series> {
    if bytes.len() < MAGIC.len() {
        return Err(corrupt("buffer shorter than magic"));
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[..4]);
    if magic != MAGIC {
        return Err(SeriesError::InvalidMagic(magic));
    }
    if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(corrupt("buffer shorter than header and checksum"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(SeriesError::UnsupportedVersion(version));
    }

    let (payload, trailer) = bytes.split_at(bytes.len() - TRAILER_SIZE);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(SeriesError::ChecksumMismatch { expected, actual });
    }

    let mut reader = Reader::new(&payload[HEADER_SIZE..]);
    let series = read_body(&mut reader)?;
    if !reader.is_empty() {
        return Err(corrupt(format!("{} trailing bytes", reader.remaining())));
    }

    debug!(
        "Decoded series {} ({} chunks, {} rules)",
        series.name(),
        series.chunk_count(),
        series.rules().len()
    );
    Ok(series)
}

/// Writes an encoded series to `writer`.
pub fn write_to<W: Write>(series: &Series, writer: &mut W) -> Result<()> {
    let bytes = encode_series(series)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads an encoded series from `reader` until EOF.
pub fn read_from<R: Read>(reader: &mut R) -> Result<Series> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    decode_series(&bytes)
}

/// Points every existing destination of the series behind `handle` back at it.
///
/// Destinations that do not exist yet are left for lazy resolution. Returns
/// the number of destinations linked. The caller must not hold a lock on any
/// of the involved series.
pub fn link_destinations(namespace: &dyn Namespace, handle: &SeriesHandle) -> usize {
    let (source, destinations): (String, Vec<String>) = {
        let series = read_series(handle);
        (
            series.name().to_string(),
            series
                .rules()
                .iter()
                .map(|r| r.dest_key().to_string())
                .collect(),
        )
    };

    let mut linked = 0;
    for dest_key in destinations {
        if dest_key == source {
            continue;
        }
        match namespace.lookup(&dest_key) {
            Some(dest) => {
                write_series(&dest).set_source_key(Some(source.clone()));
                linked += 1;
            }
            None => debug!(
                "Rule destination {} of {} not present yet, resolving lazily",
                dest_key, source
            ),
        }
    }
    linked
}

fn estimate_size(series: &Series) -> usize {
    let chunks: usize = series.chunks().iter().map(|c| 16 + c.size_bytes()).sum();
    128 + series.name().len() + chunks + series.rules().len() * 112
}

fn corrupt(reason: impl Into<String>) -> SeriesError {
    SeriesError::CorruptEncoding(reason.into())
}

fn len_u16(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len)
        .map_err(|_| SeriesError::InvalidArgument(format!("{what} {len} exceeds {}", u16::MAX)))
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| SeriesError::InvalidArgument(format!("{what} {len} exceeds {}", u32::MAX)))
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    out.extend_from_slice(&len_u16(s.len(), "string length")?.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_bits(out: &mut Vec<u8>, bits: &Bits) -> Result<()> {
    let mut packed = bits.clone();
    packed.set_uninitialized(false);
    out.extend_from_slice(&len_u32(bits.len(), "bit stream length")?.to_le_bytes());
    out.extend_from_slice(packed.as_raw_slice());
    Ok(())
}

fn put_chunk(out: &mut Vec<u8>, chunk: &Chunk) -> Result<()> {
    out.push(chunk.encoding() as u8);
    out.extend_from_slice(&len_u32(chunk.len(), "sample count")?.to_le_bytes());
    match chunk {
        Chunk::Uncompressed(c) => {
            for sample in c.as_slice() {
                out.extend_from_slice(&sample.timestamp.to_le_bytes());
                out.extend_from_slice(&sample.value.to_le_bytes());
            }
        }
        Chunk::Compressed(c) => {
            put_bits(out, c.timestamp_bits())?;
            put_bits(out, c.value_bits())?;
        }
    }
    Ok(())
}

fn put_rule(out: &mut Vec<u8>, rule: &CompactionRule) -> Result<()> {
    put_str(out, rule.dest_key())?;
    out.push(rule.aggregation() as u8);
    out.extend_from_slice(&(rule.bucket_duration_ms() as u64).to_le_bytes());

    let acc = rule.accumulator();
    out.push(u8::from(acc.bucket_start.is_some()));
    out.extend_from_slice(&acc.bucket_start.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&acc.count.to_le_bytes());
    for field in [acc.sum, acc.min, acc.max] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out.extend_from_slice(&acc.first.to_le_bytes());
    out.extend_from_slice(&acc.first_ts.to_le_bytes());
    out.extend_from_slice(&acc.last.to_le_bytes());
    out.extend_from_slice(&acc.last_ts.to_le_bytes());
    for field in [acc.mean, acc.m2] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    Ok(())
}

/// Bounds-checked cursor over a body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(corrupt(format!(
                "truncated: need {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(corrupt(format!("invalid flag byte {other}"))),
        }
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn str16(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|err| corrupt(format!("invalid UTF-8: {err}")))
    }

    fn bits(&mut self) -> Result<Bits> {
        let len = self.u32()? as usize;
        let bytes = self.take(len.div_ceil(8))?;
        let mut bits = Bits::from_vec(bytes.to_vec());
        bits.truncate(len);
        Ok(bits)
    }
}

fn read_body(reader: &mut Reader<'_>) -> Result<Series> {
    let name = reader.str16()?;
    let retention_ms = reader.u64()?;
    let chunk_size_bytes = reader.u32()? as usize;
    let encoding_tag = reader.u8()?;
    let encoding = ChunkEncoding::from_u8(encoding_tag)
        .ok_or_else(|| corrupt(format!("unknown chunk encoding {encoding_tag}")))?;
    let policy_tag = reader.u8()?;
    let duplicate_policy = DuplicatePolicy::from_u8(policy_tag)
        .ok_or_else(|| corrupt(format!("unknown duplicate policy {policy_tag}")))?;

    let label_count = reader.u16()? as usize;
    let mut labels = Vec::with_capacity(label_count);
    for _ in 0..label_count {
        let key = reader.str16()?;
        let value = reader.str16()?;
        labels.push((key, value));
    }

    let options = SeriesOptions {
        retention_ms,
        chunk_size_bytes,
        encoding,
        duplicate_policy,
        labels,
    };
    options
        .validate()
        .map_err(|err| corrupt(format!("invalid options: {err}")))?;

    let source_key = if reader.flag()? {
        Some(reader.str16()?)
    } else {
        None
    };

    let has_last = reader.flag()?;
    let last = Sample::new(reader.i64()?, reader.f64()?);

    let chunk_count = reader.u32()? as usize;
    let mut chunks: Vec<Chunk> = Vec::with_capacity(chunk_count.min(reader.remaining() / 5));
    for idx in 0..chunk_count {
        let chunk = read_chunk(reader, encoding)?;
        let prev_last = chunks.last().and_then(Chunk::last_timestamp);
        if let (Some(prev), Some(first)) = (prev_last, chunk.first_timestamp()) {
            if first <= prev {
                return Err(corrupt(format!(
                    "chunk {idx} starts at {first}, not after previous chunk end {prev}"
                )));
            }
        }
        chunks.push(chunk);
    }

    let stored_last = chunks.last().and_then(|c| c.iter().last());
    let declared_last = has_last.then_some(last);
    let matches = match (stored_last, declared_last) {
        (None, None) => true,
        (Some(a), Some(b)) => a.timestamp == b.timestamp && a.value.to_bits() == b.value.to_bits(),
        _ => false,
    };
    if !matches {
        return Err(corrupt("last sample does not match chunk contents"));
    }

    let rule_count = reader.u16()? as usize;
    let mut rules = Vec::with_capacity(rule_count);
    for _ in 0..rule_count {
        let rule = read_rule(reader)?;
        if rules
            .iter()
            .any(|r: &CompactionRule| r.dest_key() == rule.dest_key())
        {
            return Err(corrupt(format!("duplicate rule to {}", rule.dest_key())));
        }
        rules.push(rule);
    }

    Ok(Series::from_parts(name, options, chunks, source_key, rules))
}

fn read_chunk(reader: &mut Reader<'_>, expected: ChunkEncoding) -> Result<Chunk> {
    let tag = reader.u8()?;
    let encoding =
        ChunkEncoding::from_u8(tag).ok_or_else(|| corrupt(format!("unknown chunk tag {tag}")))?;
    if encoding != expected {
        return Err(corrupt(format!(
            "{encoding} chunk in a {expected} series"
        )));
    }
    let count = reader.u32()?;
    if count == 0 {
        return Err(corrupt("empty chunk"));
    }

    match encoding {
        ChunkEncoding::Uncompressed => {
            let count = count as usize;
            if count > reader.remaining() / SAMPLE_SIZE {
                return Err(corrupt(format!("truncated: chunk declares {count} samples")));
            }
            let mut samples = Vec::with_capacity(count);
            for _ in 0..count {
                samples.push(Sample::new(reader.i64()?, reader.f64()?));
            }
            if samples.windows(2).any(|w| w[0].timestamp >= w[1].timestamp) {
                return Err(corrupt("chunk timestamps are not ascending"));
            }
            Ok(Chunk::Uncompressed(UncompressedChunk::from_samples(samples)))
        }
        ChunkEncoding::Compressed => {
            let timestamps = reader.bits()?;
            let values = reader.bits()?;
            Ok(Chunk::Compressed(GorillaChunk::from_bits(
                timestamps, values, count,
            )?))
        }
    }
}

fn read_rule(reader: &mut Reader<'_>) -> Result<CompactionRule> {
    let dest_key = reader.str16()?;
    let kind_tag = reader.u8()?;
    let aggregation = Aggregation::from_u8(kind_tag)
        .ok_or_else(|| corrupt(format!("unknown aggregation {kind_tag}")))?;
    let bucket_ms = reader.u64()?;
    let bucket_ms = i64::try_from(bucket_ms)
        .map_err(|_| corrupt(format!("bucket duration {bucket_ms} out of range")))?;

    let open = reader.flag()?;
    let bucket_start = reader.i64()?;
    let count = reader.u64()?;
    if !open && count > 0 {
        return Err(corrupt(format!(
            "rule to {dest_key} has {count} observations but no open bucket"
        )));
    }
    let accumulator = Accumulator {
        bucket_start: open.then_some(bucket_start),
        count,
        sum: reader.f64()?,
        min: reader.f64()?,
        max: reader.f64()?,
        first: reader.f64()?,
        first_ts: reader.i64()?,
        last: reader.f64()?,
        last_ts: reader.i64()?,
        mean: reader.f64()?,
        m2: reader.f64()?,
    };

    CompactionRule::with_accumulator(dest_key, aggregation, bucket_ms, accumulator)
        .map_err(|err| corrupt(format!("invalid rule: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Timestamp;

    fn sample_series(options: SeriesOptions) -> Series {
        let mut series = Series::new("src", options.with_label("name", "brown")).unwrap();
        series.add_rule("avg", Aggregation::Avg, 10).unwrap();
        series.set_source_key(Some("upstream".to_string()));
        for ts in 0..55 {
            series.append(Sample::new(ts, ts as f64 * 0.5)).unwrap();
        }
        for ts in 0..55 {
            series.rules_mut()[0]
                .observe(Sample::new(ts, ts as f64 * 0.5))
                .unwrap();
        }
        series
    }

    fn all(series: &Series) -> Vec<Sample> {
        series.range(Timestamp::MIN, Timestamp::MAX, None).collect()
    }

    #[test]
    fn test_round_trip_both_encodings() {
        for options in [
            SeriesOptions::default().with_chunk_size(64),
            SeriesOptions::default().uncompressed().with_chunk_size(160),
        ] {
            let series = sample_series(options);
            let bytes = encode_series(&series).unwrap();
            let restored = decode_series(&bytes).unwrap();

            assert_eq!(restored.name(), "src");
            assert_eq!(restored.options(), series.options());
            assert_eq!(restored.source_key(), Some("upstream"));
            assert_eq!(restored.chunk_count(), series.chunk_count());
            assert_eq!(restored.total_samples(), series.total_samples());
            assert_eq!(restored.last_sample(), series.last_sample());
            assert_eq!(all(&restored), all(&series));
            assert_eq!(restored.rules(), series.rules());
        }
    }

    #[test]
    fn test_empty_series_round_trip() {
        let series = Series::new("empty", SeriesOptions::default()).unwrap();
        let restored = decode_series(&encode_series(&series).unwrap()).unwrap();
        assert_eq!(restored.total_samples(), 0);
        assert_eq!(restored.last_sample(), None);
        assert!(restored.rules().is_empty());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = encode_series(&sample_series(SeriesOptions::default())).unwrap();
        bytes[0] = b'X';
        let err = decode_series(&bytes).unwrap_err();
        assert!(matches!(err, SeriesError::InvalidMagic(_)));
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_rejects_future_version() {
        let mut bytes = encode_series(&sample_series(SeriesOptions::default())).unwrap();
        bytes[4..6].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            decode_series(&bytes),
            Err(SeriesError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_rejects_flipped_byte() {
        let mut bytes = encode_series(&sample_series(SeriesOptions::default())).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        let err = decode_series(&bytes).unwrap_err();
        assert!(matches!(err, SeriesError::ChecksumMismatch { .. }));
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_rejects_truncation_with_valid_crc() {
        let bytes = encode_series(&sample_series(SeriesOptions::default())).unwrap();
        let mut cut = bytes[..bytes.len() - 20].to_vec();
        let crc = crc32fast::hash(&cut);
        cut.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            decode_series(&cut),
            Err(SeriesError::CorruptEncoding(_))
        ));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let bytes = encode_series(&sample_series(SeriesOptions::default())).unwrap();
        let mut padded = bytes[..bytes.len() - TRAILER_SIZE].to_vec();
        padded.push(0);
        let crc = crc32fast::hash(&padded);
        padded.extend_from_slice(&crc.to_le_bytes());
        let err = decode_series(&padded).unwrap_err();
        assert!(matches!(err, SeriesError::CorruptEncoding(msg) if msg.contains("trailing")));
    }

    #[test]
    fn test_rejects_short_buffers() {
        assert!(matches!(
            decode_series(b"AT"),
            Err(SeriesError::CorruptEncoding(_))
        ));
        assert!(matches!(
            decode_series(b"ATSS\x01"),
            Err(SeriesError::CorruptEncoding(_))
        ));
    }

    #[test]
    fn test_write_and_read_stream() {
        let series = sample_series(SeriesOptions::default());
        let mut buf = Vec::new();
        write_to(&series, &mut buf).unwrap();
        let restored = read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(all(&restored), all(&series));
    }
}
