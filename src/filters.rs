//! The filter pipeline: shuffle, deflate, Fletcher32 and LZF.
//!
//! Filters are recorded in the order they were applied at write time. On
//! read the inverse filters run in reverse: the last encoder is the first
//! decoder. A chunk's filter mask can disable individual pipeline entries,
//! and a filter flagged optional may fail without aborting the read.

use std::io::Read;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Hdf5Error, Result};
use crate::parse::layout::{FilterPipeline, FilterSpec};

pub const FILTER_SHUFFLE: u16 = 1;
pub const FILTER_DEFLATE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;
pub const FILTER_LZF: u16 = 32000;

/// One filter implementation: an id, a decoder, and optionally an
/// encoder for the write path.
pub trait Filter {
    fn id(&self) -> u16;

    /// Invert the filter on stored bytes. `spec` carries the client data
    /// words recorded in the pipeline; `element_size` is the dataset
    /// element width.
    fn decode(&self, data: Vec<u8>, spec: &FilterSpec, element_size: u64) -> Result<Vec<u8>>;

    /// Apply the filter the way a writer would. Filters without an
    /// encoder refuse.
    fn encode(&self, _data: Vec<u8>, _spec: &FilterSpec, _element_size: u64) -> Result<Vec<u8>> {
        Err(Hdf5Error::UnsupportedFilter(self.id()))
    }
}

struct Shuffle;
struct Deflate;
struct Fletcher32;
struct Lzf;

impl Filter for Shuffle {
    fn id(&self) -> u16 {
        FILTER_SHUFFLE
    }

    fn decode(&self, data: Vec<u8>, spec: &FilterSpec, element_size: u64) -> Result<Vec<u8>> {
        unshuffle(&data, shuffle_width(spec, element_size))
    }

    fn encode(&self, data: Vec<u8>, spec: &FilterSpec, element_size: u64) -> Result<Vec<u8>> {
        shuffle(&data, shuffle_width(spec, element_size))
    }
}

impl Filter for Deflate {
    fn id(&self) -> u16 {
        FILTER_DEFLATE
    }

    fn decode(&self, data: Vec<u8>, _spec: &FilterSpec, _element_size: u64) -> Result<Vec<u8>> {
        inflate(&data)
    }

    fn encode(&self, data: Vec<u8>, spec: &FilterSpec, _element_size: u64) -> Result<Vec<u8>> {
        let level = spec.client_data.first().copied().unwrap_or(6);
        deflate(&data, level)
    }
}

impl Filter for Fletcher32 {
    fn id(&self) -> u16 {
        FILTER_FLETCHER32
    }

    fn decode(&self, data: Vec<u8>, _spec: &FilterSpec, _element_size: u64) -> Result<Vec<u8>> {
        fletcher32_strip(data)
    }

    fn encode(&self, data: Vec<u8>, _spec: &FilterSpec, _element_size: u64) -> Result<Vec<u8>> {
        Ok(fletcher32_append(data))
    }
}

impl Filter for Lzf {
    fn id(&self) -> u16 {
        FILTER_LZF
    }

    fn decode(&self, data: Vec<u8>, _spec: &FilterSpec, _element_size: u64) -> Result<Vec<u8>> {
        lzf_decompress(&data)
    }

    fn encode(&self, data: Vec<u8>, _spec: &FilterSpec, _element_size: u64) -> Result<Vec<u8>> {
        Ok(lzf_compress(&data))
    }
}

/// The filters this library ships.
const BUILTIN: [&dyn Filter; 4] = [&Shuffle, &Deflate, &Fletcher32, &Lzf];

fn find_filter(id: u16) -> Option<&'static dyn Filter> {
    BUILTIN.iter().copied().find(|f| f.id() == id)
}

/// Undo the pipeline on a stored chunk. `element_size` is the dataset
/// element width, used when a shuffle entry carries no client data. Bit i
/// of `filter_mask` set means entry i was skipped when the chunk was
/// written.
pub fn decode_pipeline(
    pipeline: &FilterPipeline,
    data: Vec<u8>,
    element_size: u64,
    filter_mask: u32,
) -> Result<Vec<u8>> {
    let mut data = data;
    for (index, spec) in pipeline.filters.iter().enumerate().rev() {
        if filter_mask & (1 << index) != 0 {
            continue;
        }
        let filter = match find_filter(spec.id) {
            Some(f) => f,
            None if spec.optional => continue,
            None => return Err(Hdf5Error::UnsupportedFilter(spec.id)),
        };
        data = if spec.optional {
            // Keep the input intact so a failed optional filter can be
            // skipped.
            match filter.decode(data.clone(), spec, element_size) {
                Ok(out) => out,
                Err(_) => data,
            }
        } else {
            filter.decode(data, spec, element_size)?
        };
    }
    Ok(data)
}

/// Apply the pipeline the way a writer would, left to right.
pub fn encode_pipeline(
    pipeline: &FilterPipeline,
    data: Vec<u8>,
    element_size: u64,
) -> Result<Vec<u8>> {
    let mut data = data;
    for spec in &pipeline.filters {
        let filter =
            find_filter(spec.id).ok_or(Hdf5Error::UnsupportedFilter(spec.id))?;
        data = filter.encode(data, spec, element_size)?;
    }
    Ok(data)
}

fn shuffle_width(spec: &FilterSpec, element_size: u64) -> usize {
    spec.client_data
        .first()
        .map(|w| *w as usize)
        .unwrap_or(element_size as usize)
        .max(1)
}

/// Byte shuffle: regroup S bytes of N-byte elements into N planes of S/N
/// bytes, one plane per byte position.
pub fn shuffle(data: &[u8], width: usize) -> Result<Vec<u8>> {
    if width <= 1 {
        return Ok(data.to_vec());
    }
    if data.len() % width != 0 {
        return Err(Hdf5Error::FilterError {
            name: "shuffle",
            detail: format!("{} bytes is not a whole number of {}-byte elements", data.len(), width),
        });
    }
    let count = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for (k, element) in data.chunks_exact(width).enumerate() {
        for (j, byte) in element.iter().enumerate() {
            out[j * count + k] = *byte;
        }
    }
    Ok(out)
}

/// Inverse of [`shuffle`].
pub fn unshuffle(data: &[u8], width: usize) -> Result<Vec<u8>> {
    if width <= 1 {
        return Ok(data.to_vec());
    }
    if data.len() % width != 0 {
        return Err(Hdf5Error::FilterError {
            name: "shuffle",
            detail: format!("{} bytes is not a whole number of {}-byte elements", data.len(), width),
        });
    }
    let count = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for k in 0..count {
        for j in 0..width {
            out[k * width + j] = data[j * count + k];
        }
    }
    Ok(out)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Hdf5Error::FilterError {
            name: "deflate",
            detail: e.to_string(),
        })?;
    Ok(out)
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    use std::io::Write;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Hdf5Error::FilterError {
            name: "deflate",
            detail: e.to_string(),
        })
}

/// The checksum over 16-bit big-endian words used by the Fletcher32
/// filter. The sums are folded back into 16 bits after every block of at
/// most 360 words, the overflow bound the format's reference
/// implementation uses; matching its block structure keeps the value
/// bit-identical.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let mut words = data.chunks_exact(2);
    let mut remaining = data.len() / 2;
    while remaining > 0 {
        let block = remaining.min(360);
        for w in words.by_ref().take(block) {
            sum1 = sum1.wrapping_add(u32::from(w[0]) << 8 | u32::from(w[1]));
            sum2 = sum2.wrapping_add(sum1);
        }
        remaining -= block;
        sum1 = (sum1 & 0xFFFF) + (sum1 >> 16);
        sum2 = (sum2 & 0xFFFF) + (sum2 >> 16);
    }
    if data.len() % 2 == 1 {
        sum1 = sum1.wrapping_add(u32::from(data[data.len() - 1]) << 8);
        sum2 = sum2.wrapping_add(sum1);
    }
    sum1 = (sum1 & 0xFFFF) + (sum1 >> 16);
    sum2 = (sum2 & 0xFFFF) + (sum2 >> 16);
    sum1 = (sum1 & 0xFFFF) + (sum1 >> 16);
    sum2 = (sum2 & 0xFFFF) + (sum2 >> 16);
    (sum2 << 16) | sum1
}

fn fletcher32_strip(mut data: Vec<u8>) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(Hdf5Error::FilterError {
            name: "fletcher32",
            detail: "block shorter than its checksum".to_owned(),
        });
    }
    let payload_len = data.len() - 4;
    let stored = u32::from_le_bytes([
        data[payload_len],
        data[payload_len + 1],
        data[payload_len + 2],
        data[payload_len + 3],
    ]);
    let computed = fletcher32(&data[..payload_len]);
    if stored != computed {
        return Err(Hdf5Error::ChecksumMismatch { stored, computed });
    }
    data.truncate(payload_len);
    Ok(data)
}

fn fletcher32_append(mut data: Vec<u8>) -> Vec<u8> {
    let checksum = fletcher32(&data);
    data.extend_from_slice(&checksum.to_le_bytes());
    data
}

/// Decompress an LZF token stream as produced by h5py's LZF filter: a
/// control byte below 32 introduces a literal run, anything else a
/// (length, distance) back-reference into the output produced so far.
pub fn lzf_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut i = 0;
    while i < input.len() {
        let ctrl = input[i] as usize;
        i += 1;
        if ctrl < 32 {
            let run = ctrl + 1;
            let literal = input.get(i..i + run).ok_or_else(|| Hdf5Error::FilterError {
                name: "lzf",
                detail: "literal run past end of input".to_owned(),
            })?;
            out.extend_from_slice(literal);
            i += run;
        } else {
            let mut len = ctrl >> 5;
            if len == 7 {
                len += *input.get(i).ok_or_else(|| Hdf5Error::FilterError {
                    name: "lzf",
                    detail: "truncated back-reference length".to_owned(),
                })? as usize;
                i += 1;
            }
            let low = *input.get(i).ok_or_else(|| Hdf5Error::FilterError {
                name: "lzf",
                detail: "truncated back-reference distance".to_owned(),
            })? as usize;
            i += 1;
            let distance = ((ctrl & 0x1F) << 8 | low) + 1;
            if distance > out.len() {
                return Err(Hdf5Error::FilterError {
                    name: "lzf",
                    detail: "back-reference before start of output".to_owned(),
                });
            }
            // Byte-wise copy: the reference may overlap the bytes being
            // produced.
            let mut src = out.len() - distance;
            for _ in 0..len + 2 {
                let b = out[src];
                out.push(b);
                src += 1;
            }
        }
    }
    Ok(out)
}

/// Emit a valid LZF stream without back-references: literal runs of at
/// most 32 bytes. Every stream this produces is inverted exactly by
/// [`lzf_decompress`].
pub fn lzf_compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 32 + 1);
    for run in input.chunks(32) {
        out.push((run.len() - 1) as u8);
        out.extend_from_slice(run);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(specs: &[(u16, bool, &[u32])]) -> FilterPipeline {
        FilterPipeline {
            filters: specs
                .iter()
                .map(|(id, optional, client)| FilterSpec {
                    id: *id,
                    name: String::new(),
                    optional: *optional,
                    client_data: client.to_vec(),
                })
                .collect(),
        }
    }

    #[test]
    fn shuffle_transposes_byte_planes() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let shuffled = shuffle(&data, 2).unwrap();
        assert_eq!(shuffled, [1, 3, 5, 2, 4, 6]);
        assert_eq!(unshuffle(&shuffled, 2).unwrap(), data);
    }

    #[test]
    fn shuffle_rejects_ragged_input() {
        assert!(shuffle(&[1u8, 2, 3], 2).is_err());
    }

    #[test]
    fn deflate_roundtrip() {
        let data: Vec<u8> = (0..200u8).cycle().take(4096).collect();
        let packed = deflate(&data, 6).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed).unwrap(), data);
    }

    #[test]
    fn fletcher32_detects_corruption() {
        let data = b"abcdefgh".to_vec();
        let mut stored = fletcher32_append(data.clone());
        assert_eq!(fletcher32_strip(stored.clone()).unwrap(), data);
        stored[0] ^= 0xFF;
        match fletcher32_strip(stored) {
            Err(Hdf5Error::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn fletcher32_odd_length() {
        let data = b"abcdefg".to_vec();
        let stored = fletcher32_append(data.clone());
        assert_eq!(fletcher32_strip(stored).unwrap(), data);
    }

    #[test]
    fn lzf_literal_roundtrip() {
        let data: Vec<u8> = (0..=255u8).collect();
        let packed = lzf_compress(&data);
        assert_eq!(lzf_decompress(&packed).unwrap(), data);
    }

    #[test]
    fn lzf_backreference_with_overlap() {
        // Literal "ab", then a back-reference of 6 bytes at distance 2:
        // the classic overlapping repeat.
        let stream = [0x01, b'a', b'b', 0x80, 0x01];
        let out = lzf_decompress(&stream).unwrap();
        assert_eq!(out, b"abababab");
    }

    #[test]
    fn lzf_long_backreference_uses_extension_byte() {
        let mut stream = vec![0x00, b'x'];
        stream.extend_from_slice(&[0xE0, 6, 0x00]);
        let out = lzf_decompress(&stream).unwrap();
        // length = 7 + 6 + 2 = 15 copies of 'x' after the literal.
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|b| *b == b'x'));
    }

    #[test]
    fn lzf_rejects_bad_distance() {
        let stream = [0x20u8, 0x05];
        assert!(lzf_decompress(&stream).is_err());
    }

    #[test]
    fn pipeline_decodes_in_reverse_order() {
        // Write order: shuffle then deflate; read order must invert
        // deflate first.
        let p = pipeline(&[(FILTER_SHUFFLE, false, &[4]), (FILTER_DEFLATE, false, &[6])]);
        let data: Vec<u8> = (0..64u8).collect();
        let stored = encode_pipeline(&p, data.clone(), 4).unwrap();
        assert_eq!(decode_pipeline(&p, stored, 4, 0).unwrap(), data);
    }

    #[test]
    fn pipeline_respects_filter_mask() {
        let p = pipeline(&[(FILTER_SHUFFLE, false, &[4]), (FILTER_DEFLATE, false, &[6])]);
        let data: Vec<u8> = (0..64u8).collect();
        // Chunk written with the shuffle entry masked out.
        let stored = {
            let only_deflate = pipeline(&[(FILTER_DEFLATE, false, &[6])]);
            encode_pipeline(&only_deflate, data.clone(), 4).unwrap()
        };
        assert_eq!(decode_pipeline(&p, stored, 4, 0b01).unwrap(), data);
    }

    #[test]
    fn optional_filter_failure_is_skipped() {
        let p = pipeline(&[(FILTER_DEFLATE, true, &[6])]);
        // Not a zlib stream; the optional deflate entry is skipped.
        let data = vec![1u8, 2, 3, 4];
        assert_eq!(decode_pipeline(&p, data.clone(), 1, 0).unwrap(), data);
    }

    #[test]
    fn unknown_required_filter_fails() {
        let p = pipeline(&[(9999, false, &[])]);
        match decode_pipeline(&p, vec![0u8; 8], 1, 0) {
            Err(Hdf5Error::UnsupportedFilter(9999)) => {}
            other => panic!("expected UnsupportedFilter, got {:?}", other),
        }
    }

    #[test]
    fn fletcher_then_deflate_roundtrip() {
        let p = pipeline(&[
            (FILTER_FLETCHER32, false, &[]),
            (FILTER_DEFLATE, false, &[6]),
        ]);
        let data: Vec<u8> = (0..100u8).collect();
        let stored = encode_pipeline(&p, data.clone(), 1).unwrap();
        assert_eq!(decode_pipeline(&p, stored, 1, 0).unwrap(), data);
    }
}
