//! Order-preserving tuple encoding.
//!
//! Lexicographic byte order of the encoded form matches the logical order of
//! the decoded segments: Null < Bytes < Str < Int, and within each type the
//! natural ordering. Integer prefixes produced by `encode_segment` are
//! self-delimiting, so no encoded integer is a proper prefix of another.

use crate::error::KvError;

const TAG_NULL: u8 = 0x00;
const TAG_BYTES: u8 = 0x01;
const TAG_STR: u8 = 0x02;
const TAG_INT_ZERO: u8 = 0x14;
const ESCAPE: u8 = 0xff;

/// One typed element of a tuple-encoded key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Null,
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
}

impl Segment {
    pub fn is_null(&self) -> bool {
        matches!(self, Segment::Null)
    }
}

/// Append the encoding of one segment to `out`.
pub fn encode_segment(out: &mut Vec<u8>, segment: &Segment) {
    match segment {
        Segment::Null => out.push(TAG_NULL),
        Segment::Bytes(bytes) => {
            out.push(TAG_BYTES);
            encode_escaped(out, bytes);
        }
        Segment::Str(s) => {
            out.push(TAG_STR);
            encode_escaped(out, s.as_bytes());
        }
        Segment::Int(v) => encode_int(out, *v),
    }
}

/// Encode a slice of segments into `out`.
pub fn pack_segments(out: &mut Vec<u8>, segments: &[Segment]) {
    for segment in segments {
        encode_segment(out, segment);
    }
}

/// Decode all segments from `data`, failing on trailing or malformed bytes.
pub fn unpack_segments(data: &[u8]) -> Result<Vec<Segment>, KvError> {
    let mut offset = 0usize;
    let mut out = Vec::new();
    while offset < data.len() {
        out.push(decode_segment(data, &mut offset)?);
    }
    Ok(out)
}

/// Decode one segment from `data` at `offset`, advancing the cursor.
pub fn decode_segment(data: &[u8], offset: &mut usize) -> Result<Segment, KvError> {
    let tag = *data
        .get(*offset)
        .ok_or_else(|| KvError::Corrupt("truncated segment tag".into()))?;
    *offset += 1;
    match tag {
        TAG_NULL => Ok(Segment::Null),
        TAG_BYTES => Ok(Segment::Bytes(decode_escaped(data, offset)?)),
        TAG_STR => {
            let raw = decode_escaped(data, offset)?;
            let s = String::from_utf8(raw)
                .map_err(|err| KvError::Corrupt(format!("invalid utf8 in segment: {err}")))?;
            Ok(Segment::Str(s))
        }
        tag if tag > TAG_INT_ZERO - 9 && tag < TAG_INT_ZERO + 9 => {
            decode_int(tag, data, offset)
        }
        other => Err(KvError::Corrupt(format!("unknown segment tag {other:#04x}"))),
    }
}

/// Smallest byte string strictly greater than every key that has `prefix` as
/// a prefix. Fails if the prefix is empty or all 0xff.
pub fn strinc(prefix: &[u8]) -> Result<Vec<u8>, KvError> {
    for idx in (0..prefix.len()).rev() {
        if prefix[idx] != 0xff {
            let mut out = prefix[..=idx].to_vec();
            out[idx] += 1;
            return Ok(out);
        }
    }
    Err(KvError::Corrupt("prefix has no strict upper bound".into()))
}

// Bytes/strings use a 0x00 terminator; literal 0x00 becomes 0x00 0xff so the
// escaped form still sorts like the raw content.
fn encode_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for b in bytes {
        out.push(*b);
        if *b == 0x00 {
            out.push(ESCAPE);
        }
    }
    out.push(0x00);
}

fn decode_escaped(data: &[u8], offset: &mut usize) -> Result<Vec<u8>, KvError> {
    let mut out = Vec::new();
    loop {
        let b = *data
            .get(*offset)
            .ok_or_else(|| KvError::Corrupt("unterminated byte segment".into()))?;
        *offset += 1;
        if b != 0x00 {
            out.push(b);
            continue;
        }
        // 0x00 0xff is an escaped zero byte; bare 0x00 terminates.
        if data.get(*offset) == Some(&ESCAPE) {
            *offset += 1;
            out.push(0x00);
        } else {
            return Ok(out);
        }
    }
}

// Integers encode as TAG_INT_ZERO +/- byte-length, then the magnitude
// big-endian (one's-complemented for negatives). Shorter negatives get
// smaller tags and longer positives larger ones, preserving order.
fn encode_int(out: &mut Vec<u8>, value: i64) {
    if value == 0 {
        out.push(TAG_INT_ZERO);
        return;
    }
    if value > 0 {
        let be = (value as u64).to_be_bytes();
        let skip = be.iter().take_while(|b| **b == 0).count();
        out.push(TAG_INT_ZERO + (8 - skip) as u8);
        out.extend_from_slice(&be[skip..]);
    } else {
        let magnitude = (value as i128).unsigned_abs();
        let mut len = 1usize;
        while len < 8 && magnitude > (1u128 << (8 * len)) - 1 {
            len += 1;
        }
        let bound = (1u128 << (8 * len)) - 1;
        let encoded = (bound - magnitude) as u64;
        let be = encoded.to_be_bytes();
        out.push(TAG_INT_ZERO - len as u8);
        out.extend_from_slice(&be[8 - len..]);
    }
}

fn decode_int(tag: u8, data: &[u8], offset: &mut usize) -> Result<Segment, KvError> {
    if tag == TAG_INT_ZERO {
        return Ok(Segment::Int(0));
    }
    let negative = tag < TAG_INT_ZERO;
    let len = if negative {
        (TAG_INT_ZERO - tag) as usize
    } else {
        (tag - TAG_INT_ZERO) as usize
    };
    if *offset + len > data.len() {
        return Err(KvError::Corrupt("truncated integer segment".into()));
    }
    let mut be = [0u8; 8];
    be[8 - len..].copy_from_slice(&data[*offset..*offset + len]);
    *offset += len;
    let raw = u64::from_be_bytes(be);
    let value = if negative {
        let bound = (1u128 << (8 * len)) - 1;
        let magnitude = bound - raw as u128;
        let signed = -(magnitude as i128);
        i64::try_from(signed)
            .map_err(|_| KvError::Corrupt("integer segment out of range".into()))?
    } else {
        i64::try_from(raw)
            .map_err(|_| KvError::Corrupt("integer segment out of range".into()))?
    };
    Ok(Segment::Int(value))
}
