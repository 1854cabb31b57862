//! VarInt-encoded sink/source streams and multiplexed stream sets.
//!
//! Small, composable `Read`/`Write`-like traits with default method bodies,
//! rather than a monolithic codec struct.

use anyhow::{ensure, Result};
use std::io::Write;

/// Maximum number of streams a [`SinkStreamSet`]/[`SourceStreamSet`] may hold,
/// bounding pathological headers.
pub const MAX_STREAM_COUNT: usize = 256;

/// Zig-zag maps a signed integer to an unsigned one: `n >= 0 => 2n`,
/// `n < 0 => 2|n| - 1`.
#[inline]
fn zigzag_encode(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline]
fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// A growing byte buffer with VarInt-aware write helpers.
#[derive(Debug, Default, Clone)]
pub struct SinkStream {
    data: Vec<u8>,
}

impl SinkStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.data.push(value as u8);
    }

    /// Writes `value` as a little-endian base-128 VarInt: seven payload bits
    /// per byte, high bit set while more bytes follow.
    pub fn write_varint_u32(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.data.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.data.push(value as u8);
    }

    pub fn write_varint_u64(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.data.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.data.push(value as u8);
    }

    pub fn write_varint_i32(&mut self, value: i32) {
        self.write_varint_u32(zigzag_encode(value));
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A bounds-checked cursor over a byte slice with VarInt-aware read helpers.
#[derive(Debug, Clone, Copy)]
pub struct SourceStream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SourceStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SourceStream { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        ensure!(self.remaining() >= 1, "SourceStream: read past end (u8)");
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Decodes a VarInt, rejecting encodings that would overflow `u32`.
    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let mut shift: u32 = 0;
        let mut val: u32 = 0;
        loop {
            let byte = self.read_u8()?;
            if shift >= 32 {
                ensure!(byte <= 0x0F, "SourceStream: VarInt u32 overflow");
            }
            val |= (u32::from(byte & 0x7F)) << shift.min(31);
            if byte < 0x80 {
                return Ok(val);
            }
            shift += 7;
            ensure!(shift < 40, "SourceStream: VarInt u32 too long");
        }
    }

    pub fn read_varint_u64(&mut self) -> Result<u64> {
        let mut shift: u32 = 0;
        let mut val: u64 = 0;
        loop {
            let byte = self.read_u8()?;
            val |= (u64::from(byte & 0x7F)) << shift;
            if byte < 0x80 {
                return Ok(val);
            }
            shift += 7;
            ensure!(shift < 70, "SourceStream: VarInt u64 too long");
        }
    }

    pub fn read_varint_i32(&mut self) -> Result<i32> {
        Ok(zigzag_decode(self.read_varint_u32()?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(self.remaining() >= n, "SourceStream: read past end (bytes)");
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        ensure!(self.remaining() >= n, "SourceStream: skip past end");
        self.pos += n;
        Ok(())
    }
}

/// Owns up to [`MAX_STREAM_COUNT`] independently-growing sink buffers indexed
/// by a small integer key (the `PatchField` stream IDs).
#[derive(Debug, Default)]
pub struct SinkStreamSet {
    streams: Vec<SinkStream>,
}

impl SinkStreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a mutable handle to the stream identified by `key`, creating
    /// it (and any lower-indexed gaps) on first use.
    pub fn get(&mut self, key: usize) -> &mut SinkStream {
        if key >= self.streams.len() {
            self.streams.resize_with(key + 1, SinkStream::new);
        }
        &mut self.streams[key]
    }

    /// Serializes all streams into `out`: stream count, then each stream's
    /// size, then each stream's bytes, all VarInt-framed.
    pub fn serialize(&self, out: &mut SinkStream) -> Result<()> {
        ensure!(
            self.streams.len() <= MAX_STREAM_COUNT,
            "SinkStreamSet: too many streams"
        );
        out.write_varint_u32(self.streams.len() as u32);
        for s in &self.streams {
            out.write_varint_u32(s.len() as u32);
        }
        for s in &self.streams {
            out.write_bytes(s.bytes());
        }
        Ok(())
    }

    /// Convenience: serializes into a fresh owned `Vec<u8>`.
    pub fn serialize_to_vec(&self) -> Result<Vec<u8>> {
        let mut sink = SinkStream::new();
        self.serialize(&mut sink)?;
        Ok(sink.into_bytes())
    }
}

/// Reparses the layout written by [`SinkStreamSet::serialize`], returning
/// substream views over the input byte range without copying.
#[derive(Debug, Default)]
pub struct SourceStreamSet<'a> {
    substreams: Vec<&'a [u8]>,
}

impl<'a> SourceStreamSet<'a> {
    /// Parses the framing header out of `src` and slices up the remaining
    /// bytes into per-stream views.
    pub fn init(src: &mut SourceStream<'a>) -> Result<Self> {
        let count = src.read_varint_u32()? as usize;
        ensure!(
            count <= MAX_STREAM_COUNT,
            "SourceStreamSet: declared stream count exceeds maximum"
        );
        let mut sizes = Vec::with_capacity(count);
        for _ in 0..count {
            sizes.push(src.read_varint_u32()? as usize);
        }
        let mut substreams = Vec::with_capacity(count);
        for size in sizes {
            substreams.push(src.read_bytes(size)?);
        }
        Ok(SourceStreamSet { substreams })
    }

    pub fn count(&self) -> usize {
        self.substreams.len()
    }

    /// Returns the substream identified by `key`. Missing keys yield an empty
    /// stream rather than panicking, since callers (e.g. a pool with no
    /// extra labels) routinely probe keys past the declared count.
    pub fn get(&self, key: usize) -> SourceStream<'a> {
        match self.substreams.get(key) {
            Some(bytes) => SourceStream::new(bytes),
            None => SourceStream::new(&[]),
        }
    }
}

/// Writes `writer`'s output preceded by nothing; helper used by the CLI to
/// flush a fully-built [`SinkStreamSet`] straight to a file handle.
pub fn write_all(writer: &mut impl Write, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x0000_007F, &[0x7F])]
    #[case(0x0000_0080, &[0x80, 0x01])]
    #[case(0x0000_3FFF, &[0xFF, 0x7F])]
    #[case(0xFFFF_FFFF, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F])]
    fn varint_u32_matches_scenario_3(#[case] value: u32, #[case] expected: &[u8]) {
        let mut sink = SinkStream::new();
        sink.write_varint_u32(value);
        assert_eq!(sink.bytes(), expected);

        let mut src = SourceStream::new(sink.bytes());
        assert_eq!(src.read_varint_u32().unwrap(), value);
        assert!(src.is_empty());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(127)]
    #[case(128)]
    #[case(u32::MAX / 2)]
    #[case(u32::MAX)]
    fn varint_u32_roundtrip(#[case] value: u32) {
        let mut sink = SinkStream::new();
        sink.write_varint_u32(value);
        let mut src = SourceStream::new(sink.bytes());
        assert_eq!(src.read_varint_u32().unwrap(), value);
    }

    #[test]
    fn varint_u32_length_matches_spec_bounds() {
        let mut small = SinkStream::new();
        small.write_varint_u32(127);
        assert_eq!(small.len(), 1);

        let mut big = SinkStream::new();
        big.write_varint_u32(1u32 << 28);
        assert_eq!(big.len(), 5);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(-1)]
    #[case(i32::MAX)]
    #[case(i32::MIN)]
    fn varint_i32_roundtrip(#[case] value: i32) {
        let mut sink = SinkStream::new();
        sink.write_varint_i32(value);
        let mut src = SourceStream::new(sink.bytes());
        assert_eq!(src.read_varint_i32().unwrap(), value);
    }

    #[test]
    fn varint_i32_same_magnitude_same_length() {
        for v in [1i32, 63, 1000, 1_000_000] {
            let mut pos = SinkStream::new();
            pos.write_varint_i32(v);
            let mut neg = SinkStream::new();
            neg.write_varint_i32(-v);
            assert_eq!(pos.len(), neg.len());
        }
    }

    #[test]
    fn source_stream_fails_past_end() {
        let mut src = SourceStream::new(&[0x80]);
        assert!(src.read_varint_u32().is_err());
    }

    #[test]
    fn stream_set_roundtrip() {
        let mut sinks = SinkStreamSet::new();
        sinks.get(0).write_bytes(b"hello");
        sinks.get(3).write_varint_u32(42);
        let serialized = sinks.serialize_to_vec().unwrap();

        let mut src = SourceStream::new(&serialized);
        let set = SourceStreamSet::init(&mut src).unwrap();
        assert_eq!(set.count(), 4);
        assert_eq!(set.get(0).read_bytes(5).unwrap(), b"hello");
        assert_eq!(set.get(3).read_varint_u32().unwrap(), 42);
        assert!(set.get(1).is_empty());
        // Probing a key past the declared count yields an empty stream.
        assert!(set.get(99).is_empty());
    }

    #[test]
    fn stream_set_rejects_oversized_header() {
        let mut sink = SinkStream::new();
        sink.write_varint_u32(MAX_STREAM_COUNT as u32 + 1);
        let mut src = SourceStream::new(sink.bytes());
        assert!(SourceStreamSet::init(&mut src).is_err());
    }
}
