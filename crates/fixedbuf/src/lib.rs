//! Capacity-bounded encode buffer for fixed-maximum wire frames.
//!
//! A BGP message may never exceed 4096 bytes, so every encoder in this
//! workspace writes through a `WireBuf` sized to the frame limit: a write
//! that would cross the cap fails instead of growing the allocation, which
//! is what lets callers detect "this batch no longer fits" and split it.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireBufError {
    #[error("frame limit exceeded: {need} bytes wanted, {room} left of {cap}")]
    Full { need: usize, room: usize, cap: usize },
    #[error("patch offset {at} past end of written data ({len} bytes)")]
    BadPatch { at: usize, len: usize },
}

/// Append-only buffer that refuses to grow past `cap`.
///
/// Length fields that are only known once the payload is written are
/// handled with [`WireBuf::mark`] + [`WireBuf::patch_u16`]: reserve the
/// slot, write the payload, then patch the recorded offset.
pub struct WireBuf {
    bytes: BytesMut,
    cap: usize,
}

impl WireBuf {
    pub fn new(cap: usize) -> Self {
        Self { bytes: BytesMut::with_capacity(cap), cap }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn room(&self) -> usize {
        self.cap - self.bytes.len()
    }

    /// Whether `extra` more bytes would still fit under the frame limit.
    pub fn fits(&self, extra: usize) -> bool {
        extra <= self.room()
    }

    fn claim(&mut self, need: usize) -> Result<(), WireBufError> {
        if need > self.room() {
            return Err(WireBufError::Full { need, room: self.room(), cap: self.cap });
        }
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), WireBufError> {
        self.claim(1)?;
        self.bytes.put_u8(v);
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), WireBufError> {
        self.claim(2)?;
        self.bytes.put_u16(v);
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), WireBufError> {
        self.claim(4)?;
        self.bytes.put_u32(v);
        Ok(())
    }

    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), WireBufError> {
        self.claim(src.len())?;
        self.bytes.put_slice(src);
        Ok(())
    }

    /// Current write position, for a later [`WireBuf::patch_u16`].
    pub fn mark(&self) -> usize {
        self.bytes.len()
    }

    /// Overwrites two already-written bytes at `at` with `v` (big-endian).
    pub fn patch_u16(&mut self, at: usize, v: u16) -> Result<(), WireBufError> {
        if at + 2 > self.bytes.len() {
            return Err(WireBufError::BadPatch { at, len: self.bytes.len() });
        }
        BigEndian::write_u16(&mut self.bytes[at..], v);
        Ok(())
    }

    pub fn freeze(self) -> BytesMut {
        self.bytes
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_up_to_cap_then_fails() {
        let mut buf = WireBuf::new(4);
        buf.put_u16(0xbeef).unwrap();
        assert!(buf.fits(2));
        buf.put_u16(0xcafe).unwrap();
        assert!(!buf.fits(1));
        assert!(matches!(buf.put_u8(1), Err(WireBufError::Full { need: 1, room: 0, cap: 4 })));
    }

    #[test]
    fn mark_and_patch_backfills_a_length_field() {
        let mut buf = WireBuf::new(64);
        let at = buf.mark();
        buf.put_u16(0).unwrap();
        buf.put_slice(b"abcde").unwrap();
        buf.patch_u16(at, 5).unwrap();
        assert_eq!(&buf.as_slice()[..2], &[0, 5]);
    }

    #[test]
    fn patch_past_end_is_rejected() {
        let mut buf = WireBuf::new(8);
        buf.put_u8(1).unwrap();
        assert!(matches!(buf.patch_u16(0, 7), Err(WireBufError::BadPatch { at: 0, len: 1 })));
    }
}
