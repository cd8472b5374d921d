//! Length-prefixed wire frame codec (original §6).
//!
//! ```text
//! offset 0   int32  frameSize  (total bytes, >= 16)
//! offset 4   int32  flags      (bit 0 = COMPLETE; others reserved)
//! offset 8   int64  callId     (< 0 = one-way/benchmark)
//! offset 16  byte[] payload    (frameSize - 16 bytes)
//! ```

use crate::buffer::IoBuffer;
use crate::Error;

/// Total header size in bytes; the minimum legal `frameSize`.
pub const HEADER_LEN: usize = 16;

/// `flags` bit 0: the frame has been fully constructed and is safe to send.
pub const FLAG_COMPLETE: i32 = 1;

/// Decoded frame header, paired with a borrow of its payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: i32,
    pub flags: i32,
    pub call_id: i64,
}

impl FrameHeader {
    /// `true` when this frame carries no correlation (one-way/benchmark).
    pub fn is_one_way(&self) -> bool {
        self.call_id < 0
    }

    pub fn is_complete(&self) -> bool {
        self.flags & FLAG_COMPLETE != 0
    }

    pub fn payload_len(&self) -> usize {
        self.size as usize - HEADER_LEN
    }
}

/// Patches the size prefix with the buffer's current write position and
/// sets the `COMPLETE` flag. Must be called before handing a buffer to a
/// socket's `write`/`write_and_flush` (original §4.2).
pub fn construct_complete(buf: &IoBuffer) {
    let size = buf.position();
    buf.patch_i32(0, size as i32);
    buf.patch_i32(4, FLAG_COMPLETE);
}

/// Writes a complete frame header into a freshly-allocated buffer, leaving
/// `position` at offset 16 ready for the caller to append a payload. Call
/// [`construct_complete`] once the payload has been written.
pub fn begin_frame(buf: &IoBuffer, call_id: i64) {
    buf.clear();
    buf.write_i32(0); // size: patched by construct_complete
    buf.write_i32(0); // flags: patched by construct_complete
    buf.write_i64(call_id);
}

/// Attempts to decode one frame from the front of `bytes`.
///
/// Returns:
/// - `Ok(None)` when `bytes` doesn't yet hold a complete frame (the decoder
///   never consumes a partial frame, original §6, §8).
/// - `Ok(Some((header, payload, consumed)))` on success.
/// - `Err(Error::Protocol(_))` when the header is malformed (original §7).
pub fn decode(bytes: &[u8], max_frame_size: usize) -> crate::Result<Option<(FrameHeader, &[u8], usize)>> {
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }

    let size = i32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if size < HEADER_LEN as i32 {
        return Err(Error::Protocol("frame size smaller than header"));
    }
    if size as usize > max_frame_size {
        return Err(Error::Protocol("frame size exceeds configured maximum"));
    }

    let size = size as usize;
    if bytes.len() < size {
        return Ok(None);
    }

    let flags = i32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let call_id = i64::from_be_bytes(bytes[8..16].try_into().unwrap());
    let payload = &bytes[HEADER_LEN..size];

    Ok(Some((
        FrameHeader {
            size: size as i32,
            flags,
            call_id,
        },
        payload,
        size,
    )))
}
