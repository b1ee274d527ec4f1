//! Shared record definition for the demo producer / consumer / admin trio.
//!
//! Every process on the channel must agree on this layout byte-for-byte;
//! the channel header's record-size check rejects a mismatched build.

#![allow(dead_code)]

use nanobroker::FixedStr;

pub const MAX_WIDTH: usize = 640;
pub const MAX_HEIGHT: usize = 480;
pub const CHANNELS: usize = 3;
pub const MAX_PIXELS: usize = MAX_WIDTH * MAX_HEIGHT * CHANNELS;

/// Default topic shared by the demo binaries.
pub const TOPIC: &str = "video-stream";

/// Ring depth of the demo channel.
pub const RING_SLOTS: usize = 8;

/// One synthetic camera frame, written in place into a ring slot.
///
/// No heap pointers: the pixel payload and the format tag are inline, so
/// the record is trivially relocatable across the shared-memory boundary.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct VideoFrame {
    pub producer_id: u32,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub frame_id: u64,
    pub timestamp_ns: i64,
    pub data_len: u64,
    pub format: FixedStr<16>,
    pub pixels: [u8; MAX_PIXELS],
}
