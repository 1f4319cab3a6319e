//! Timed-metadata passthrough.
//!
//! The synthetic ID3 stream carries one pre-rendered JSON payload per
//! segment; this filter only forwards it to the metadata PID's packetizer,
//! keeping the chain shape uniform with the media streams.

use crate::error::Result;
use crate::filter::mpegts::MpegtsEncoder;
use crate::filter::{FrameFilter, OutputFrame};
use crate::queue::WriteBufferQueue;

pub struct Id3Encoder {
    pub(crate) next: MpegtsEncoder,
}

impl Id3Encoder {
    pub fn new(next: MpegtsEncoder) -> Self {
        Self { next }
    }
}

impl FrameFilter for Id3Encoder {
    fn start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) -> Result<()> {
        self.next.start_frame(q, frame)
    }

    fn write(&mut self, q: &mut WriteBufferQueue, data: &[u8]) -> Result<()> {
        self.next.write(q, data)
    }

    fn flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()> {
        self.next.flush_frame(q, last)
    }

    fn simulated_start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) {
        self.next.simulated_start_frame(q, frame);
    }

    fn simulated_write(&mut self, q: &mut WriteBufferQueue, size: u32) {
        self.next.simulated_write(q, size);
    }

    fn simulated_flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) {
        self.next.simulated_flush_frame(q, last);
    }
}
