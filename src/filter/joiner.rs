//! Audio frame joining.
//!
//! Concatenates successive audio frames whose DTS continues exactly where
//! the previous frame ended into a single PES payload, closing the PES on a
//! timestamp gap, when the payload budget is reached, or at end of stream.

use crate::error::Result;
use crate::filter::mpegts::MpegtsEncoder;
use crate::filter::{FrameFilter, OutputFrame, DEFAULT_PES_PAYLOAD_SIZE};
use crate::queue::WriteBufferQueue;

pub struct FrameJoiner {
    pub(crate) next: MpegtsEncoder,
    pes_open: bool,
    expected_dts: u64,
    accumulated: u32,
}

impl FrameJoiner {
    pub fn new(next: MpegtsEncoder) -> Self {
        Self {
            next,
            pes_open: false,
            expected_dts: 0,
            accumulated: 0,
        }
    }

    fn continues_pes(&self, frame: &OutputFrame) -> bool {
        self.pes_open
            && frame.dts == self.expected_dts
            && self.accumulated < DEFAULT_PES_PAYLOAD_SIZE as u32
    }

    fn note_frame(&mut self, frame: &OutputFrame) {
        self.expected_dts = frame.dts + frame.duration as u64;
        self.accumulated += frame.size;
    }

    pub(crate) fn reset(&mut self) {
        self.pes_open = false;
        self.expected_dts = 0;
        self.accumulated = 0;
    }
}

impl FrameFilter for FrameJoiner {
    fn start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) -> Result<()> {
        if !self.continues_pes(frame) {
            if self.pes_open {
                self.next.flush_frame(q, false)?;
            }
            self.next.start_frame(q, frame)?;
            self.pes_open = true;
            self.accumulated = 0;
        }
        self.note_frame(frame);
        Ok(())
    }

    fn write(&mut self, q: &mut WriteBufferQueue, data: &[u8]) -> Result<()> {
        self.next.write(q, data)
    }

    fn flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()> {
        // the PES stays open across frames; only end of stream closes it
        if last {
            self.next.flush_frame(q, true)?;
            self.pes_open = false;
        }
        Ok(())
    }

    fn simulated_start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) {
        if !self.continues_pes(frame) {
            if self.pes_open {
                self.next.simulated_flush_frame(q, false);
            }
            self.next.simulated_start_frame(q, frame);
            self.pes_open = true;
            self.accumulated = 0;
        }
        self.note_frame(frame);
    }

    fn simulated_write(&mut self, q: &mut WriteBufferQueue, size: u32) {
        self.next.simulated_write(q, size);
    }

    fn simulated_flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) {
        if last {
            self.next.simulated_flush_frame(q, true);
            self.pes_open = false;
        }
    }
}
