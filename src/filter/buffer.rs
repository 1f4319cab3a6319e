//! Delay-bounded audio batching.
//!
//! Accumulates audio frames into one PES payload until the payload budget
//! is reached, end of stream arrives, or the scheduler force-flushes because
//! the buffered audio lags the current video DTS by more than half the
//! muxing delay.

use bytes::BytesMut;

use crate::error::Result;
use crate::filter::mpegts::MpegtsEncoder;
use crate::filter::{FrameFilter, OutputFrame, DEFAULT_PES_PAYLOAD_SIZE};
use crate::queue::WriteBufferQueue;

pub struct BufferFilter {
    pub(crate) next: MpegtsEncoder,
    max_size: usize,
    /// Materialized payload; unused by the simulated surface.
    data: BytesMut,
    /// Byte count, tracked by both surfaces.
    pending_size: usize,
    first_frame: Option<OutputFrame>,
}

impl BufferFilter {
    pub fn new(next: MpegtsEncoder) -> Self {
        Self {
            next,
            max_size: DEFAULT_PES_PAYLOAD_SIZE,
            data: BytesMut::new(),
            pending_size: 0,
            first_frame: None,
        }
    }

    /// DTS of the oldest buffered frame, if anything is buffered.
    pub fn get_dts(&self) -> Option<u64> {
        self.first_frame.as_ref().map(|frame| frame.dts)
    }

    /// Close the current PES regardless of the payload budget.
    pub fn force_flush(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()> {
        self.flush_pending(q, last, true)
    }

    /// Simulation twin of [`force_flush`](Self::force_flush).
    pub fn simulated_force_flush(&mut self, q: &mut WriteBufferQueue, last: bool) {
        // the simulated path only does layout arithmetic and cannot fail
        let _ = self.flush_pending(q, last, false);
    }

    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.pending_size = 0;
        self.first_frame = None;
    }

    fn flush_pending(&mut self, q: &mut WriteBufferQueue, last: bool, real: bool) -> Result<()> {
        match self.first_frame.take() {
            Some(first) => {
                let mut out = first;
                out.size = self.pending_size as u32;
                if real {
                    let payload = self.data.split();
                    self.next.start_frame(q, &out)?;
                    self.next.write(q, &payload)?;
                    self.next.flush_frame(q, last)?;
                } else {
                    self.next.simulated_start_frame(q, &out);
                    self.next.simulated_write(q, self.pending_size as u32);
                    self.next.simulated_flush_frame(q, last);
                }
                self.pending_size = 0;
            }
            None if last => {
                if real {
                    self.next.flush_frame(q, true)?;
                } else {
                    self.next.simulated_flush_frame(q, true);
                }
            }
            None => {}
        }
        Ok(())
    }
}

impl FrameFilter for BufferFilter {
    fn start_frame(&mut self, _q: &mut WriteBufferQueue, frame: &OutputFrame) -> Result<()> {
        if self.first_frame.is_none() {
            self.first_frame = Some(frame.clone());
        }
        Ok(())
    }

    fn write(&mut self, _q: &mut WriteBufferQueue, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        self.pending_size += data.len();
        Ok(())
    }

    fn flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()> {
        if self.pending_size >= self.max_size || last {
            self.flush_pending(q, last, true)?;
        }
        Ok(())
    }

    fn simulated_start_frame(&mut self, _q: &mut WriteBufferQueue, frame: &OutputFrame) {
        if self.first_frame.is_none() {
            self.first_frame = Some(frame.clone());
        }
    }

    fn simulated_write(&mut self, _q: &mut WriteBufferQueue, size: u32) {
        self.pending_size += size as usize;
    }

    fn simulated_flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) {
        if self.pending_size >= self.max_size || last {
            let _ = self.flush_pending(q, last, false);
        }
    }
}
