//! Memory-resident frames source.

use bytes::Bytes;

use crate::error::{MuxError, Result};
use crate::frames::{FrameRead, FramesSource};
use crate::media::InputFrame;

/// Serves frames out of a resident buffer; the whole frame is returned by a
/// single `read`.
pub struct MemoryFramesSource {
    data: Bytes,
    cur: Option<(u64, u32)>,
}

impl MemoryFramesSource {
    pub fn new(data: Bytes) -> Self {
        Self { data, cur: None }
    }
}

impl FramesSource for MemoryFramesSource {
    fn start_frame(&mut self, frame: &InputFrame, _min_offset_hint: u64) -> Result<()> {
        let end = frame.offset + frame.size as u64;
        if end > self.data.len() as u64 {
            return Err(MuxError::BadData(format!(
                "frame range {}..{} exceeds buffer of {} bytes",
                frame.offset,
                end,
                self.data.len()
            )));
        }
        self.cur = Some((frame.offset, frame.size));
        Ok(())
    }

    fn read(&mut self) -> Result<FrameRead> {
        let (offset, size) = self.cur.take().ok_or_else(|| {
            MuxError::Unexpected("read without a started frame".to_string())
        })?;
        Ok(FrameRead::Data {
            data: self.data.slice(offset as usize..(offset + size as u64) as usize),
            frame_done: true,
        })
    }
}
