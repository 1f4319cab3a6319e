//! ADTS framing for AAC audio.
//!
//! Prepends a 7-byte ADTS header to every AAC access unit, derived from the
//! track's AudioSpecificConfig extradata.

use crate::error::{MuxError, Result};
use crate::filter::{FrameFilter, OutputFrame};
use crate::media::MediaInfo;
use crate::queue::WriteBufferQueue;

pub const ADTS_HEADER_SIZE: usize = 7;

/// AAC stream filter; generic over its downstream so the same filter feeds
/// either the frame joiner or the delay-bounded buffer.
pub struct AdtsEncoder<D> {
    pub(crate) next: D,
    header: [u8; ADTS_HEADER_SIZE],
    configured: bool,
}

impl<D> AdtsEncoder<D> {
    pub fn new(next: D) -> Self {
        Self {
            next,
            header: [0u8; ADTS_HEADER_SIZE],
            configured: false,
        }
    }

    pub fn set_media_info(&mut self, info: &MediaInfo) -> Result<()> {
        let asc = &info.extradata;
        if asc.len() < 2 {
            return Err(MuxError::InvalidMedia(
                "missing AudioSpecificConfig for AAC track".to_string(),
            ));
        }

        let object_type = asc[0] >> 3;
        if object_type == 0 || object_type == 31 {
            return Err(MuxError::InvalidMedia(format!(
                "unsupported AAC object type {}",
                object_type
            )));
        }
        let freq_index = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
        let channel_config = (asc[1] >> 3) & 0x0F;

        // syncword, MPEG-4, layer 0, no CRC
        self.header[0] = 0xFF;
        self.header[1] = 0xF1;
        self.header[2] =
            ((object_type - 1) & 0x03) << 6 | (freq_index & 0x0F) << 2 | (channel_config >> 2);
        self.header[3] = (channel_config & 0x03) << 6;
        self.header[4] = 0x00;
        self.header[5] = 0x1F; // buffer fullness all-ones (VBR)
        self.header[6] = 0xFC;
        self.configured = true;
        Ok(())
    }

    fn frame_header(&self, payload_size: u32) -> [u8; ADTS_HEADER_SIZE] {
        let total = payload_size + ADTS_HEADER_SIZE as u32;
        let mut header = self.header;
        header[3] |= ((total >> 11) & 0x03) as u8;
        header[4] = ((total >> 3) & 0xFF) as u8;
        header[5] |= (((total & 0x07) as u8) << 5) & 0xE0;
        header
    }
}

impl<D: FrameFilter> FrameFilter for AdtsEncoder<D> {
    fn start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) -> Result<()> {
        if !self.configured {
            return Err(MuxError::Unexpected(
                "ADTS encoder used before set_media_info".to_string(),
            ));
        }
        let mut out = frame.clone();
        out.size += ADTS_HEADER_SIZE as u32;
        out.header_size = ADTS_HEADER_SIZE as u32;
        self.next.start_frame(q, &out)?;
        let header = self.frame_header(frame.size);
        self.next.write(q, &header)
    }

    fn write(&mut self, q: &mut WriteBufferQueue, data: &[u8]) -> Result<()> {
        self.next.write(q, data)
    }

    fn flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()> {
        self.next.flush_frame(q, last)
    }

    fn simulated_start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) {
        let mut out = frame.clone();
        out.size += ADTS_HEADER_SIZE as u32;
        out.header_size = ADTS_HEADER_SIZE as u32;
        self.next.simulated_start_frame(q, &out);
        self.next.simulated_write(q, ADTS_HEADER_SIZE as u32);
    }

    fn simulated_write(&mut self, q: &mut WriteBufferQueue, size: u32) {
        self.next.simulated_write(q, size);
    }

    fn simulated_flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) {
        self.next.simulated_flush_frame(q, last);
    }
}
