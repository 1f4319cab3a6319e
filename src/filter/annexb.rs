//! H.264/HEVC length-prefixed to AnnexB conversion.
//!
//! Rewrites the 4-byte NAL length prefixes of MP4-style video payloads into
//! `00 00 00 01` start codes as the bytes stream through, injecting an
//! access unit delimiter at every frame start and the parameter sets in
//! front of key frames.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MuxError, Result};
use crate::filter::mpegts::MpegtsEncoder;
use crate::filter::{FrameFilter, OutputFrame};
use crate::media::MediaInfo;
use crate::queue::WriteBufferQueue;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const AUD_NAL: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

/// Parameter sets and NAL length size parsed out of an avcC box.
struct AvcConfig {
    parameter_sets: Bytes,
    nal_size_len: usize,
}

fn parse_avcc(extradata: &[u8]) -> Result<AvcConfig> {
    if extradata.len() < 7 || extradata[0] != 1 {
        return Err(MuxError::InvalidMedia(
            "video extradata is not an avcC configuration record".to_string(),
        ));
    }

    let nal_size_len = (extradata[4] & 0x03) as usize + 1;
    let mut sets = BytesMut::new();
    let mut pos = 5;

    let sps_count = (extradata[pos] & 0x1F) as usize;
    pos += 1;
    for _ in 0..sps_count {
        pos = copy_parameter_set(extradata, pos, &mut sets)?;
    }

    if pos >= extradata.len() {
        return Err(MuxError::InvalidMedia("avcC truncated before PPS".to_string()));
    }
    let pps_count = extradata[pos] as usize;
    pos += 1;
    for _ in 0..pps_count {
        pos = copy_parameter_set(extradata, pos, &mut sets)?;
    }

    Ok(AvcConfig {
        parameter_sets: sets.freeze(),
        nal_size_len,
    })
}

fn copy_parameter_set(data: &[u8], pos: usize, out: &mut BytesMut) -> Result<usize> {
    if pos + 2 > data.len() {
        return Err(MuxError::InvalidMedia("avcC truncated".to_string()));
    }
    let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    let start = pos + 2;
    if start + len > data.len() {
        return Err(MuxError::InvalidMedia("avcC parameter set truncated".to_string()));
    }
    out.put_slice(&START_CODE);
    out.put_slice(&data[start..start + len]);
    Ok(start + len)
}

/// Video stream filter: length-prefixed NAL units in, AnnexB out.
pub struct Mp4ToAnnexb {
    pub(crate) next: MpegtsEncoder,
    parameter_sets: Bytes,
    nal_size_len: usize,
    // scan state across write chunks
    len_acc: u32,
    len_bytes: usize,
    nal_remaining: u32,
}

impl Mp4ToAnnexb {
    pub fn new(next: MpegtsEncoder) -> Self {
        Self {
            next,
            parameter_sets: Bytes::new(),
            nal_size_len: 4,
            len_acc: 0,
            len_bytes: 0,
            nal_remaining: 0,
        }
    }

    pub fn set_media_info(&mut self, info: &MediaInfo) -> Result<()> {
        let config = parse_avcc(&info.extradata)?;
        self.parameter_sets = config.parameter_sets;
        self.nal_size_len = config.nal_size_len;
        Ok(())
    }

    /// Whether segment sizes for this track can be computed without reading
    /// frame bytes: start codes must replace the length prefixes one for
    /// one, so the NAL length field has to be 4 bytes wide.
    pub fn simulation_supported(info: &MediaInfo) -> bool {
        match parse_avcc(&info.extradata) {
            Ok(config) => config.nal_size_len == 4,
            Err(_) => false,
        }
    }

    fn frame_overhead(&self, key: bool) -> usize {
        AUD_NAL.len() + if key { self.parameter_sets.len() } else { 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.len_acc = 0;
        self.len_bytes = 0;
        self.nal_remaining = 0;
    }
}

impl FrameFilter for Mp4ToAnnexb {
    fn start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) -> Result<()> {
        let overhead = self.frame_overhead(frame.key);
        let mut out = frame.clone();
        out.size += overhead as u32;
        out.header_size = overhead as u32;
        self.next.start_frame(q, &out)?;

        self.next.write(q, &AUD_NAL)?;
        if frame.key {
            let sets = self.parameter_sets.clone();
            self.next.write(q, &sets)?;
        }

        self.reset();
        Ok(())
    }

    fn write(&mut self, q: &mut WriteBufferQueue, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            if self.nal_remaining == 0 {
                // accumulate the NAL length prefix, possibly across chunks
                while self.len_bytes < self.nal_size_len && pos < data.len() {
                    self.len_acc = (self.len_acc << 8) | data[pos] as u32;
                    self.len_bytes += 1;
                    pos += 1;
                }
                if self.len_bytes < self.nal_size_len {
                    break;
                }
                self.nal_remaining = self.len_acc;
                self.len_acc = 0;
                self.len_bytes = 0;
                self.next.write(q, &START_CODE)?;
                continue;
            }

            let take = (self.nal_remaining as usize).min(data.len() - pos);
            self.next.write(q, &data[pos..pos + take])?;
            self.nal_remaining -= take as u32;
            pos += take;
        }
        Ok(())
    }

    fn flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()> {
        if self.nal_remaining != 0 || self.len_bytes != 0 {
            return Err(MuxError::BadData(format!(
                "frame ended inside a NAL unit ({} bytes missing)",
                self.nal_remaining
            )));
        }
        self.next.flush_frame(q, last)
    }

    fn simulated_start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) {
        let overhead = self.frame_overhead(frame.key);
        let mut out = frame.clone();
        out.size += overhead as u32;
        out.header_size = overhead as u32;
        self.next.simulated_start_frame(q, &out);
        self.next.simulated_write(q, overhead as u32);
    }

    fn simulated_write(&mut self, q: &mut WriteBufferQueue, size: u32) {
        // size-neutral: 4-byte length prefixes become 4-byte start codes
        self.next.simulated_write(q, size);
    }

    fn simulated_flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) {
        self.next.simulated_flush_frame(q, last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::mpegts::InitStreamsState;
    use crate::media::{CodecId, MediaType};
    use crate::queue::{SegmentSink, WriteCallback, WriteStatus};
    use std::sync::{Arc, Mutex};

    fn test_avcc() -> Bytes {
        // avcC with one 4-byte SPS and one 2-byte PPS, 4-byte NAL lengths
        let mut data = vec![0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1];
        data.extend_from_slice(&[0x00, 0x04, 0x67, 0x64, 0x00, 0x1F]);
        data.push(0x01);
        data.extend_from_slice(&[0x00, 0x02, 0x68, 0xEE]);
        Bytes::from(data)
    }

    fn media_info(extradata: Bytes) -> MediaInfo {
        MediaInfo {
            media_type: MediaType::Video,
            codec_id: CodecId::H264,
            duration_millis: 4000,
            bitrate: 1_000_000,
            extradata,
            width: 1280,
            height: 720,
            sample_rate: 0,
            channels: 0,
            language: None,
            label: None,
        }
    }

    fn filter() -> (Mp4ToAnnexb, WriteBufferQueue, Arc<Mutex<Vec<u8>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink_out = Arc::clone(&out);
        let callback: WriteCallback = Box::new(move |buf| {
            sink_out.lock().unwrap().extend_from_slice(&buf);
            Ok(WriteStatus::Done)
        });
        let q = WriteBufferQueue::new(SegmentSink::plain(callback));

        let mut init = InitStreamsState::new(0);
        let info = init.add_stream(Some(MediaType::Video), Some(CodecId::H264));
        let encoder = MpegtsEncoder::new(info, Some(MediaType::Video), true, true);
        let mut annexb = Mp4ToAnnexb::new(encoder);
        annexb.set_media_info(&media_info(test_avcc())).unwrap();
        (annexb, q, out)
    }

    #[test]
    fn test_parse_avcc() {
        let config = parse_avcc(&test_avcc()).unwrap();
        assert_eq!(config.nal_size_len, 4);
        assert_eq!(
            &config.parameter_sets[..],
            &[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1F, 0, 0, 0, 1, 0x68, 0xEE]
        );
    }

    #[test]
    fn test_simulation_supported() {
        assert!(Mp4ToAnnexb::simulation_supported(&media_info(test_avcc())));

        // 2-byte NAL lengths cannot be rewritten size-neutrally
        let mut data = test_avcc().to_vec();
        data[4] = 0xFD;
        assert!(!Mp4ToAnnexb::simulation_supported(&media_info(Bytes::from(data))));

        assert!(!Mp4ToAnnexb::simulation_supported(&media_info(Bytes::new())));
    }

    #[test]
    fn test_start_codes_replace_lengths() {
        let (mut annexb, mut q, out) = filter();

        // two NAL units: 3 bytes and 2 bytes
        let payload: Vec<u8> = [
            &[0, 0, 0, 3][..],
            &[0x65, 0xAA, 0xBB][..],
            &[0, 0, 0, 2][..],
            &[0x41, 0xCC][..],
        ]
        .concat();

        let frame = OutputFrame {
            pts: 0,
            dts: 0,
            duration: 3000,
            key: true,
            size: payload.len() as u32,
            header_size: 0,
        };
        annexb.start_frame(&mut q, &frame).unwrap();
        // split the write mid-length-prefix to exercise the scan state
        annexb.write(&mut q, &payload[..6]).unwrap();
        annexb.write(&mut q, &payload[6..]).unwrap();
        annexb.flush_frame(&mut q, true).unwrap();
        q.flush().unwrap();

        let bytes = out.lock().unwrap();
        let payload_bytes: Vec<u8> = bytes
            .chunks_exact(188)
            .flat_map(|pkt| {
                // skip TS header and adaptation field
                let start = if pkt[3] & 0x20 != 0 { 5 + pkt[4] as usize } else { 4 };
                pkt[start..].to_vec()
            })
            .collect();

        // PES header, AUD, SPS/PPS, then the converted NAL units
        let elementary = &payload_bytes[19..];
        assert_eq!(&elementary[..6], &AUD_NAL);
        let after_sets = &elementary[6 + 14..];
        assert_eq!(&after_sets[..7], &[0, 0, 0, 1, 0x65, 0xAA, 0xBB]);
        assert_eq!(&after_sets[7..13], &[0, 0, 0, 1, 0x41, 0xCC]);
    }

    #[test]
    fn test_truncated_nal_is_bad_data() {
        let (mut annexb, mut q, _out) = filter();
        let frame = OutputFrame {
            pts: 0,
            dts: 0,
            duration: 3000,
            key: false,
            size: 6,
            header_size: 0,
        };
        annexb.start_frame(&mut q, &frame).unwrap();
        annexb.write(&mut q, &[0, 0, 0, 5, 0xAA, 0xBB]).unwrap();
        assert!(matches!(
            annexb.flush_frame(&mut q, true),
            Err(MuxError::BadData(_))
        ));
    }

    #[test]
    fn test_non_key_frame_skips_parameter_sets() {
        let (mut annexb, mut q, _out) = filter();
        let frame = OutputFrame {
            pts: 0,
            dts: 0,
            duration: 3000,
            key: false,
            size: 5,
            header_size: 0,
        };
        annexb.start_frame(&mut q, &frame).unwrap();
        annexb.write(&mut q, &[0, 0, 0, 1, 0x41]).unwrap();
        annexb.flush_frame(&mut q, true).unwrap();

        // one packet: PES header 19 + AUD 6 + startcode 4 + 1 byte
        assert_eq!(q.cur_offset, 188);
    }
}
