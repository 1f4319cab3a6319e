//! MPEG-TS packetizer.
//!
//! Terminal filter of every stream chain: wraps PES payloads into 188-byte
//! transport packets appended to the write-buffer queue, and owns the
//! per-stream PID, continuity counter, and the frame position counters the
//! I-frame playlist builder reads.
//!
//! Packets are reserved in the queue the moment they open and composed when
//! they close, so cross-stream byte order is fixed at reservation time. The
//! simulated surface runs the identical layout arithmetic against the
//! queue's length counter without materializing any bytes; both paths must
//! stay in lockstep or precomputed segment sizes will disagree with
//! delivered bytes.

use bytes::Bytes;

use crate::error::Result;
use crate::filter::{FrameFilter, OutputFrame};
use crate::media::{CodecId, MediaType, HLS_DELAY};
use crate::queue::WriteBufferQueue;

/// Size of an MPEG transport packet.
pub const TS_PACKET_SIZE: usize = 188;

const PAT_PID: u16 = 0;
const PMT_PID: u16 = 0x1000;
const FIRST_ES_PID: u16 = 0x100;

const PAT_TABLE_ID: u8 = 0x00;
const PMT_TABLE_ID: u8 = 0x02;
const PROGRAM_NUMBER: u16 = 1;

const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_HEVC: u8 = 0x24;
const STREAM_TYPE_AAC: u8 = 0x0F;
const STREAM_TYPE_MP3: u8 = 0x03;
const STREAM_TYPE_AC3: u8 = 0x81;
const STREAM_TYPE_EAC3: u8 = 0x87;
const STREAM_TYPE_METADATA: u8 = 0x15;

const PES_VIDEO_STREAM_ID: u8 = 0xE0;
const PES_AUDIO_STREAM_ID: u8 = 0xC0;
const PES_PRIVATE_STREAM_ID: u8 = 0xBD;

const PTS_MASK: u64 = (1 << 33) - 1;

/// Identity of one elementary stream within the transport program.
#[derive(Debug, Clone, Copy)]
pub struct TsStreamInfo {
    pub pid: u16,
    pub stream_type: u8,
    pub stream_id: u8,
}

/// Allocates PIDs and stream ids while streams register, then renders the
/// per-segment PAT and PMT packets.
pub struct InitStreamsState {
    segment_index: u32,
    streams: Vec<TsStreamInfo>,
    video_count: u8,
    audio_count: u8,
}

impl InitStreamsState {
    pub fn new(segment_index: u32) -> Self {
        Self {
            segment_index,
            streams: Vec::new(),
            video_count: 0,
            audio_count: 0,
        }
    }

    /// Register one stream; `None` media type registers the timed-metadata
    /// stream.
    pub fn add_stream(
        &mut self,
        media_type: Option<MediaType>,
        codec_id: Option<CodecId>,
    ) -> TsStreamInfo {
        let pid = FIRST_ES_PID + self.streams.len() as u16;
        let (stream_type, stream_id) = match (media_type, codec_id) {
            (Some(MediaType::Video), codec) => {
                let stream_type = match codec {
                    Some(CodecId::Hevc) => STREAM_TYPE_HEVC,
                    _ => STREAM_TYPE_H264,
                };
                let info = (stream_type, PES_VIDEO_STREAM_ID + self.video_count);
                self.video_count += 1;
                info
            }
            (Some(MediaType::Audio), codec) => {
                let stream_type = match codec {
                    Some(CodecId::Ac3) => STREAM_TYPE_AC3,
                    Some(CodecId::Eac3) => STREAM_TYPE_EAC3,
                    Some(CodecId::Mp3) => STREAM_TYPE_MP3,
                    _ => STREAM_TYPE_AAC,
                };
                let info = (stream_type, PES_AUDIO_STREAM_ID + self.audio_count);
                self.audio_count += 1;
                info
            }
            (None, _) => (STREAM_TYPE_METADATA, PES_PRIVATE_STREAM_ID),
        };

        let info = TsStreamInfo {
            pid,
            stream_type,
            stream_id,
        };
        self.streams.push(info);
        info
    }

    /// PID of the stream that carries the program clock: the first video
    /// stream, or the first stream when there is no video.
    pub fn pcr_pid(&self) -> u16 {
        self.streams
            .iter()
            .find(|s| s.stream_id & 0xF0 == PES_VIDEO_STREAM_ID)
            .or(self.streams.first())
            .map(|s| s.pid)
            .unwrap_or(FIRST_ES_PID)
    }

    /// Render the PAT and PMT transport packets that open the segment.
    /// The continuity counter tracks the segment index so concatenated
    /// segments keep a continuous table stream.
    pub fn finalize(&self) -> Bytes {
        let cc = (self.segment_index & 0x0F) as u8;
        let mut out = Vec::with_capacity(2 * TS_PACKET_SIZE);
        out.extend_from_slice(&build_pat_packet(cc));
        out.extend_from_slice(&build_pmt_packet(cc, self.pcr_pid(), &self.streams));
        Bytes::from(out)
    }
}

fn build_section_packet(pid: u16, cc: u8, section: &[u8]) -> [u8; TS_PACKET_SIZE] {
    let mut pkt = [0xFFu8; TS_PACKET_SIZE];
    pkt[0] = 0x47;
    pkt[1] = 0x40 | (pid >> 8) as u8;
    pkt[2] = pid as u8;
    pkt[3] = 0x10 | (cc & 0x0F);
    pkt[4] = 0x00; // pointer field
    pkt[5..5 + section.len()].copy_from_slice(section);
    pkt
}

fn build_pat_packet(cc: u8) -> [u8; TS_PACKET_SIZE] {
    let mut section = Vec::with_capacity(16);
    section.push(PAT_TABLE_ID);
    let section_length = 13u16; // 5 header + 4 program + 4 crc
    section.push(0xB0 | (section_length >> 8) as u8);
    section.push(section_length as u8);
    section.extend_from_slice(&1u16.to_be_bytes()); // transport_stream_id
    section.push(0xC1); // version 0, current
    section.push(0x00); // section_number
    section.push(0x00); // last_section_number
    section.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
    section.push(0xE0 | (PMT_PID >> 8) as u8);
    section.push(PMT_PID as u8);
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    build_section_packet(PAT_PID, cc, &section)
}

fn build_pmt_packet(cc: u8, pcr_pid: u16, streams: &[TsStreamInfo]) -> [u8; TS_PACKET_SIZE] {
    let mut section = Vec::with_capacity(32);
    section.push(PMT_TABLE_ID);
    let section_length = (9 + streams.len() * 5 + 4) as u16;
    section.push(0xB0 | (section_length >> 8) as u8);
    section.push(section_length as u8);
    section.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
    section.push(0xC1);
    section.push(0x00);
    section.push(0x00);
    section.push(0xE0 | (pcr_pid >> 8) as u8);
    section.push(pcr_pid as u8);
    section.push(0xF0); // program_info_length
    section.push(0x00);
    for stream in streams {
        section.push(stream.stream_type);
        section.push(0xE0 | (stream.pid >> 8) as u8);
        section.push(stream.pid as u8);
        section.push(0xF0); // ES info length
        section.push(0x00);
    }
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    build_section_packet(PMT_PID, cc, &section)
}

/// CRC-32/MPEG-2 over PSI section bytes.
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

struct OpenPacket {
    slot_start: u64,
    pusi: bool,
    cc: u8,
    pcr: Option<u64>,
    rai: bool,
    /// Materialized payload; stays empty on the simulated path.
    payload: Vec<u8>,
    fill: usize,
    cap: usize,
}

/// Per-stream transport packetizer.
pub struct MpegtsEncoder {
    info: TsStreamInfo,
    media_type: Option<MediaType>,
    is_pcr: bool,
    align_frames: bool,
    cc: u8,
    open: Option<OpenPacket>,
    /// Lowest queue offset this stream may still write into; `u64::MAX`
    /// while no packet is open.
    pub send_queue_offset: u64,
    pub cur_frame_start_pos: u64,
    pub cur_frame_end_pos: u64,
    pub last_frame_start_pos: u64,
    pub last_frame_end_pos: u64,
}

impl MpegtsEncoder {
    pub fn new(
        info: TsStreamInfo,
        media_type: Option<MediaType>,
        is_pcr: bool,
        align_frames: bool,
    ) -> Self {
        Self {
            info,
            media_type,
            is_pcr,
            align_frames,
            cc: 0,
            open: None,
            send_queue_offset: u64::MAX,
            cur_frame_start_pos: 0,
            cur_frame_end_pos: 0,
            last_frame_start_pos: 0,
            last_frame_end_pos: 0,
        }
    }

    pub fn stream_info(&self) -> TsStreamInfo {
        self.info
    }

    /// Reset counters for a fresh (simulated or real) segment run without
    /// producing bytes.
    pub fn simulated_start_segment(&mut self) {
        self.cc = 0;
        self.open = None;
        self.send_queue_offset = u64::MAX;
        self.cur_frame_start_pos = 0;
        self.cur_frame_end_pos = 0;
        self.last_frame_start_pos = 0;
        self.last_frame_end_pos = 0;
    }

    fn pes_header(&self, frame: &OutputFrame) -> ([u8; 19], usize) {
        let mut hdr = [0u8; 19];
        let with_dts = self.media_type == Some(MediaType::Video);
        let pts = (frame.pts + HLS_DELAY) & PTS_MASK;
        let dts = (frame.dts + HLS_DELAY) & PTS_MASK;

        hdr[0] = 0x00;
        hdr[1] = 0x00;
        hdr[2] = 0x01;
        hdr[3] = self.info.stream_id;
        // PES packet length stays 0 (unbounded): payload sizes are not known
        // up front when frames stream through, and the simulated path must
        // produce identical headers.
        hdr[4] = 0x00;
        hdr[5] = 0x00;
        hdr[6] = 0x80;
        hdr[7] = if with_dts { 0xC0 } else { 0x80 };
        hdr[8] = if with_dts { 10 } else { 5 };
        write_timestamp(&mut hdr[9..14], if with_dts { 0x3 } else { 0x2 }, pts);
        if with_dts {
            write_timestamp(&mut hdr[14..19], 0x1, dts);
            (hdr, 19)
        } else {
            (hdr, 14)
        }
    }

    fn open_packet(&mut self, q: &mut WriteBufferQueue, pusi: bool, pcr: Option<u64>, rai: bool, real: bool) {
        let cap = 184 - if pcr.is_some() { 8 } else { 0 };
        let slot_start = if real {
            q.reserve(TS_PACKET_SIZE as u64)
        } else {
            q.simulated_append(TS_PACKET_SIZE as u64)
        };
        let cc = self.cc;
        self.cc = (self.cc + 1) & 0x0F;
        self.open = Some(OpenPacket {
            slot_start,
            pusi,
            cc,
            pcr,
            rai,
            payload: Vec::new(),
            fill: 0,
            cap,
        });
    }

    fn close_packet(&mut self, q: &mut WriteBufferQueue, real: bool) -> Result<()> {
        if let Some(open) = self.open.take() {
            if real {
                let pkt = compose_packet(&self.info, &open);
                q.fill(open.slot_start, Bytes::copy_from_slice(&pkt))?;
            }
        }
        Ok(())
    }

    /// Push `len` payload bytes through the packet layout; `data` carries
    /// the actual bytes on the real path and is `None` when simulating.
    fn advance(
        &mut self,
        q: &mut WriteBufferQueue,
        mut data: Option<&[u8]>,
        mut len: usize,
        real: bool,
    ) -> Result<()> {
        while len > 0 {
            if self.open.is_none() {
                self.open_packet(q, false, None, false, real);
            }
            let mut packet_full = false;
            if let Some(open) = self.open.as_mut() {
                let take = (open.cap - open.fill).min(len);
                if let Some(bytes) = data {
                    open.payload.extend_from_slice(&bytes[..take]);
                    data = Some(&bytes[take..]);
                }
                open.fill += take;
                len -= take;
                packet_full = open.fill == open.cap;
            }
            if packet_full {
                self.close_packet(q, real)?;
            }
        }
        Ok(())
    }

    fn begin_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame, real: bool) -> Result<()> {
        self.last_frame_start_pos = self.cur_frame_start_pos;
        self.last_frame_end_pos = self.cur_frame_end_pos;
        self.cur_frame_start_pos = match &self.open {
            Some(open) => open.slot_start,
            None => q.cur_offset,
        };

        if self.open.is_none() {
            let pcr = self.is_pcr.then_some(frame.dts & PTS_MASK);
            self.open_packet(q, true, pcr, frame.key, real);
        }

        let (hdr, hdr_len) = self.pes_header(frame);
        self.advance(q, real.then_some(&hdr[..hdr_len]), hdr_len, real)?;
        self.update_send_offset(q);
        Ok(())
    }

    fn end_frame(&mut self, q: &mut WriteBufferQueue, last: bool, real: bool) -> Result<()> {
        if (self.align_frames || last) && self.open.is_some() {
            self.close_packet(q, real)?;
        }
        self.cur_frame_end_pos = match &self.open {
            Some(open) => open.slot_start + TS_PACKET_SIZE as u64,
            None => q.cur_offset,
        };
        if last {
            self.send_queue_offset = u64::MAX;
        } else {
            self.update_send_offset(q);
        }
        Ok(())
    }

    fn update_send_offset(&mut self, _q: &mut WriteBufferQueue) {
        self.send_queue_offset = match &self.open {
            Some(open) => open.slot_start,
            None => u64::MAX,
        };
    }
}

impl FrameFilter for MpegtsEncoder {
    fn start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) -> Result<()> {
        self.begin_frame(q, frame, true)
    }

    fn write(&mut self, q: &mut WriteBufferQueue, data: &[u8]) -> Result<()> {
        self.advance(q, Some(data), data.len(), true)?;
        self.update_send_offset(q);
        Ok(())
    }

    fn flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()> {
        self.end_frame(q, last, true)
    }

    fn simulated_start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) {
        // layout arithmetic cannot fail without byte materialization
        let _ = self.begin_frame(q, frame, false);
    }

    fn simulated_write(&mut self, q: &mut WriteBufferQueue, size: u32) {
        let _ = self.advance(q, None, size as usize, false);
        self.update_send_offset(q);
    }

    fn simulated_flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) {
        let _ = self.end_frame(q, last, false);
    }
}

fn write_timestamp(out: &mut [u8], marker: u8, ts: u64) {
    out[0] = (marker << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 0x01;
    out[1] = ((ts >> 22) & 0xFF) as u8;
    out[2] = ((((ts >> 15) & 0x7F) as u8) << 1) | 0x01;
    out[3] = ((ts >> 7) & 0xFF) as u8;
    out[4] = (((ts & 0x7F) as u8) << 1) | 0x01;
}

fn write_pcr(out: &mut [u8], base: u64) {
    out[0] = (base >> 25) as u8;
    out[1] = (base >> 17) as u8;
    out[2] = (base >> 9) as u8;
    out[3] = (base >> 1) as u8;
    out[4] = (((base & 0x01) as u8) << 7) | 0x7E; // 6 reserved bits
    out[5] = 0x00; // 9-bit extension, always zero here
}

fn compose_packet(info: &TsStreamInfo, open: &OpenPacket) -> [u8; TS_PACKET_SIZE] {
    let mut pkt = [0u8; TS_PACKET_SIZE];
    pkt[0] = 0x47;
    pkt[1] = if open.pusi { 0x40 } else { 0x00 } | (info.pid >> 8) as u8;
    pkt[2] = info.pid as u8;

    let stuffing = open.cap - open.fill;
    let payload_at = match open.pcr {
        Some(pcr) => {
            pkt[3] = 0x30 | open.cc;
            let adapt_len = 7 + stuffing;
            pkt[4] = adapt_len as u8;
            pkt[5] = 0x10 | if open.rai { 0x40 } else { 0x00 };
            write_pcr(&mut pkt[6..12], pcr);
            for byte in pkt[12..12 + stuffing].iter_mut() {
                *byte = 0xFF;
            }
            12 + stuffing
        }
        None if stuffing == 0 => {
            pkt[3] = 0x10 | open.cc;
            4
        }
        None if stuffing == 1 => {
            pkt[3] = 0x30 | open.cc;
            pkt[4] = 0x00;
            5
        }
        None => {
            pkt[3] = 0x30 | open.cc;
            pkt[4] = (stuffing - 1) as u8;
            pkt[5] = 0x00;
            for byte in pkt[6..4 + stuffing].iter_mut() {
                *byte = 0xFF;
            }
            4 + stuffing
        }
    };

    pkt[payload_at..payload_at + open.fill].copy_from_slice(&open.payload);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{SegmentSink, WriteCallback, WriteStatus};
    use std::sync::{Arc, Mutex};

    fn queue() -> (WriteBufferQueue, Arc<Mutex<Vec<u8>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink_out = Arc::clone(&out);
        let callback: WriteCallback = Box::new(move |buf| {
            sink_out.lock().unwrap().extend_from_slice(&buf);
            Ok(WriteStatus::Done)
        });
        (WriteBufferQueue::new(SegmentSink::plain(callback)), out)
    }

    fn video_encoder() -> MpegtsEncoder {
        let mut init = InitStreamsState::new(0);
        let info = init.add_stream(Some(MediaType::Video), Some(CodecId::H264));
        MpegtsEncoder::new(info, Some(MediaType::Video), true, true)
    }

    fn frame(dts: u64, size: u32, key: bool) -> OutputFrame {
        OutputFrame {
            pts: dts,
            dts,
            duration: 3000,
            key,
            size,
            header_size: 0,
        }
    }

    #[test]
    fn test_program_tables_are_two_packets() {
        let mut init = InitStreamsState::new(3);
        init.add_stream(Some(MediaType::Video), Some(CodecId::H264));
        init.add_stream(Some(MediaType::Audio), Some(CodecId::Aac));
        init.add_stream(None, None);
        let tables = init.finalize();

        assert_eq!(tables.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(tables[0], 0x47);
        assert_eq!(tables[188], 0x47);
        // PAT on PID 0, PMT on 0x1000, both with the segment's counter
        assert_eq!(tables[1] & 0x1F, 0);
        assert_eq!(((tables[189] as u16 & 0x1F) << 8) | tables[190] as u16, PMT_PID);
        assert_eq!(tables[3] & 0x0F, 3);
    }

    #[test]
    fn test_pcr_pid_prefers_video() {
        let mut init = InitStreamsState::new(0);
        let audio = init.add_stream(Some(MediaType::Audio), Some(CodecId::Aac));
        let video = init.add_stream(Some(MediaType::Video), Some(CodecId::H264));
        assert_ne!(init.pcr_pid(), audio.pid);
        assert_eq!(init.pcr_pid(), video.pid);
    }

    #[test]
    fn test_crc32_mpeg2_known_vector() {
        // CRC-32/MPEG-2 of "123456789"
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_single_frame_packetization() {
        let (mut q, out) = queue();
        let mut enc = video_encoder();

        let payload = vec![0xAB; 100];
        enc.start_frame(&mut q, &frame(0, 100, true)).unwrap();
        enc.write(&mut q, &payload).unwrap();
        enc.flush_frame(&mut q, true).unwrap();
        q.flush().unwrap();

        let bytes = out.lock().unwrap();
        // 19-byte PES header + 100 payload fits one PCR packet (176 usable)
        assert_eq!(bytes.len(), TS_PACKET_SIZE);
        assert_eq!(bytes[0], 0x47);
        assert_eq!(bytes[1] & 0x40, 0x40, "payload unit start");
        assert_eq!(bytes[3] & 0x30, 0x30, "adaptation + payload");
        // random access indicator set for the key frame
        assert_eq!(bytes[5] & 0x40, 0x40);
    }

    #[test]
    fn test_simulated_matches_real_sizes() {
        let sizes = [10u32, 170, 200, 1000, 4096];
        for &size in &sizes {
            let (mut real_q, _out) = queue();
            let mut real_enc = video_encoder();
            let payload = vec![0x11u8; size as usize];
            real_enc.start_frame(&mut real_q, &frame(9000, size, false)).unwrap();
            real_enc.write(&mut real_q, &payload).unwrap();
            real_enc.flush_frame(&mut real_q, true).unwrap();

            let (mut sim_q, _out2) = queue();
            let mut sim_enc = video_encoder();
            sim_enc.simulated_start_frame(&mut sim_q, &frame(9000, size, false));
            sim_enc.simulated_write(&mut sim_q, size);
            sim_enc.simulated_flush_frame(&mut sim_q, true);

            assert_eq!(real_q.cur_offset, sim_q.cur_offset, "size {}", size);
            assert_eq!(real_q.cur_offset % TS_PACKET_SIZE as u64, 0);
        }
    }

    #[test]
    fn test_continuity_counter_wraps() {
        let (mut q, out) = queue();
        let mut enc = video_encoder();

        // large frame spanning > 16 packets
        let size = 20 * 184;
        enc.start_frame(&mut q, &frame(0, size as u32, false)).unwrap();
        enc.write(&mut q, &vec![0u8; size]).unwrap();
        enc.flush_frame(&mut q, true).unwrap();
        q.flush().unwrap();

        let bytes = out.lock().unwrap();
        let mut expected = 0u8;
        for pkt in bytes.chunks_exact(TS_PACKET_SIZE) {
            assert_eq!(pkt[3] & 0x0F, expected);
            expected = (expected + 1) & 0x0F;
        }
    }

    #[test]
    fn test_frame_positions_track_packets() {
        let (mut q, _out) = queue();
        let mut enc = video_encoder();

        enc.start_frame(&mut q, &frame(0, 50, true)).unwrap();
        enc.write(&mut q, &[0u8; 50]).unwrap();
        enc.flush_frame(&mut q, false).unwrap();
        let first_range = (enc.cur_frame_start_pos, enc.cur_frame_end_pos);
        assert_eq!(first_range, (0, TS_PACKET_SIZE as u64));

        enc.start_frame(&mut q, &frame(3000, 50, false)).unwrap();
        enc.write(&mut q, &[0u8; 50]).unwrap();
        enc.flush_frame(&mut q, true).unwrap();

        assert_eq!((enc.last_frame_start_pos, enc.last_frame_end_pos), first_range);
        assert_eq!(enc.cur_frame_start_pos, TS_PACKET_SIZE as u64);
        assert_eq!(enc.cur_frame_end_pos, 2 * TS_PACKET_SIZE as u64);
    }

    #[test]
    fn test_unaligned_frames_share_packets() {
        let (mut q_aligned, _o1) = queue();
        let mut aligned = video_encoder();
        let (mut q_packed, _o2) = queue();
        let mut packed = MpegtsEncoder::new(
            aligned.stream_info(),
            Some(MediaType::Video),
            true,
            false,
        );

        for (enc, q) in [(&mut aligned, &mut q_aligned), (&mut packed, &mut q_packed)] {
            for i in 0..4u64 {
                enc.start_frame(q, &frame(i * 3000, 40, false)).unwrap();
                enc.write(q, &[0u8; 40]).unwrap();
                enc.flush_frame(q, i == 3).unwrap();
            }
        }

        assert!(q_packed.cur_offset < q_aligned.cur_offset);
    }
}
