//! Test media builders and a small transport-stream reader used to verify
//! produced segments.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::config::{EncryptionParams, MuxerConfig};
use crate::error::Result;
use crate::frames::MediaCache;
use crate::media::{
    CodecId, FramePart, FramesSourceSpec, InputFrame, MediaInfo, MediaSet, MediaTrack, MediaType,
    SegmentDurationItem, SegmentDurations,
};
use crate::muxer::{ProcessStatus, SegmentMuxer};
use crate::queue::{WriteCallback, WriteStatus};

/// avcC record: one SPS, one PPS, 4-byte NAL lengths.
pub fn h264_extradata() -> Bytes {
    let mut data = vec![0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1];
    data.extend_from_slice(&[0x00, 0x04, 0x67, 0x64, 0x00, 0x1F]);
    data.push(0x01);
    data.extend_from_slice(&[0x00, 0x02, 0x68, 0xEE]);
    Bytes::from(data)
}

/// AudioSpecificConfig: AAC-LC, 48 kHz, stereo.
pub fn aac_extradata() -> Bytes {
    Bytes::from_static(&[0x11, 0x90])
}

/// One video frame to synthesize: NAL body length and timing.
#[derive(Debug, Clone, Copy)]
pub struct FrameSpec {
    pub payload: usize,
    pub duration: u32,
    pub key: bool,
}

pub fn video_frame_spec(payload: usize, duration: u32, key: bool) -> FrameSpec {
    FrameSpec {
        payload,
        duration,
        key,
    }
}

/// Build a length-prefixed NAL payload buffer plus the matching frame table.
pub fn video_frames(specs: &[FrameSpec]) -> (Bytes, Vec<InputFrame>) {
    let mut data = Vec::new();
    let mut frames = Vec::with_capacity(specs.len());
    for spec in specs {
        let offset = data.len() as u64;
        data.extend_from_slice(&(spec.payload as u32).to_be_bytes());
        let nal_type: u8 = if spec.key { 0x65 } else { 0x41 };
        data.push(nal_type);
        data.extend(std::iter::repeat(0xA5).take(spec.payload.saturating_sub(1)));
        frames.push(InputFrame {
            size: (4 + spec.payload) as u32,
            duration: spec.duration,
            pts_delay: 0,
            key_frame: spec.key,
            offset,
        });
    }
    (Bytes::from(data), frames)
}

/// Build `count` raw AAC access units of `size` bytes, `duration` ticks each.
pub fn audio_frames(count: usize, size: usize, duration: u32) -> (Bytes, Vec<InputFrame>) {
    let mut data = Vec::new();
    let mut frames = Vec::with_capacity(count);
    for i in 0..count {
        let offset = data.len() as u64;
        data.extend(std::iter::repeat(0x21 + (i as u8 & 0x0F)).take(size));
        frames.push(InputFrame {
            size: size as u32,
            duration,
            pts_delay: 0,
            key_frame: true,
            offset,
        });
    }
    (Bytes::from(data), frames)
}

pub fn video_track(specs: &[FrameSpec], clip_start_time: u64, source_clip: u32) -> MediaTrack {
    let (data, frames) = video_frames(specs);
    let duration_millis: u64 = specs.iter().map(|s| s.duration as u64 / 90).sum();
    MediaTrack {
        media_info: MediaInfo {
            media_type: MediaType::Video,
            codec_id: CodecId::H264,
            duration_millis,
            bitrate: 2_000_000,
            extradata: h264_extradata(),
            width: 1280,
            height: 720,
            sample_rate: 0,
            channels: 0,
            language: None,
            label: None,
        },
        parts: vec![FramePart {
            frames,
            source_clip,
            source: FramesSourceSpec::Memory { data },
        }],
        clip_start_time,
        first_frame_time_offset: 0,
        clip_from_frame_offset: 0,
    }
}

pub fn audio_track(
    count: usize,
    size: usize,
    duration: u32,
    clip_start_time: u64,
    source_clip: u32,
) -> MediaTrack {
    let (data, frames) = audio_frames(count, size, duration);
    MediaTrack {
        media_info: MediaInfo {
            media_type: MediaType::Audio,
            codec_id: CodecId::Aac,
            duration_millis: count as u64 * duration as u64 / 90,
            bitrate: 128_000,
            extradata: aac_extradata(),
            width: 0,
            height: 0,
            sample_rate: 48_000,
            channels: 2,
            language: Some("en".to_string()),
            label: Some("English".to_string()),
        },
        parts: vec![FramePart {
            frames,
            source_clip,
            source: FramesSourceSpec::Memory { data },
        }],
        clip_start_time,
        first_frame_time_offset: 0,
        clip_from_frame_offset: 0,
    }
}

/// A duration table with one item covering the whole set.
pub fn single_segment_durations(duration_millis: u64) -> SegmentDurations {
    SegmentDurations {
        timescale: 1000,
        items: vec![SegmentDurationItem {
            duration: duration_millis,
            repeat_count: 1,
            discontinuity: false,
            segment_index: 0,
        }],
        start_time: 0,
        end_time: duration_millis,
        segment_count: 1,
    }
}

pub struct SegmentOutput {
    pub segment_size: Option<u64>,
    pub response_header: Bytes,
    pub bytes: Vec<u8>,
}

/// Run a full segment production against memory-backed sources and collect
/// the delivered bytes.
pub fn collect_segment(
    media_set: Arc<MediaSet>,
    conf: &MuxerConfig,
    encryption: &EncryptionParams,
) -> Result<SegmentOutput> {
    collect_segment_with_cache(media_set, conf, encryption, None, |_| {})
}

/// Same as [`collect_segment`] but with a media cache and a hook invoked on
/// every `Again` suspension so tests can load pending sources.
pub fn collect_segment_with_cache(
    media_set: Arc<MediaSet>,
    conf: &MuxerConfig,
    encryption: &EncryptionParams,
    cache: Option<Arc<MediaCache>>,
    mut on_again: impl FnMut(&MediaCache),
) -> Result<SegmentOutput> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&out);
    let callback: WriteCallback = Box::new(move |buf| {
        sink.lock().unwrap().extend_from_slice(&buf);
        Ok(WriteStatus::Done)
    });

    let result = SegmentMuxer::init_segment(
        media_set,
        conf,
        encryption,
        0,
        cache.clone(),
        callback,
    )?;

    if let Some(mut muxer) = result.muxer {
        let mut spins = 0;
        while muxer.process()? == ProcessStatus::Again {
            spins += 1;
            assert!(spins < 10_000, "segment production did not converge");
            if let Some(cache) = &cache {
                on_again(cache);
            }
        }
    }

    let bytes = out.lock().unwrap().clone();
    Ok(SegmentOutput {
        segment_size: result.segment_size,
        response_header: result.response_header,
        bytes,
    })
}

/// Minimal transport packet view for assertions.
#[derive(Debug, Clone)]
pub struct TsPacket {
    pub pid: u16,
    pub pusi: bool,
    pub cc: u8,
    pub rai: bool,
    pub payload: Vec<u8>,
}

pub fn parse_ts(bytes: &[u8]) -> Vec<TsPacket> {
    assert_eq!(bytes.len() % 188, 0, "segment is not packet aligned");
    bytes
        .chunks_exact(188)
        .map(|pkt| {
            assert_eq!(pkt[0], 0x47, "lost packet sync");
            let pid = ((pkt[1] as u16 & 0x1F) << 8) | pkt[2] as u16;
            let pusi = pkt[1] & 0x40 != 0;
            let cc = pkt[3] & 0x0F;
            let has_adaptation = pkt[3] & 0x20 != 0;
            let has_payload = pkt[3] & 0x10 != 0;
            let mut rai = false;
            let mut payload_start = 4;
            if has_adaptation {
                let adapt_len = pkt[4] as usize;
                if adapt_len > 0 {
                    rai = pkt[5] & 0x40 != 0;
                }
                payload_start = 5 + adapt_len;
            }
            let payload = if has_payload && payload_start < 188 {
                pkt[payload_start..].to_vec()
            } else {
                Vec::new()
            };
            TsPacket {
                pid,
                pusi,
                cc,
                rai,
                payload,
            }
        })
        .collect()
}

/// A parsed PES header from a payload-unit-start packet.
#[derive(Debug, Clone)]
pub struct PesInfo {
    pub pid: u16,
    pub stream_id: u8,
    pub pts: u64,
    pub dts: Option<u64>,
}

fn parse_timestamp(data: &[u8]) -> u64 {
    ((data[0] as u64 & 0x0E) << 29)
        | ((data[1] as u64) << 22)
        | ((data[2] as u64 & 0xFE) << 14)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64) >> 1)
}

/// PES headers in emission order, skipping PSI packets.
pub fn parse_pes_headers(packets: &[TsPacket]) -> Vec<PesInfo> {
    packets
        .iter()
        .filter(|p| p.pusi && p.pid >= 0x100 && p.pid != 0x1000)
        .filter_map(|p| {
            let d = &p.payload;
            if d.len() < 14 || d[0] != 0 || d[1] != 0 || d[2] != 1 {
                return None;
            }
            let stream_id = d[3];
            let flags = d[7];
            let pts = parse_timestamp(&d[9..14]);
            let dts = if flags & 0x40 != 0 && d.len() >= 19 {
                Some(parse_timestamp(&d[14..19]))
            } else {
                None
            };
            Some(PesInfo {
                pid: p.pid,
                stream_id,
                pts,
                dts,
            })
        })
        .collect()
}

/// Concatenated elementary-stream bytes of one PID (PES payloads with the
/// headers stripped).
pub fn elementary_stream(packets: &[TsPacket], pid: u16) -> Vec<u8> {
    let mut out = Vec::new();
    let mut in_pes = false;
    for packet in packets.iter().filter(|p| p.pid == pid) {
        let mut data = packet.payload.as_slice();
        if packet.pusi {
            assert!(data.len() > 9 && data[0] == 0 && data[1] == 0 && data[2] == 1);
            let header_len = 9 + data[8] as usize;
            data = &data[header_len..];
            in_pes = true;
        }
        if in_pes {
            out.extend_from_slice(data);
        }
    }
    out
}
