//! Per-stream filter chains.
//!
//! Every stream owns a fixed-depth chain ending in its MPEG-TS packetizer.
//! Filters expose two parallel surfaces, one that moves real bytes and one
//! that only runs the size arithmetic, so the real and simulated drivers
//! can share all scheduling code.

pub mod adts;
pub mod annexb;
pub mod buffer;
pub mod id3;
pub mod joiner;
pub mod mpegts;

pub use adts::AdtsEncoder;
pub use annexb::Mp4ToAnnexb;
pub use buffer::BufferFilter;
pub use id3::Id3Encoder;
pub use joiner::FrameJoiner;
pub use mpegts::{InitStreamsState, MpegtsEncoder, TsStreamInfo, TS_PACKET_SIZE};

use crate::config::{EncryptionType, MuxerConfig};
use crate::error::{MuxError, Result};
use crate::media::{CodecId, MediaInfo, MediaType};
use crate::queue::WriteBufferQueue;

/// Largest PES payload the audio batching filters accumulate before closing
/// the PES (from the ffmpeg mpegts muxer's PES sizing).
pub const DEFAULT_PES_PAYLOAD_SIZE: usize = (16 - 1) * 184 + 170;

/// Frame descriptor handed down a filter chain.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub pts: u64,
    pub dts: u64,
    /// Frame duration in HLS ticks; drives audio PES continuity checks.
    pub duration: u32,
    pub key: bool,
    /// Payload size as known to the calling filter.
    pub size: u32,
    /// Bytes the emitting filter injected in front of the payload.
    pub header_size: u32,
}

/// Uniform filter surface; see module docs.
pub trait FrameFilter {
    fn start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) -> Result<()>;
    fn write(&mut self, q: &mut WriteBufferQueue, data: &[u8]) -> Result<()>;
    fn flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()>;

    fn simulated_start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame);
    fn simulated_write(&mut self, q: &mut WriteBufferQueue, size: u32);
    fn simulated_flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool);
}

/// The finite set of chains a stream can run, decided at segment init from
/// media type, codec, interleave mode, and encryption scheme.
pub enum StreamFilter {
    /// `annexb -> mpegts`
    Video(Mp4ToAnnexb),
    /// `adts -> joiner -> mpegts`
    AacJoined(AdtsEncoder<FrameJoiner>),
    /// `adts -> buffer -> mpegts`
    AacBuffered(AdtsEncoder<BufferFilter>),
    /// `joiner -> mpegts`
    AudioJoined(FrameJoiner),
    /// `buffer -> mpegts`
    AudioBuffered(BufferFilter),
    /// `id3 -> mpegts`
    Id3(Id3Encoder),
}

impl StreamFilter {
    /// Compose the chain for a media stream.
    pub fn for_track(
        media_type: MediaType,
        codec_id: CodecId,
        conf: &MuxerConfig,
        encryption: EncryptionType,
        encoder: MpegtsEncoder,
    ) -> Result<Self> {
        match media_type {
            MediaType::Video => Ok(StreamFilter::Video(Mp4ToAnnexb::new(encoder))),
            MediaType::Audio => {
                let is_aac = codec_id == CodecId::Aac;
                if !is_aac && encryption == EncryptionType::SampleAes {
                    return Err(MuxError::BadRequest(
                        "SAMPLE-AES encryption is supported only for AAC audio".to_string(),
                    ));
                }
                let filter = match (is_aac, conf.interleave_frames) {
                    (true, true) => {
                        StreamFilter::AacJoined(AdtsEncoder::new(FrameJoiner::new(encoder)))
                    }
                    (true, false) => {
                        StreamFilter::AacBuffered(AdtsEncoder::new(BufferFilter::new(encoder)))
                    }
                    (false, true) => StreamFilter::AudioJoined(FrameJoiner::new(encoder)),
                    (false, false) => StreamFilter::AudioBuffered(BufferFilter::new(encoder)),
                };
                Ok(filter)
            }
        }
    }

    /// Compose the chain for the synthetic timed-metadata stream.
    pub fn for_id3(encoder: MpegtsEncoder) -> Self {
        StreamFilter::Id3(Id3Encoder::new(encoder))
    }

    /// Configure codec adaptation from the track's media info.
    pub fn set_media_info(&mut self, info: &MediaInfo) -> Result<()> {
        match self {
            StreamFilter::Video(annexb) => annexb.set_media_info(info),
            StreamFilter::AacJoined(adts) => adts.set_media_info(info),
            StreamFilter::AacBuffered(adts) => adts.set_media_info(info),
            _ => Ok(()),
        }
    }

    pub fn mpegts(&self) -> &MpegtsEncoder {
        match self {
            StreamFilter::Video(f) => &f.next,
            StreamFilter::AacJoined(f) => &f.next.next,
            StreamFilter::AacBuffered(f) => &f.next.next,
            StreamFilter::AudioJoined(f) => &f.next,
            StreamFilter::AudioBuffered(f) => &f.next,
            StreamFilter::Id3(f) => &f.next,
        }
    }

    pub fn mpegts_mut(&mut self) -> &mut MpegtsEncoder {
        match self {
            StreamFilter::Video(f) => &mut f.next,
            StreamFilter::AacJoined(f) => &mut f.next.next,
            StreamFilter::AacBuffered(f) => &mut f.next.next,
            StreamFilter::AudioJoined(f) => &mut f.next,
            StreamFilter::AudioBuffered(f) => &mut f.next,
            StreamFilter::Id3(f) => &mut f.next,
        }
    }

    /// The delay-bounded buffer of this chain, when it has one.
    pub fn buffer_mut(&mut self) -> Option<&mut BufferFilter> {
        match self {
            StreamFilter::AacBuffered(f) => Some(&mut f.next),
            StreamFilter::AudioBuffered(f) => Some(f),
            _ => None,
        }
    }

    /// Clear transient chain state between a simulated and a real run.
    pub fn reset(&mut self) {
        match self {
            StreamFilter::Video(f) => f.reset(),
            StreamFilter::AacJoined(f) => f.next.reset(),
            StreamFilter::AacBuffered(f) => f.next.reset(),
            StreamFilter::AudioJoined(f) => f.reset(),
            StreamFilter::AudioBuffered(f) => f.reset(),
            StreamFilter::Id3(_) => {}
        }
        self.mpegts_mut().simulated_start_segment();
    }
}

impl FrameFilter for StreamFilter {
    fn start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) -> Result<()> {
        match self {
            StreamFilter::Video(f) => f.start_frame(q, frame),
            StreamFilter::AacJoined(f) => f.start_frame(q, frame),
            StreamFilter::AacBuffered(f) => f.start_frame(q, frame),
            StreamFilter::AudioJoined(f) => f.start_frame(q, frame),
            StreamFilter::AudioBuffered(f) => f.start_frame(q, frame),
            StreamFilter::Id3(f) => f.start_frame(q, frame),
        }
    }

    fn write(&mut self, q: &mut WriteBufferQueue, data: &[u8]) -> Result<()> {
        match self {
            StreamFilter::Video(f) => f.write(q, data),
            StreamFilter::AacJoined(f) => f.write(q, data),
            StreamFilter::AacBuffered(f) => f.write(q, data),
            StreamFilter::AudioJoined(f) => f.write(q, data),
            StreamFilter::AudioBuffered(f) => f.write(q, data),
            StreamFilter::Id3(f) => f.write(q, data),
        }
    }

    fn flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) -> Result<()> {
        match self {
            StreamFilter::Video(f) => f.flush_frame(q, last),
            StreamFilter::AacJoined(f) => f.flush_frame(q, last),
            StreamFilter::AacBuffered(f) => f.flush_frame(q, last),
            StreamFilter::AudioJoined(f) => f.flush_frame(q, last),
            StreamFilter::AudioBuffered(f) => f.flush_frame(q, last),
            StreamFilter::Id3(f) => f.flush_frame(q, last),
        }
    }

    fn simulated_start_frame(&mut self, q: &mut WriteBufferQueue, frame: &OutputFrame) {
        match self {
            StreamFilter::Video(f) => f.simulated_start_frame(q, frame),
            StreamFilter::AacJoined(f) => f.simulated_start_frame(q, frame),
            StreamFilter::AacBuffered(f) => f.simulated_start_frame(q, frame),
            StreamFilter::AudioJoined(f) => f.simulated_start_frame(q, frame),
            StreamFilter::AudioBuffered(f) => f.simulated_start_frame(q, frame),
            StreamFilter::Id3(f) => f.simulated_start_frame(q, frame),
        }
    }

    fn simulated_write(&mut self, q: &mut WriteBufferQueue, size: u32) {
        match self {
            StreamFilter::Video(f) => f.simulated_write(q, size),
            StreamFilter::AacJoined(f) => f.simulated_write(q, size),
            StreamFilter::AacBuffered(f) => f.simulated_write(q, size),
            StreamFilter::AudioJoined(f) => f.simulated_write(q, size),
            StreamFilter::AudioBuffered(f) => f.simulated_write(q, size),
            StreamFilter::Id3(f) => f.simulated_write(q, size),
        }
    }

    fn simulated_flush_frame(&mut self, q: &mut WriteBufferQueue, last: bool) {
        match self {
            StreamFilter::Video(f) => f.simulated_flush_frame(q, last),
            StreamFilter::AacJoined(f) => f.simulated_flush_frame(q, last),
            StreamFilter::AacBuffered(f) => f.simulated_flush_frame(q, last),
            StreamFilter::AudioJoined(f) => f.simulated_flush_frame(q, last),
            StreamFilter::AudioBuffered(f) => f.simulated_flush_frame(q, last),
            StreamFilter::Id3(f) => f.simulated_flush_frame(q, last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> MpegtsEncoder {
        let mut init = InitStreamsState::new(0);
        let info = init.add_stream(Some(MediaType::Audio), Some(CodecId::Aac));
        MpegtsEncoder::new(info, Some(MediaType::Audio), false, true)
    }

    #[test]
    fn test_chain_selection() {
        let conf = MuxerConfig {
            interleave_frames: true,
            ..Default::default()
        };
        let chain = StreamFilter::for_track(
            MediaType::Audio,
            CodecId::Aac,
            &conf,
            EncryptionType::None,
            encoder(),
        )
        .unwrap();
        assert!(matches!(chain, StreamFilter::AacJoined(_)));

        let conf = MuxerConfig::default();
        let chain = StreamFilter::for_track(
            MediaType::Audio,
            CodecId::Ac3,
            &conf,
            EncryptionType::None,
            encoder(),
        )
        .unwrap();
        assert!(matches!(&chain, StreamFilter::AudioBuffered(_)));
        assert!(chain.mpegts().stream_info().pid >= 0x100);
    }

    #[test]
    fn test_sample_aes_rejects_non_aac() {
        let conf = MuxerConfig::default();
        let result = StreamFilter::for_track(
            MediaType::Audio,
            CodecId::Mp3,
            &conf,
            EncryptionType::SampleAes,
            encoder(),
        );
        assert!(matches!(result, Err(MuxError::BadRequest(_))));
    }

    #[test]
    fn test_buffer_access() {
        let conf = MuxerConfig::default();
        let mut chain = StreamFilter::for_track(
            MediaType::Audio,
            CodecId::Aac,
            &conf,
            EncryptionType::None,
            encoder(),
        )
        .unwrap();
        assert!(chain.buffer_mut().is_some());

        let conf = MuxerConfig {
            interleave_frames: true,
            ..Default::default()
        };
        let mut chain = StreamFilter::for_track(
            MediaType::Audio,
            CodecId::Aac,
            &conf,
            EncryptionType::None,
            encoder(),
        )
        .unwrap();
        assert!(chain.buffer_mut().is_none());
    }
}
