//! Media model consumed by the muxer.
//!
//! A [`MediaSet`] arrives pre-parsed from the host: an ordered list of clips,
//! each contributing up to one video and one audio track. Tracks carry their
//! frame tables split into [`FramePart`]s, where each part is bound to one
//! source clip and one frames-source. All frame timing is expressed in the
//! HLS timescale (90 kHz) by the time it reaches this crate.

use bytes::Bytes;
use uuid::Uuid;

/// MPEG-TS PTS/DTS clock rate, ticks per second.
pub const HLS_TIMESCALE: u64 = 90_000;

/// Muxing delay in HLS ticks (700ms). PES timestamps are offset by this
/// amount so the PCR clock never runs ahead of the DTS clock, and buffered
/// audio is force-flushed once it lags video by more than half of it.
pub const HLS_DELAY: u64 = 63_000;

/// Rescale milliseconds to HLS ticks.
pub fn hls_rescale_millis(millis: u64) -> u64 {
    millis * (HLS_TIMESCALE / 1000)
}

/// Rescale HLS ticks to milliseconds, truncating.
pub fn hls_rescale_to_millis(ts: u64) -> u64 {
    ts / (HLS_TIMESCALE / 1000)
}

/// Rescale `value` from `from_scale` to `to_scale`, rounding half up.
pub fn rescale_time(value: u64, from_scale: u64, to_scale: u64) -> u64 {
    (value * to_scale + from_scale / 2) / from_scale
}

/// Track media type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
}

/// Codec identifier for the small set of codecs that can ride an MPEG-TS
/// segment produced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    H264,
    Hevc,
    Aac,
    Ac3,
    Eac3,
    Mp3,
}

impl CodecId {
    pub fn is_video(&self) -> bool {
        matches!(self, CodecId::H264 | CodecId::Hevc)
    }
}

/// Static per-track information
#[derive(Debug, Clone)]
pub struct MediaInfo {
    /// Whether this is a video or audio track
    pub media_type: MediaType,
    /// Codec of the elementary stream
    pub codec_id: CodecId,
    /// Track duration in milliseconds
    pub duration_millis: u64,
    /// Average bitrate in bits per second
    pub bitrate: u64,
    /// Codec private data: avcC for H.264, AudioSpecificConfig for AAC
    pub extradata: Bytes,
    /// Width in pixels (video only, 0 otherwise)
    pub width: u32,
    /// Height in pixels (video only, 0 otherwise)
    pub height: u32,
    /// Sampling rate in Hz (audio only, 0 otherwise)
    pub sample_rate: u32,
    /// Channel count (audio only, 0 otherwise)
    pub channels: u16,
    /// Language code as specified in the source file metadata
    pub language: Option<String>,
    /// Human readable rendition name
    pub label: Option<String>,
}

/// A single frame as listed in a track's frame table.
///
/// `duration` and `pts_delay` are in HLS ticks; `offset` addresses the frame
/// payload within its part's frames-source.
#[derive(Debug, Clone)]
pub struct InputFrame {
    pub size: u32,
    pub duration: u32,
    pub pts_delay: u32,
    pub key_frame: bool,
    pub offset: u64,
}

/// Where a frame part's payload bytes live.
#[derive(Debug, Clone)]
pub enum FramesSourceSpec {
    /// Payload is memory resident; frame offsets address this buffer.
    Memory { data: Bytes },
    /// Payload is served through a shared [`crate::frames::MediaCache`]
    /// under this source id; reads may suspend until the host loads it.
    Cached { source_id: String },
}

/// A contiguous range of frames bound to one source clip and one
/// frames-source. Parts chain in declaration order within a track.
#[derive(Debug, Clone)]
pub struct FramePart {
    pub frames: Vec<InputFrame>,
    /// Identity of the source clip this part was cut from; used to coalesce
    /// reads across streams sharing a source.
    pub source_clip: u32,
    pub source: FramesSourceSpec,
}

/// One elementary stream of one clip.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub media_info: MediaInfo,
    /// Frame table, split into parts. Never empty.
    pub parts: Vec<FramePart>,
    /// Clip start time within the media-set timeline, milliseconds.
    pub clip_start_time: u64,
    /// DTS of the first frame relative to the clip start, HLS ticks.
    pub first_frame_time_offset: u64,
    /// Offset subtracted from segment limits when the clip was opened
    /// mid-frame ("clip from"), HLS ticks.
    pub clip_from_frame_offset: u64,
}

impl MediaTrack {
    /// Total DTS offset of the first frame on the media-set timeline.
    pub fn first_frame_dts(&self) -> u64 {
        hls_rescale_millis(self.clip_start_time) + self.first_frame_time_offset
    }
}

/// The full input to a segment request: all clips' tracks, clip-major.
///
/// `tracks[clip * tracks_per_clip + i]` is track `i` of clip `clip`; every
/// clip carries the same number of tracks in the same order so the clip walk
/// can re-bind stream `i` to the next clip's track `i`.
#[derive(Debug, Clone)]
pub struct MediaSet {
    /// Identity used in log output.
    pub set_id: String,
    pub tracks: Vec<MediaTrack>,
    pub tracks_per_clip: usize,
    pub clip_count: usize,
    /// When set, clip boundaries are segment boundaries and the playlist
    /// carries `#EXT-X-DISCONTINUITY` tags between them.
    pub use_discontinuity: bool,
    /// Total timeline duration in milliseconds, when the host derived one.
    pub total_duration_millis: Option<u64>,
    /// Whether the presentation is complete (VOD end list).
    pub presentation_end: bool,
    /// Index of the first segment of this media set within the stream.
    pub initial_segment_index: u32,
}

impl MediaSet {
    pub fn new(tracks: Vec<MediaTrack>, tracks_per_clip: usize) -> Self {
        let clip_count = if tracks_per_clip == 0 {
            0
        } else {
            tracks.len() / tracks_per_clip
        };
        Self {
            set_id: Uuid::new_v4().to_string(),
            tracks,
            tracks_per_clip,
            clip_count,
            use_discontinuity: false,
            total_duration_millis: None,
            presentation_end: true,
            initial_segment_index: 0,
        }
    }

    /// Tracks of the first clip; the streams a segment request starts from.
    pub fn first_clip_tracks(&self) -> &[MediaTrack] {
        &self.tracks[..self.tracks_per_clip.min(self.tracks.len())]
    }

    pub fn total_track_count(&self) -> usize {
        self.tracks_per_clip
    }
}

/// One run of equal-duration segments in a [`SegmentDurations`] table.
#[derive(Debug, Clone)]
pub struct SegmentDurationItem {
    /// Duration of each repeat, in the table's timescale.
    pub duration: u64,
    /// How many consecutive segments share this duration. At least 1.
    pub repeat_count: u32,
    /// Whether a discontinuity precedes the first segment of this item.
    pub discontinuity: bool,
    /// Index of the first segment of this item.
    pub segment_index: u32,
}

/// Pre-computed segment boundary table for a media set.
#[derive(Debug, Clone)]
pub struct SegmentDurations {
    /// Timescale of `duration` values; typically 1000 (milliseconds).
    pub timescale: u64,
    pub items: Vec<SegmentDurationItem>,
    /// Timeline start, milliseconds.
    pub start_time: u64,
    /// Timeline end, milliseconds.
    pub end_time: u64,
    pub segment_count: u32,
}

impl SegmentDurations {
    /// Longest segment duration in milliseconds.
    pub fn max_duration_millis(&self) -> u64 {
        self.items
            .iter()
            .map(|item| rescale_time(item.duration, self.timescale, 1000))
            .max()
            .unwrap_or(0)
    }

    /// Number of items flagged with a discontinuity.
    pub fn discontinuities(&self) -> usize {
        self.items.iter().filter(|item| item.discontinuity).count()
    }
}
