//! Segment and playlist URL naming.
//!
//! Segment files are named
//! `<prefix>-<dts_start>-<duration_ms>-<index+1><tracks_spec>.ts` where
//! `dts_start` is the accumulated playlist time in milliseconds, and
//! playlists are `<prefix><tracks_spec>.m3u8`. Both directions (format and
//! parse) live here so a host can map a requested file name back to the
//! segment it must produce.

use std::fmt;
use std::str::FromStr;

// helper.
macro_rules! regex {
    ($re:literal $(,)?) => {{
        static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| regex::Regex::new($re).unwrap())
    }};
}

/// Which tracks a URL addresses, e.g. `-v1-a1`. Track numbers are
/// one-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracksSpec {
    pub video: Vec<u32>,
    pub audio: Vec<u32>,
}

impl TracksSpec {
    pub fn muxed(video: u32, audio: u32) -> Self {
        Self {
            video: vec![video],
            audio: vec![audio],
        }
    }

    pub fn video_only(video: u32) -> Self {
        Self {
            video: vec![video],
            audio: Vec::new(),
        }
    }

    pub fn audio_only(audio: u32) -> Self {
        Self {
            video: Vec::new(),
            audio: vec![audio],
        }
    }
}

impl fmt::Display for TracksSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for v in &self.video {
            write!(f, "-v{}", v)?;
        }
        for a in &self.audio {
            write!(f, "-a{}", a)?;
        }
        Ok(())
    }
}

/// A fully specified segment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentUrl {
    pub prefix: String,
    /// Accumulated start time of the segment on the playlist timeline,
    /// milliseconds.
    pub dts_start: u64,
    pub duration_millis: u64,
    /// Zero-based segment index; rendered one-based.
    pub segment_index: u32,
    pub tracks: TracksSpec,
}

impl fmt::Display for SegmentUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}{}.ts",
            self.prefix,
            self.dts_start,
            self.duration_millis,
            self.segment_index + 1,
            self.tracks
        )
    }
}

impl SegmentUrl {
    /// Parse a segment file name produced by `Display`.
    pub fn parse(name: &str) -> Option<SegmentUrl> {
        let caps =
            regex!(r"^(.+?)-(\d+)-(\d+)-(\d+)((?:-[va]\d+)*)\.ts$").captures(name)?;

        let index_one_based = u32::from_str(&caps[4]).ok()?;
        if index_one_based == 0 {
            return None;
        }
        Some(SegmentUrl {
            prefix: caps[1].to_string(),
            dts_start: u64::from_str(&caps[2]).ok()?,
            duration_millis: u64::from_str(&caps[3]).ok()?,
            segment_index: index_one_based - 1,
            tracks: parse_tracks_spec(&caps[5]),
        })
    }
}

fn parse_tracks_spec(spec: &str) -> TracksSpec {
    let mut tracks = TracksSpec::default();
    for caps in regex!(r"-([va])(\d+)").captures_iter(spec) {
        if let Ok(n) = u32::from_str(&caps[2]) {
            match &caps[1] {
                "v" => tracks.video.push(n),
                _ => tracks.audio.push(n),
            }
        }
    }
    tracks
}

/// Index playlist file name: `<prefix><tracks_spec>.m3u8`.
pub fn index_playlist_name(prefix: &str, tracks: &TracksSpec) -> String {
    format!("{}{}.m3u8", prefix, tracks)
}
