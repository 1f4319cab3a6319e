//! HLS codec string generation
//!
//! Generates proper codec strings for the CODECS attribute of
//! `#EXT-X-STREAM-INF`.

use crate::media::{CodecId, MediaInfo};

/// Get the HLS codec string for a video track.
pub fn video_codec_string(info: &MediaInfo) -> Option<String> {
    match info.codec_id {
        CodecId::H264 => Some(h264_codec_string(info)),
        CodecId::Hevc => Some("hvc1.1.6.L93.B0".to_string()), // HEVC Main
        _ => None,
    }
}

/// Get the HLS codec string for an audio codec.
pub fn audio_codec_string(codec_id: CodecId) -> Option<&'static str> {
    match codec_id {
        CodecId::Aac => Some("mp4a.40.2"),  // AAC-LC
        CodecId::Ac3 => Some("ac-3"),       // Dolby Digital
        CodecId::Eac3 => Some("ec-3"),      // Dolby Digital Plus
        CodecId::Mp3 => Some("mp4a.40.34"), // MP3
        _ => None,
    }
}

/// `avc1.PPCCLL` from the profile, compatibility, and level bytes of the
/// track's avcC record.
fn h264_codec_string(info: &MediaInfo) -> String {
    let extradata = &info.extradata;
    if extradata.len() >= 4 && extradata[0] == 1 {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            extradata[1], extradata[2], extradata[3]
        )
    } else {
        // constrained baseline 3.0, a safe default when extradata is absent
        "avc1.42e01e".to_string()
    }
}

/// CODECS attribute value for one variant: video codec first, then the
/// audio codec when the variant is muxed.
pub fn build_codec_attribute(video: Option<&MediaInfo>, audio: Option<&MediaInfo>) -> String {
    let mut codecs = Vec::new();
    if let Some(info) = video {
        if let Some(s) = video_codec_string(info) {
            codecs.push(s);
        }
    }
    if let Some(info) = audio {
        if let Some(s) = audio_codec_string(info.codec_id) {
            codecs.push(s.to_string());
        }
    }
    codecs.join(",")
}
