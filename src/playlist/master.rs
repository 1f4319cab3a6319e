//! Master playlist generator
//!
//! Builds `#EXT-X-STREAM-INF` variants over the first clip's tracks, with
//! muxed video+audio preferred and additional audio tracks exposed as an
//! alternative-audio rendition group.

use crate::config::PlaylistConfig;
use crate::error::{MuxError, Result};
use crate::media::{MediaInfo, MediaSet, MediaType};
use crate::playlist::codec::build_codec_attribute;
use crate::url::{index_playlist_name, TracksSpec};

pub fn build_master_playlist(
    conf: &PlaylistConfig,
    base_url: &str,
    media_set: &MediaSet,
) -> Result<String> {
    let tracks = media_set.first_clip_tracks();
    let videos: Vec<&MediaInfo> = tracks
        .iter()
        .map(|t| &t.media_info)
        .filter(|i| i.media_type == MediaType::Video)
        .collect();
    let audios: Vec<&MediaInfo> = tracks
        .iter()
        .map(|t| &t.media_info)
        .filter(|i| i.media_type == MediaType::Audio)
        .collect();

    if videos.is_empty() && audios.is_empty() {
        return Err(MuxError::Playlist(
            "media set has no tracks to build a master playlist from".to_string(),
        ));
    }

    let alternative_audio = audios.len() > 1;
    let mut output = String::new();
    output.push_str("#EXTM3U\n");

    if alternative_audio {
        output.push('\n');
        for (n, audio) in audios.iter().enumerate() {
            let language = audio.language.as_deref().unwrap_or("und");
            let name = audio
                .label
                .clone()
                .unwrap_or_else(|| format!("Audio {}", n + 1));
            let default = if n == 0 {
                "AUTOSELECT=YES,DEFAULT=YES"
            } else {
                "AUTOSELECT=NO,DEFAULT=NO"
            };
            output.push_str(&format!(
                "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",LANGUAGE=\"{}\",NAME=\"{}\",{},URI=\"{}{}\"\n",
                language,
                name,
                default,
                base_url,
                index_playlist_name(
                    &conf.index_file_name_prefix,
                    &TracksSpec::audio_only(n as u32 + 1)
                ),
            ));
        }
        output.push('\n');
    }

    if !videos.is_empty() {
        for (n, &video) in videos.iter().enumerate() {
            let audio = audios.first().copied();
            let bandwidth = video.bitrate + audio.map_or(0, |a| a.bitrate);
            let codecs = build_codec_attribute(Some(video), audio);

            output.push_str(&format!(
                "#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH={},RESOLUTION={}x{},CODECS=\"{}\"",
                bandwidth, video.width, video.height, codecs
            ));
            if alternative_audio {
                output.push_str(",AUDIO=\"audio\"");
            }
            output.push('\n');

            let tracks_spec = if audio.is_some() {
                TracksSpec::muxed(n as u32 + 1, 1)
            } else {
                TracksSpec::video_only(n as u32 + 1)
            };
            output.push_str(base_url);
            output.push_str(&index_playlist_name(&conf.index_file_name_prefix, &tracks_spec));
            output.push('\n');
        }
    } else {
        for (n, &audio) in audios.iter().enumerate() {
            let codecs = build_codec_attribute(None, Some(audio));
            output.push_str(&format!(
                "#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH={},CODECS=\"{}\"",
                audio.bitrate, codecs
            ));
            if alternative_audio {
                output.push_str(",AUDIO=\"audio\"");
            }
            output.push('\n');
            output.push_str(base_url);
            output.push_str(&index_playlist_name(
                &conf.index_file_name_prefix,
                &TracksSpec::audio_only(n as u32 + 1),
            ));
            output.push('\n');
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CodecId, FramePart, FramesSourceSpec, MediaTrack};
    use bytes::Bytes;

    fn track(media_type: MediaType, codec_id: CodecId, language: Option<&str>) -> MediaTrack {
        MediaTrack {
            media_info: MediaInfo {
                media_type,
                codec_id,
                duration_millis: 10_000,
                bitrate: if media_type == MediaType::Video {
                    2_000_000
                } else {
                    128_000
                },
                extradata: if media_type == MediaType::Video {
                    Bytes::from_static(&[0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE0, 0x00])
                } else {
                    Bytes::from_static(&[0x11, 0x90])
                },
                width: 1920,
                height: 1080,
                sample_rate: 48_000,
                channels: 2,
                language: language.map(str::to_string),
                label: language.map(|l| format!("Audio ({})", l)),
            },
            parts: vec![FramePart {
                frames: Vec::new(),
                source_clip: 0,
                source: FramesSourceSpec::Memory { data: Bytes::new() },
            }],
            clip_start_time: 0,
            first_frame_time_offset: 0,
            clip_from_frame_offset: 0,
        }
    }

    #[test]
    fn test_muxed_variant() {
        let set = MediaSet::new(
            vec![
                track(MediaType::Video, CodecId::H264, None),
                track(MediaType::Audio, CodecId::Aac, Some("en")),
            ],
            2,
        );
        let playlist =
            build_master_playlist(&PlaylistConfig::default(), "", &set).unwrap();

        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains(
            "#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH=2128000,RESOLUTION=1920x1080,CODECS=\"avc1.64001f,mp4a.40.2\"\n"
        ));
        assert!(playlist.contains("index-v1-a1.m3u8\n"));
        assert!(!playlist.contains("#EXT-X-MEDIA"));
    }

    #[test]
    fn test_alternative_audio_renditions() {
        let set = MediaSet::new(
            vec![
                track(MediaType::Video, CodecId::H264, None),
                track(MediaType::Audio, CodecId::Aac, Some("en")),
                track(MediaType::Audio, CodecId::Aac, Some("fr")),
            ],
            3,
        );
        let playlist =
            build_master_playlist(&PlaylistConfig::default(), "http://cdn/", &set).unwrap();

        assert!(playlist.contains(
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",LANGUAGE=\"en\",NAME=\"Audio (en)\",AUTOSELECT=YES,DEFAULT=YES,URI=\"http://cdn/index-a1.m3u8\"\n"
        ));
        assert!(playlist.contains(
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",LANGUAGE=\"fr\",NAME=\"Audio (fr)\",AUTOSELECT=NO,DEFAULT=NO,URI=\"http://cdn/index-a2.m3u8\"\n"
        ));
        assert!(playlist.contains(",AUDIO=\"audio\"\n"));
    }

    #[test]
    fn test_audio_only_variant() {
        let set = MediaSet::new(vec![track(MediaType::Audio, CodecId::Aac, Some("en"))], 1);
        let playlist =
            build_master_playlist(&PlaylistConfig::default(), "", &set).unwrap();

        assert!(playlist
            .contains("#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH=128000,CODECS=\"mp4a.40.2\"\n"));
        assert!(playlist.contains("index-a1.m3u8\n"));
    }

    #[test]
    fn test_empty_set_is_error() {
        let set = MediaSet::new(Vec::new(), 0);
        assert!(build_master_playlist(&PlaylistConfig::default(), "", &set).is_err());
    }
}
