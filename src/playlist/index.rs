//! Index playlist generator
//!
//! Renders the per-variant media playlist: header tags, one `#EXTINF` and
//! segment URL per table entry, discontinuity tags between clip groups, and
//! the encryption key tag when the segments are encrypted.

use crate::config::{EncryptionParams, EncryptionType, PlaylistConfig};
use crate::error::Result;
use crate::media::{rescale_time, MediaSet, SegmentDurations};
use crate::url::{SegmentUrl, TracksSpec};

/// Generate the index playlist for one variant.
///
/// `base_url` prefixes the derived encryption key URI; `segments_base_url`
/// prefixes every segment URL.
pub fn build_index_playlist(
    conf: &PlaylistConfig,
    base_url: &str,
    segments_base_url: &str,
    encryption: &EncryptionParams,
    media_set: &MediaSet,
    segment_durations: &SegmentDurations,
    tracks: &TracksSpec,
) -> Result<String> {
    let version = conf.m3u8_version(encryption.kind);
    let mut output = String::new();

    // Header
    output.push_str("#EXTM3U\n");
    output.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        (segment_durations.max_duration_millis() + 999) / 1000
    ));
    output.push_str("#EXT-X-ALLOW-CACHE:YES\n");
    output.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");

    if encryption.kind != EncryptionType::None {
        push_key_tag(&mut output, conf, base_url, encryption);
    }

    output.push_str(&format!("#EXT-X-VERSION:{}\n", version));
    output.push_str(&format!(
        "#EXT-X-MEDIA-SEQUENCE:{}\n",
        media_set.initial_segment_index + 1
    ));

    // Segment entries. The URL start-time accumulator runs in playlist
    // milliseconds end to end; 64 bits keeps long VOD from drifting.
    let mut dts_start: u64 = segment_durations.start_time;

    for item in &segment_durations.items {
        if item.discontinuity {
            output.push_str("#EXT-X-DISCONTINUITY\n");
        }

        let duration_millis = rescale_time(item.duration, segment_durations.timescale, 1000);
        let extinf = format_extinf(item.duration, segment_durations.timescale, version);

        for repeat in 0..item.repeat_count {
            let url = SegmentUrl {
                prefix: conf.segment_file_name_prefix.clone(),
                dts_start,
                duration_millis,
                segment_index: item.segment_index + repeat,
                tracks: tracks.clone(),
            };
            output.push_str(&extinf);
            output.push_str(segments_base_url);
            output.push_str(&url.to_string());
            output.push('\n');
            dts_start += duration_millis;
        }
    }

    if media_set.presentation_end {
        output.push_str("#EXT-X-ENDLIST\n");
    }

    Ok(output)
}

fn format_extinf(duration: u64, timescale: u64, version: u32) -> String {
    if version >= 3 {
        let millis = rescale_time(duration, timescale, 1000);
        format!("#EXTINF:{}.{:03},\n", millis / 1000, millis % 1000)
    } else {
        format!("#EXTINF:{},\n", rescale_time(duration, timescale, 1))
    }
}

fn push_key_tag(
    output: &mut String,
    conf: &PlaylistConfig,
    base_url: &str,
    encryption: &EncryptionParams,
) {
    let method = match encryption.kind {
        EncryptionType::SampleAes => "SAMPLE-AES",
        _ => "AES-128",
    };
    output.push_str(&format!("#EXT-X-KEY:METHOD={},URI=\"", method));
    match &encryption.key_uri {
        Some(uri) => output.push_str(uri),
        None => {
            output.push_str(base_url);
            output.push_str(&conf.encryption_key_file_name);
            output.push_str(".key");
        }
    }
    output.push('"');
    if !conf.encryption_key_format.is_empty() {
        output.push_str(&format!(",KEYFORMAT=\"{}\"", conf.encryption_key_format));
    }
    if !conf.encryption_key_format_versions.is_empty() {
        output.push_str(&format!(
            ",KEYFORMATVERSIONS=\"{}\"",
            conf.encryption_key_format_versions
        ));
    }
    output.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaSet, SegmentDurationItem};

    fn durations() -> SegmentDurations {
        SegmentDurations {
            timescale: 1000,
            items: vec![
                SegmentDurationItem {
                    duration: 4000,
                    repeat_count: 2,
                    discontinuity: false,
                    segment_index: 0,
                },
                SegmentDurationItem {
                    duration: 2500,
                    repeat_count: 1,
                    discontinuity: true,
                    segment_index: 2,
                },
            ],
            start_time: 0,
            end_time: 10_500,
            segment_count: 3,
        }
    }

    fn media_set() -> MediaSet {
        MediaSet::new(Vec::new(), 0)
    }

    #[test]
    fn test_basic_playlist() {
        let playlist = build_index_playlist(
            &PlaylistConfig::default(),
            "",
            "",
            &EncryptionParams::default(),
            &media_set(),
            &durations(),
            &TracksSpec::muxed(1, 1),
        )
        .unwrap();

        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:4\n"));
        assert!(playlist.contains("#EXT-X-VERSION:3\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:1\n"));
        assert!(playlist.contains("#EXTINF:4.000,\nseg-0-4000-1-v1-a1.ts\n"));
        assert!(playlist.contains("#EXTINF:4.000,\nseg-4000-4000-2-v1-a1.ts\n"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY\n#EXTINF:2.500,\nseg-8000-2500-3-v1-a1.ts\n"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_segment_urls_accumulate_start_time() {
        let playlist = build_index_playlist(
            &PlaylistConfig::default(),
            "",
            "http://cdn/",
            &EncryptionParams::default(),
            &media_set(),
            &durations(),
            &TracksSpec::default(),
        )
        .unwrap();

        let urls: Vec<&str> = playlist
            .lines()
            .filter(|line| line.ends_with(".ts"))
            .collect();
        assert_eq!(
            urls,
            vec![
                "http://cdn/seg-0-4000-1.ts",
                "http://cdn/seg-4000-4000-2.ts",
                "http://cdn/seg-8000-2500-3.ts",
            ]
        );
    }

    #[test]
    fn test_aes_key_tag() {
        let encryption = EncryptionParams {
            kind: EncryptionType::Aes128,
            key: Some([0u8; 16]),
            iv: Some([0u8; 16]),
            key_uri: None,
        };
        let playlist = build_index_playlist(
            &PlaylistConfig::default(),
            "http://origin/movie/",
            "",
            &encryption,
            &media_set(),
            &durations(),
            &TracksSpec::default(),
        )
        .unwrap();

        assert!(playlist
            .contains("#EXT-X-KEY:METHOD=AES-128,URI=\"http://origin/movie/encryption.key\"\n"));
        assert!(playlist.contains("#EXT-X-VERSION:3\n"));
    }

    #[test]
    fn test_sample_aes_bumps_version() {
        let encryption = EncryptionParams {
            kind: EncryptionType::SampleAes,
            key: Some([0u8; 16]),
            iv: Some([0u8; 16]),
            key_uri: Some("skd://key42".to_string()),
        };
        let playlist = build_index_playlist(
            &PlaylistConfig::default(),
            "",
            "",
            &encryption,
            &media_set(),
            &durations(),
            &TracksSpec::default(),
        )
        .unwrap();

        assert!(playlist.contains("#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://key42\"\n"));
        assert!(playlist.contains("#EXT-X-VERSION:5\n"));
    }

    #[test]
    fn test_open_presentation_has_no_endlist() {
        let mut set = media_set();
        set.presentation_end = false;
        let playlist = build_index_playlist(
            &PlaylistConfig::default(),
            "",
            "",
            &EncryptionParams::default(),
            &set,
            &durations(),
            &TracksSpec::default(),
        )
        .unwrap();
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
    }
}
