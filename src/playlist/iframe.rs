//! I-frame playlist generator
//!
//! Runs the muxing simulation over every segment and renders one
//! `#EXT-X-BYTERANGE` entry per video key frame. Encrypted output is
//! rejected: under AES-128 the cipher-block/IV mapping of an arbitrary byte
//! range is not expressible, and under SAMPLE-AES the transport layout is
//! not even known in advance.

use std::sync::Arc;

use crate::config::{EncryptionParams, MuxerConfig, PlaylistConfig};
use crate::error::{MuxError, Result};
use crate::media::{rescale_time, MediaSet, SegmentDurations};
use crate::muxer::simulation::simulate_get_iframes;
use crate::url::{SegmentUrl, TracksSpec};

pub fn build_iframe_playlist(
    conf: &PlaylistConfig,
    muxer_conf: &MuxerConfig,
    base_url: &str,
    encryption: &EncryptionParams,
    media_set: Arc<MediaSet>,
    segment_durations: &SegmentDurations,
    tracks: &TracksSpec,
) -> Result<String> {
    if encryption.is_encrypted() {
        return Err(MuxError::BadRequest(
            "I-frame playlists cannot reference encrypted segments".to_string(),
        ));
    }

    // per-segment (start_time, duration) in playlist milliseconds, indexed
    // in walk order, so byte-range URLs name the same files as the index
    // playlist
    let mut segments: Vec<(u64, u64)> = Vec::with_capacity(segment_durations.segment_count as usize);
    let mut dts_start = segment_durations.start_time;
    for item in &segment_durations.items {
        let duration_millis = rescale_time(item.duration, segment_durations.timescale, 1000);
        for _ in 0..item.repeat_count {
            segments.push((dts_start, duration_millis));
            dts_start += duration_millis;
        }
    }

    let mut output = String::new();
    output.push_str("#EXTM3U\n");
    output.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        (segment_durations.max_duration_millis() + 999) / 1000
    ));
    output.push_str("#EXT-X-ALLOW-CACHE:YES\n");
    output.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    output.push_str("#EXT-X-VERSION:4\n");
    output.push_str("#EXT-X-MEDIA-SEQUENCE:1\n");
    output.push_str("#EXT-X-I-FRAMES-ONLY\n");

    let mut walk_error = None;
    simulate_get_iframes(
        media_set,
        segment_durations,
        muxer_conf,
        &EncryptionParams::default(),
        |record| {
            let (start_time, duration_millis) = match segments.get(record.segment_index as usize)
            {
                Some(segment) => *segment,
                None => {
                    walk_error = Some(record.segment_index);
                    return;
                }
            };
            let url = SegmentUrl {
                prefix: conf.segment_file_name_prefix.clone(),
                dts_start: start_time,
                duration_millis,
                segment_index: record.segment_index,
                tracks: tracks.clone(),
            };
            output.push_str(&format!(
                "#EXTINF:{}.{:03},\n",
                record.duration / 1000,
                record.duration % 1000
            ));
            output.push_str(&format!(
                "#EXT-X-BYTERANGE:{}@{}\n",
                record.frame_size, record.frame_start
            ));
            output.push_str(base_url);
            output.push_str(&url.to_string());
            output.push('\n');
        },
    )?;

    if let Some(index) = walk_error {
        return Err(MuxError::Unexpected(format!(
            "I-frame walk produced segment index {} beyond the duration table",
            index
        )));
    }

    output.push_str("#EXT-X-ENDLIST\n");
    Ok(output)
}
