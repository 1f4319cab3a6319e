//! Simulation twin of the segment driver.
//!
//! Runs the exact same scheduling and packet layout as the real driver
//! without touching frame bytes: sizes come from the frame tables plus
//! filter overhead. Used to precompute exact segment sizes and to walk the
//! whole presentation collecting key-frame byte ranges for I-frame
//! playlists.

use std::sync::Arc;

use tracing::debug;

use crate::config::{EncryptionParams, EncryptionType, MuxerConfig};
use crate::crypt::aes_round_up_to_block;
use crate::error::{MuxError, Result};
use crate::filter::{FrameFilter, OutputFrame};
use crate::media::{
    rescale_time, MediaSet, MediaType, SegmentDurations, HLS_DELAY, HLS_TIMESCALE,
};
use crate::muxer::SegmentMuxer;
use crate::queue::{WriteCallback, WriteStatus};

/// One key-frame byte range produced by the I-frame walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IframeRecord {
    /// Zero-based index of the segment holding the key frame.
    pub segment_index: u32,
    /// Display duration until the next key frame, milliseconds.
    pub duration: u64,
    /// Byte offset of the key frame's first transport packet within its
    /// segment.
    pub frame_start: u64,
    /// Byte length of the key frame's transport packets.
    pub frame_size: u64,
}

impl SegmentMuxer {
    /// Run the scheduler over the whole media set and report the exact byte
    /// count the real run will deliver, including the program tables and
    /// cipher-block rounding.
    pub fn simulate_get_segment_size(&mut self) -> Result<u64> {
        self.start_simulated_segment();

        loop {
            let sel = match self.choose_stream()? {
                Some(sel) => sel,
                None => break,
            };
            let set = Arc::clone(&self.media_set);

            let frame = self.streams[sel].cur_frame(&set).clone();
            let cur_frame_dts = {
                let stream = &mut self.streams[sel];
                stream.frame_idx += 1;
                let dts = stream.next_frame_time_offset;
                stream.next_frame_time_offset += frame.duration as u64;
                dts
            };

            self.simulation_flush_delayed_streams(sel, cur_frame_dts);

            let walk_continues = self.streams[sel].media_type.is_some()
                && self.first_clip_track < set.tracks.len()
                && !self.use_discontinuity;
            let last = self.streams[sel].is_exhausted(&set) && !walk_continues;

            let output = OutputFrame {
                pts: cur_frame_dts + frame.pts_delay as u64,
                dts: cur_frame_dts,
                duration: frame.duration,
                key: frame.key_frame,
                size: frame.size,
                header_size: 0,
            };
            let (queue, streams) = (&mut self.queue, &mut self.streams);
            let filter = &mut streams[sel].filter;
            filter.simulated_start_frame(queue, &output);
            filter.simulated_write(queue, frame.size);
            filter.simulated_flush_frame(queue, last);
        }

        let mut segment_size = self.queue.cur_offset;
        if self.encryption_kind == EncryptionType::Aes128 {
            segment_size = aes_round_up_to_block(segment_size);
        }

        debug!(segment_size, "segment size simulated");
        Ok(segment_size)
    }

    /// Rewind every cursor and counter after a simulation pass so the real
    /// run starts from a pristine state.
    pub fn simulation_reset(&mut self) {
        self.queue.simulated_start_segment();

        let set = Arc::clone(&self.media_set);
        if set.clip_count > 1 {
            self.first_clip_track = 0;
            if let Err(e) = self.reinit_tracks() {
                // tracks initialized once already; re-binding them cannot
                // fail on the same media set
                debug!(error = %e, "unexpected reinit failure during reset");
            }
        } else {
            for i in 0..self.streams.len() {
                let cache = self.cache.clone();
                self.streams[i].rewind(&set, cache.as_ref());
            }
        }

        for stream in &mut self.streams {
            stream.filter.reset();
        }
        self.cur = None;
        self.draining = false;
    }

    /// Bound every stream to `segment_end` (in `timescale` units).
    pub(crate) fn set_segment_limit(&mut self, segment_end: u64, timescale: u64) {
        for stream in &mut self.streams {
            stream.segment_limit =
                segment_end * HLS_TIMESCALE / timescale - stream.clip_from_frame_offset;
            stream.is_first_segment_frame = true;
        }
    }

    /// Remove the segment bound: the last segment of a discontinuity group
    /// runs to the end of its clip.
    pub(crate) fn set_segment_limit_unlimited(&mut self) {
        for stream in &mut self.streams {
            stream.segment_limit = u64::MAX;
            stream.is_first_segment_frame = true;
        }
    }

    pub(crate) fn start_simulated_segment(&mut self) {
        self.queue.simulated_start_segment();
        for stream in &mut self.streams {
            stream.filter.mpegts_mut().simulated_start_segment();
        }
        let tables_len = self.program_tables.len() as u64;
        self.queue.simulated_append(tables_len);
    }

    fn simulation_flush_delayed_streams(&mut self, sel: usize, frame_dts: u64) {
        let (queue, streams) = (&mut self.queue, &mut self.streams);
        for (i, stream) in streams.iter_mut().enumerate() {
            if i == sel {
                continue;
            }
            if let Some(buffer) = stream.filter.buffer_mut() {
                if let Some(buffer_dts) = buffer.get_dts() {
                    if frame_dts > buffer_dts + HLS_DELAY / 2 {
                        debug!(buffer_dts, frame_dts, "flushing delayed stream (simulated)");
                        buffer.simulated_force_flush(queue, false);
                    }
                }
            }
        }
    }
}

/// Walk every segment of the presentation and report the byte range and
/// display duration of each video key frame through `callback`.
///
/// Requires simulatable content; SAMPLE-AES and odd NAL length sizes make
/// the transport layout depend on frame bytes and are rejected.
pub fn simulate_get_iframes(
    media_set: Arc<MediaSet>,
    segment_durations: &SegmentDurations,
    conf: &MuxerConfig,
    encryption: &EncryptionParams,
    mut callback: impl FnMut(IframeRecord),
) -> Result<()> {
    let items = &segment_durations.items;
    if items.is_empty() {
        return Ok(());
    }
    let timescale = segment_durations.timescale;

    let null_callback: WriteCallback = Box::new(|_| Ok(WriteStatus::Done));
    let (mut state, simulation_supported) = SegmentMuxer::init_base(
        Arc::clone(&media_set),
        conf,
        encryption,
        0,
        None,
        null_callback,
    )?;

    if !simulation_supported {
        return Err(MuxError::BadRequest(
            "simulation not supported for this media, cannot build an I-frame playlist"
                .to_string(),
        ));
    }

    // first segment's limit
    let mut item_idx = 0usize;
    let mut repeat_count = items[0].repeat_count as i64 - 1;
    let mut segment_end = items[0].duration;
    if repeat_count <= 0 && (items.len() < 2 || items[1].discontinuity) {
        state.set_segment_limit_unlimited();
    } else {
        state.set_segment_limit(segment_end, timescale);
    }
    state.start_simulated_segment();

    let mut segment_index = 0u32;
    let mut frame_start = 0u64;
    let mut frame_size = 0u64;
    let mut frame_start_time = 0u64;
    let mut first_frame_time = 0u64;
    let mut frame_segment_index = 0u32;

    'walk: loop {
        // choose a stream, rolling over segment limits as they exhaust
        let sel = loop {
            match state.choose_stream()? {
                Some(sel) => break sel,
                None => {
                    if repeat_count <= 0 {
                        item_idx += 1;
                        if item_idx >= items.len() {
                            break 'walk;
                        }
                        repeat_count = items[item_idx].repeat_count as i64;
                    }
                    repeat_count -= 1;
                    segment_end += items[item_idx].duration;

                    if repeat_count <= 0
                        && (item_idx + 1 >= items.len() || items[item_idx + 1].discontinuity)
                    {
                        state.set_segment_limit_unlimited();
                    } else {
                        state.set_segment_limit(segment_end, timescale);
                    }

                    state.start_simulated_segment();
                    segment_index += 1;
                }
            }
        };

        let set = Arc::clone(&state.media_set);
        let frame = state.streams[sel].cur_frame(&set).clone();
        let cur_frame_time_offset = {
            let stream = &mut state.streams[sel];
            stream.frame_idx += 1;
            let offset = stream.next_frame_time_offset;
            stream.next_frame_time_offset += frame.duration as u64;
            offset
        };
        let cur_frame_dts = cur_frame_time_offset;

        state.simulation_flush_delayed_streams(sel, cur_frame_dts);

        let walk_continues = state.streams[sel].media_type.is_some()
            && state.first_clip_track < set.tracks.len()
            && !state.use_discontinuity;
        let last_frame = (state.streams[sel].is_exhausted(&set) && !walk_continues)
            || state.streams[sel].next_frame_time_offset >= state.streams[sel].segment_limit;

        let output = OutputFrame {
            pts: cur_frame_time_offset + frame.pts_delay as u64,
            dts: cur_frame_dts,
            duration: frame.duration,
            key: frame.key_frame,
            size: frame.size,
            header_size: 0,
        };
        {
            let (queue, streams) = (&mut state.queue, &mut state.streams);
            let filter = &mut streams[sel].filter;
            filter.simulated_start_frame(queue, &output);
            filter.simulated_write(queue, frame.size);
            filter.simulated_flush_frame(queue, last_frame);
        }

        // only video frames produce byte-range records
        if state.streams[sel].media_type != Some(MediaType::Video) {
            continue;
        }

        {
            let stream = &state.streams[sel];
            if !stream.is_first_segment_frame && stream.prev_key_frame {
                let cur_frame_time = rescale_time(stream.prev_frame_pts, HLS_TIMESCALE, 1000);
                if frame_size != 0 {
                    if cur_frame_time > frame_start_time {
                        callback(IframeRecord {
                            segment_index: frame_segment_index,
                            duration: cur_frame_time - frame_start_time,
                            frame_start,
                            frame_size,
                        });
                    }
                } else {
                    first_frame_time = cur_frame_time;
                }

                let encoder = stream.filter.mpegts();
                frame_start = encoder.last_frame_start_pos;
                frame_size = encoder.last_frame_end_pos - encoder.last_frame_start_pos;
                frame_start_time = cur_frame_time;
                frame_segment_index = segment_index;
            }

            // a key frame closing a segment is recorded from its own range,
            // since no later frame will shift it into "previous" position
            if last_frame && frame.key_frame {
                let cur_frame_time = rescale_time(
                    cur_frame_time_offset + frame.pts_delay as u64,
                    HLS_TIMESCALE,
                    1000,
                );
                if frame_size != 0 {
                    if cur_frame_time > frame_start_time {
                        callback(IframeRecord {
                            segment_index: frame_segment_index,
                            duration: cur_frame_time - frame_start_time,
                            frame_start,
                            frame_size,
                        });
                    }
                } else {
                    first_frame_time = cur_frame_time;
                }

                let encoder = stream.filter.mpegts();
                frame_start = encoder.cur_frame_start_pos;
                frame_size = encoder.cur_frame_end_pos - encoder.cur_frame_start_pos;
                frame_start_time = cur_frame_time;
                frame_segment_index = segment_index;
            }
        }

        let stream = &mut state.streams[sel];
        stream.prev_key_frame = frame.key_frame;
        stream.prev_frame_pts = cur_frame_time_offset + frame.pts_delay as u64;
        stream.is_first_segment_frame = false;
    }

    // final record runs to the end of the presentation
    let end_time = first_frame_time + state.video_duration_millis;
    if frame_size != 0 && end_time > frame_start_time {
        callback(IframeRecord {
            segment_index: frame_segment_index,
            duration: end_time - frame_start_time,
            frame_start,
            frame_size,
        });
    }

    Ok(())
}
