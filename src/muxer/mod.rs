//! Segment muxer: per-stream cursors, the DTS scheduler, and the driver
//! that pumps frame bytes through the filter chains into the write queue.
//!
//! One muxer instance serves one segment request. `init_segment` builds the
//! streams and, when the content supports it, precomputes the exact segment
//! size by running the simulation twin over the same scheduler; `process`
//! then produces the real bytes, suspending with [`ProcessStatus::Again`]
//! whenever the frames source is waiting on backing I/O.

pub mod simulation;

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::config::{EncryptionParams, EncryptionType, MuxerConfig};
use crate::crypt::AesCbcWriter;
use crate::error::{MuxError, Result};
use crate::filter::{
    FrameFilter, InitStreamsState, MpegtsEncoder, OutputFrame, StreamFilter,
};
use crate::frames::{make_source, FrameRead, FramesSource, MediaCache};
use crate::media::{
    hls_rescale_to_millis, FramePart, FramesSourceSpec, InputFrame, MediaSet, MediaType,
    HLS_DELAY,
};
use crate::queue::{SegmentSink, WriteBufferQueue, WriteCallback, WriteStatus};

/// Outcome of one `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The segment is fully delivered.
    Done,
    /// Backing I/O or the write callback is not ready; call `process` again
    /// once the host unblocks it.
    Again,
}

/// Per-track (plus at most one synthetic metadata) stream cursor.
pub(crate) struct StreamState {
    pub media_type: Option<MediaType>,
    /// Track currently bound to this stream; rebound on every clip walk.
    track_idx: usize,
    /// The synthetic metadata stream owns its single frame part.
    own_part: Option<FramePart>,
    pub part_idx: usize,
    pub frame_idx: usize,
    /// Source clip of the current part; `None` for the synthetic stream.
    pub source: Option<u32>,
    pub first_frame_time_offset: u64,
    pub next_frame_time_offset: u64,
    pub clip_from_frame_offset: u64,
    pub segment_limit: u64,
    pub is_first_segment_frame: bool,
    pub prev_key_frame: bool,
    pub prev_frame_pts: u64,
    pub filter: StreamFilter,
    reader: Option<Box<dyn FramesSource>>,
}

impl StreamState {
    fn parts<'a>(&'a self, set: &'a MediaSet) -> &'a [FramePart] {
        match &self.own_part {
            Some(part) => std::slice::from_ref(part),
            None => &set.tracks[self.track_idx].parts,
        }
    }

    fn cur_part<'a>(&'a self, set: &'a MediaSet) -> &'a FramePart {
        &self.parts(set)[self.part_idx]
    }

    fn cur_part_len(&self, set: &MediaSet) -> usize {
        self.cur_part(set).frames.len()
    }

    pub(crate) fn cur_frame<'a>(&'a self, set: &'a MediaSet) -> &'a InputFrame {
        &self.cur_part(set).frames[self.frame_idx]
    }

    /// The frame the cursor rests on, unless the current part is exhausted.
    fn peek_frame<'a>(&'a self, set: &'a MediaSet) -> Option<&'a InputFrame> {
        self.cur_part(set).frames.get(self.frame_idx)
    }

    /// Whether the cursor is past every frame of every part of this track.
    pub(crate) fn is_exhausted(&self, set: &MediaSet) -> bool {
        self.part_idx + 1 >= self.parts(set).len()
            && self.frame_idx >= self.cur_part_len(set)
    }

    fn adopt_part(&mut self, set: &MediaSet, cache: Option<&Arc<MediaCache>>) {
        let (source_clip, reader) = {
            let part = self.cur_part(set);
            (part.source_clip, make_source(&part.source, cache))
        };
        self.source = if self.own_part.is_some() {
            None
        } else {
            Some(source_clip)
        };
        self.reader = Some(reader);
    }

    fn rewind(&mut self, set: &MediaSet, cache: Option<&Arc<MediaCache>>) {
        self.part_idx = 0;
        self.frame_idx = 0;
        self.next_frame_time_offset = self.first_frame_time_offset;
        self.adopt_part(set, cache);
    }
}

/// Result of opening a segment request.
pub struct InitSegmentResult {
    /// Exact byte count the segment will have (after cipher-block rounding),
    /// present when the content supports simulation.
    pub segment_size: Option<u64>,
    /// The PAT and PMT packets that open the segment. Also the first bytes
    /// delivered through the write callback.
    pub response_header: Bytes,
    /// The processor to drive with `process`; `None` when the segment was
    /// already fully delivered (no frames beyond the program tables).
    pub muxer: Option<SegmentMuxer>,
}

/// One in-flight segment production.
pub struct SegmentMuxer {
    media_set: Arc<MediaSet>,
    cache: Option<Arc<MediaCache>>,
    pub(crate) queue: WriteBufferQueue,
    pub(crate) streams: Vec<StreamState>,
    /// Cursor into `media_set.tracks` for the clip walk: index of the first
    /// track of the next clip to bind.
    pub(crate) first_clip_track: usize,
    pub(crate) use_discontinuity: bool,
    first_time: bool,
    last_stream_frame: bool,
    pub(crate) video_duration_millis: u64,
    program_tables: Bytes,
    encryption_kind: EncryptionType,
    /// Index of the stream whose frame is currently being drained.
    cur: Option<usize>,
    draining: bool,
}

impl SegmentMuxer {
    /// Open a segment request: build streams and filters, precompute the
    /// segment size when possible, and emit the program tables.
    pub fn init_segment(
        media_set: Arc<MediaSet>,
        conf: &MuxerConfig,
        encryption: &EncryptionParams,
        segment_index: u32,
        cache: Option<Arc<MediaCache>>,
        write_callback: WriteCallback,
    ) -> Result<InitSegmentResult> {
        let (mut muxer, simulation_supported) = Self::init_base(
            media_set,
            conf,
            encryption,
            segment_index,
            cache,
            write_callback,
        )?;

        let segment_size = if simulation_supported {
            let size = muxer.simulate_get_segment_size()?;
            muxer.simulation_reset();
            Some(size)
        } else {
            None
        };

        let response_header = muxer.program_tables.clone();
        muxer.queue.append(&response_header);

        if muxer.start_frame()? {
            Ok(InitSegmentResult {
                segment_size,
                response_header,
                muxer: Some(muxer),
            })
        } else {
            // no frames: the segment is just the program tables
            muxer.draining = true;
            let muxer = match muxer.process()? {
                ProcessStatus::Done => None,
                ProcessStatus::Again => Some(muxer),
            };
            Ok(InitSegmentResult {
                segment_size,
                response_header,
                muxer,
            })
        }
    }

    pub(crate) fn init_base(
        media_set: Arc<MediaSet>,
        conf: &MuxerConfig,
        encryption: &EncryptionParams,
        segment_index: u32,
        cache: Option<Arc<MediaCache>>,
        write_callback: WriteCallback,
    ) -> Result<(SegmentMuxer, bool)> {
        if !media_set.tracks.is_empty()
            && (media_set.tracks_per_clip == 0
                || media_set.tracks.len() % media_set.tracks_per_clip != 0)
        {
            return Err(MuxError::InvalidMedia(format!(
                "{} tracks do not divide into clips of {}",
                media_set.tracks.len(),
                media_set.tracks_per_clip
            )));
        }
        for track in &media_set.tracks {
            if track.parts.is_empty() {
                return Err(MuxError::InvalidMedia(
                    "track without frame parts".to_string(),
                ));
            }
        }

        let simulation_supported = simulation_supported(&media_set, encryption);

        let sink = match encryption.kind {
            EncryptionType::Aes128 => {
                let (key, iv) = match (&encryption.key, &encryption.iv) {
                    (Some(key), Some(iv)) => (key, iv),
                    _ => {
                        return Err(MuxError::BadRequest(
                            "AES-128 encryption requires a key and an IV".to_string(),
                        ))
                    }
                };
                SegmentSink::Encrypted(AesCbcWriter::new(key, iv, write_callback))
            }
            _ => SegmentSink::plain(write_callback),
        };
        let queue = WriteBufferQueue::new(sink);

        let mut init_streams = InitStreamsState::new(segment_index);
        let first_clip = media_set.first_clip_tracks();
        let pcr_idx = first_clip
            .iter()
            .position(|t| t.media_info.media_type == MediaType::Video)
            .unwrap_or(0);

        let mut muxer = SegmentMuxer {
            media_set: Arc::clone(&media_set),
            cache,
            queue,
            streams: Vec::with_capacity(first_clip.len() + 1),
            first_clip_track: 0,
            use_discontinuity: media_set.use_discontinuity,
            first_time: true,
            last_stream_frame: false,
            video_duration_millis: 0,
            program_tables: Bytes::new(),
            encryption_kind: encryption.kind,
            cur: None,
            draining: false,
        };

        for (i, track) in first_clip.iter().enumerate() {
            let info = &track.media_info;
            let ts_info = init_streams.add_stream(Some(info.media_type), Some(info.codec_id));
            let encoder = MpegtsEncoder::new(
                ts_info,
                Some(info.media_type),
                i == pcr_idx,
                conf.align_frames,
            );
            let filter = StreamFilter::for_track(
                info.media_type,
                info.codec_id,
                conf,
                encryption.kind,
                encoder,
            )?;

            if info.media_type == MediaType::Video
                && info.duration_millis > muxer.video_duration_millis
            {
                muxer.video_duration_millis = info.duration_millis;
            }

            muxer.streams.push(StreamState {
                media_type: Some(info.media_type),
                track_idx: i,
                own_part: None,
                part_idx: 0,
                frame_idx: 0,
                source: None,
                first_frame_time_offset: 0,
                next_frame_time_offset: 0,
                clip_from_frame_offset: 0,
                segment_limit: u64::MAX,
                is_first_segment_frame: false,
                prev_key_frame: false,
                prev_frame_pts: 0,
                filter,
                reader: None,
            });
            muxer.init_track(i, i)?;
        }
        muxer.first_clip_track = media_set.tracks_per_clip;

        // the metadata PID is announced in the PMT whether or not the
        // synthetic stream is enabled for this request
        let id3_info = init_streams.add_stream(None, None);
        if conf.output_id3_timestamps {
            muxer.init_id3_stream(id3_info, conf)?;
        }

        muxer.program_tables = init_streams.finalize();

        if let Some(total) = media_set.total_duration_millis {
            muxer.video_duration_millis = total;
        }

        debug!(
            set_id = %media_set.set_id,
            segment_index,
            streams = muxer.streams.len(),
            simulation_supported,
            "segment muxer initialized"
        );

        Ok((muxer, simulation_supported))
    }

    fn init_track(&mut self, stream_idx: usize, track_idx: usize) -> Result<()> {
        let set = Arc::clone(&self.media_set);
        let track = &set.tracks[track_idx];
        let stream = &mut self.streams[stream_idx];

        stream.track_idx = track_idx;
        stream.first_frame_time_offset = track.first_frame_dts();
        stream.clip_from_frame_offset = track.clip_from_frame_offset;
        stream.filter.set_media_info(&track.media_info)?;
        stream.rewind(&set, self.cache.as_ref());
        Ok(())
    }

    fn init_id3_stream(
        &mut self,
        ts_info: crate::filter::TsStreamInfo,
        conf: &MuxerConfig,
    ) -> Result<()> {
        // reference the stream holding the earliest frame; without any frames
        // there is no timestamp worth emitting
        let reference = match self
            .streams
            .iter()
            .filter(|s| s.peek_frame(&self.media_set).is_some())
            .min_by_key(|s| s.next_frame_time_offset)
        {
            Some(stream) => (
                stream.first_frame_time_offset,
                stream.next_frame_time_offset,
                stream.clip_from_frame_offset,
            ),
            None => return Ok(()),
        };

        let timestamp = hls_rescale_to_millis(reference.0);
        let mut payload = serde_json::json!({ "timestamp": timestamp })
            .to_string()
            .into_bytes();
        payload.push(0); // terminator
        let size = payload.len() as u32;

        let encoder = MpegtsEncoder::new(ts_info, None, false, conf.align_frames);
        let own_part = FramePart {
            frames: vec![InputFrame {
                size,
                duration: 0,
                pts_delay: 0,
                key_frame: true,
                offset: 0,
            }],
            source_clip: 0,
            source: FramesSourceSpec::Memory {
                data: Bytes::from(payload),
            },
        };

        let mut stream = StreamState {
            media_type: None,
            track_idx: 0,
            own_part: Some(own_part),
            part_idx: 0,
            frame_idx: 0,
            source: None,
            first_frame_time_offset: reference.0,
            next_frame_time_offset: reference.1,
            clip_from_frame_offset: reference.2,
            segment_limit: u64::MAX,
            is_first_segment_frame: false,
            prev_key_frame: false,
            prev_frame_pts: 0,
            filter: StreamFilter::for_id3(encoder),
            reader: None,
        };
        let set = Arc::clone(&self.media_set);
        stream.adopt_part(&set, self.cache.as_ref());
        self.streams.push(stream);
        Ok(())
    }

    /// Rebind every media stream to the next clip's tracks.
    pub(crate) fn reinit_tracks(&mut self) -> Result<()> {
        self.first_time = true;

        let mut track = self.first_clip_track;
        for i in 0..self.streams.len() {
            if self.streams[i].media_type.is_none() {
                continue;
            }
            self.init_track(i, track)?;
            track += 1;
        }
        self.first_clip_track = track;

        debug!(next_clip_track = track, "walked to next clip");
        Ok(())
    }

    /// Pick the stream holding the earliest frame below its segment limit,
    /// walking the clip list when the current clip is exhausted. Ties go to
    /// the stream registered first.
    pub(crate) fn choose_stream(&mut self) -> Result<Option<usize>> {
        let set = Arc::clone(&self.media_set);
        loop {
            let mut has_frames = false;
            let mut min: Option<(usize, u64)> = None;

            for i in 0..self.streams.len() {
                {
                    let stream = &mut self.streams[i];
                    while stream.frame_idx >= stream.cur_part_len(&set) {
                        if stream.part_idx + 1 >= stream.parts(&set).len() {
                            break;
                        }
                        stream.part_idx += 1;
                        stream.frame_idx = 0;
                        stream.adopt_part(&set, self.cache.as_ref());
                        // a fresh part means a fresh frames source; force a
                        // queue send on its first inevitable suspension
                        self.first_time = true;
                    }
                    if stream.frame_idx >= stream.cur_part_len(&set) {
                        continue;
                    }
                }

                has_frames = true;

                let stream = &self.streams[i];
                if stream.next_frame_time_offset >= stream.segment_limit {
                    continue;
                }
                if min.map_or(true, |(_, dts)| stream.next_frame_time_offset < dts) {
                    min = Some((i, stream.next_frame_time_offset));
                }
            }

            if let Some((i, _)) = min {
                return Ok(Some(i));
            }

            if self.first_clip_track >= set.tracks.len() || has_frames {
                return Ok(None);
            }

            self.reinit_tracks()?;

            if self.use_discontinuity {
                // the rest of the media belongs to the next segment
                return Ok(None);
            }
        }
    }

    /// Select and open the next frame. Returns `false` when the scheduler
    /// is exhausted.
    fn start_frame(&mut self) -> Result<bool> {
        let sel = match self.choose_stream()? {
            Some(sel) => sel,
            None => return Ok(false),
        };
        let set = Arc::clone(&self.media_set);

        let frame = self.streams[sel].cur_frame(&set).clone();
        let (cur_frame_dts, sel_source) = {
            let stream = &mut self.streams[sel];
            stream.frame_idx += 1;
            let dts = stream.next_frame_time_offset;
            stream.next_frame_time_offset += frame.duration as u64;
            (dts, stream.source)
        };

        // A frame is last-in-stream only when the whole part chain is done
        // and no further clips will rebind this stream (the synthetic
        // metadata stream never takes part in the clip walk).
        let walk_continues = self.streams[sel].media_type.is_some()
            && self.first_clip_track < set.tracks.len()
            && !self.use_discontinuity;
        self.last_stream_frame = self.streams[sel].is_exhausted(&set) && !walk_continues;

        let mut min_offset = u64::MAX;
        {
            let (queue, streams) = (&mut self.queue, &mut self.streams);
            for (i, stream) in streams.iter_mut().enumerate() {
                if i == sel {
                    continue;
                }

                // flush buffered audio once it lags the current frame too far
                if let Some(buffer) = stream.filter.buffer_mut() {
                    if let Some(buffer_dts) = buffer.get_dts() {
                        if cur_frame_dts > buffer_dts + HLS_DELAY / 2 {
                            debug!(buffer_dts, cur_frame_dts, "flushing delayed stream");
                            buffer.force_flush(queue, false)?;
                        }
                    }
                }

                if stream.source == sel_source && stream.source.is_some() {
                    if let Some(pending) = stream.peek_frame(&set) {
                        min_offset = min_offset.min(pending.offset);
                    }
                }
            }
        }

        let output = OutputFrame {
            pts: cur_frame_dts + frame.pts_delay as u64,
            dts: cur_frame_dts,
            duration: frame.duration,
            key: frame.key_frame,
            size: frame.size,
            header_size: 0,
        };

        let (queue, streams) = (&mut self.queue, &mut self.streams);
        let stream = &mut streams[sel];
        match stream.reader.as_mut() {
            Some(reader) => reader.start_frame(&frame, min_offset)?,
            None => {
                return Err(MuxError::Unexpected(
                    "stream has no frames source".to_string(),
                ))
            }
        }
        stream.filter.start_frame(queue, &output)?;

        self.cur = Some(sel);
        Ok(true)
    }

    /// Drive the segment: read frame bytes, push them through the filter
    /// chains, and publish queue buffers. Suspends with `Again` when the
    /// frames source is waiting on backing I/O or the callback pushed back.
    pub fn process(&mut self) -> Result<ProcessStatus> {
        if self.draining {
            return self.finish();
        }

        let mut wrote_data = false;
        loop {
            let cur = match self.cur {
                Some(cur) => cur,
                None => {
                    return Err(MuxError::Unexpected(
                        "process called without a current frame".to_string(),
                    ))
                }
            };

            let read = match self.streams[cur].reader.as_mut() {
                Some(reader) => reader.read()?,
                None => {
                    return Err(MuxError::Unexpected(
                        "stream has no frames source".to_string(),
                    ))
                }
            };

            match read {
                FrameRead::Again => {
                    if !wrote_data && !self.first_time {
                        return Err(MuxError::BadData(
                            "no data was handled, probably a truncated file".to_string(),
                        ));
                    }
                    self.send()?;
                    self.first_time = false;
                    return Ok(ProcessStatus::Again);
                }
                FrameRead::Data { data, frame_done } => {
                    wrote_data = true;

                    let (queue, streams) = (&mut self.queue, &mut self.streams);
                    streams[cur].filter.write(queue, &data)?;

                    if frame_done {
                        let last = self.last_stream_frame;
                        let (queue, streams) = (&mut self.queue, &mut self.streams);
                        streams[cur].filter.flush_frame(queue, last)?;

                        if !self.start_frame()? {
                            break;
                        }
                    }
                }
            }
        }

        self.draining = true;
        self.finish()
    }

    fn finish(&mut self) -> Result<ProcessStatus> {
        match self.queue.flush()? {
            WriteStatus::Done => Ok(ProcessStatus::Done),
            WriteStatus::Again => Ok(ProcessStatus::Again),
        }
    }

    /// Publish every queue buffer all packetizers are past.
    fn send(&mut self) -> Result<WriteStatus> {
        let mut min_offset = self.queue.cur_offset;
        for stream in &self.streams {
            min_offset = min_offset.min(stream.filter.mpegts().send_queue_offset);
        }
        self.queue.send(min_offset)
    }
}

/// Whether segment sizes can be computed without reading frame bytes.
///
/// Sample-AES inserts emulation-prevention bytes whose count depends on the
/// payload, and video tracks must use 4-byte NAL length prefixes so start
/// codes replace them one for one.
fn simulation_supported(media_set: &MediaSet, encryption: &EncryptionParams) -> bool {
    use crate::filter::Mp4ToAnnexb;

    if encryption.kind == EncryptionType::SampleAes {
        return false;
    }
    media_set
        .tracks
        .iter()
        .filter(|t| t.media_info.media_type == MediaType::Video)
        .all(|t| Mp4ToAnnexb::simulation_supported(&t.media_info))
}
