//! Cache-backed frames source.
//!
//! The muxer shares a [`MediaCache`] with the host: a concurrent map from
//! source id to loaded bytes. When a frame's backing bytes are missing the
//! source records a load request (keyed by source id, carrying the smallest
//! offset any stream still needs, so the host can coalesce adjacent reads)
//! and reports [`FrameRead::Again`]. The host loads the bytes, inserts them,
//! and resumes the segment-produce loop; `readiness` lets an async host
//! await insertion instead of polling.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::{MuxError, Result};
use crate::frames::{FrameRead, FramesSource};
use crate::media::InputFrame;

/// How many bytes a single cache `read` yields at most.
const READ_CHUNK_SIZE: u32 = 64 * 1024;

/// Shared store of loaded source bytes, filled by the host.
#[derive(Default)]
pub struct MediaCache {
    entries: DashMap<String, Bytes>,
    /// Outstanding load requests: source id -> smallest offset needed.
    wanted: DashMap<String, u64>,
    notify: Notify,
}

impl MediaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently loaded for `source_id`.
    pub fn get(&self, source_id: &str) -> Option<Bytes> {
        self.entries.get(source_id).map(|entry| entry.clone())
    }

    /// Install (or extend) the loaded bytes for a source and wake waiters.
    pub fn insert(&self, source_id: &str, data: Bytes) {
        self.entries.insert(source_id.to_string(), data);
        self.wanted.remove(source_id);
        self.notify.notify_waiters();
    }

    /// Outstanding load requests as `(source_id, min_offset)` pairs.
    pub fn pending_requests(&self) -> Vec<(String, u64)> {
        self.wanted
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Notified whenever new bytes are inserted.
    pub fn readiness(&self) -> &Notify {
        &self.notify
    }

    fn request(&self, source_id: &str, min_offset: u64) {
        self.wanted
            .entry(source_id.to_string())
            .and_modify(|offset| *offset = (*offset).min(min_offset))
            .or_insert(min_offset);
    }
}

struct CurrentFrame {
    offset: u64,
    size: u32,
    pos: u32,
    min_offset_hint: u64,
}

/// Serves frames out of a [`MediaCache`], chunking reads and suspending
/// while the backing bytes are not loaded yet.
pub struct CacheFramesSource {
    cache: Arc<MediaCache>,
    source_id: String,
    cur: Option<CurrentFrame>,
}

impl CacheFramesSource {
    pub fn new(cache: Arc<MediaCache>, source_id: String) -> Self {
        Self {
            cache,
            source_id,
            cur: None,
        }
    }
}

impl FramesSource for CacheFramesSource {
    fn start_frame(&mut self, frame: &InputFrame, min_offset_hint: u64) -> Result<()> {
        let hint = min_offset_hint.min(frame.offset);
        self.cur = Some(CurrentFrame {
            offset: frame.offset,
            size: frame.size,
            pos: 0,
            min_offset_hint: hint,
        });
        Ok(())
    }

    fn read(&mut self) -> Result<FrameRead> {
        let cur = self.cur.as_mut().ok_or_else(|| {
            MuxError::Unexpected("read without a started frame".to_string())
        })?;

        let end = cur.offset + cur.size as u64;
        let data = match self.cache.get(&self.source_id) {
            Some(data) if data.len() as u64 >= end => data,
            _ => {
                // not loaded (or only partially loaded) yet
                self.cache.request(&self.source_id, cur.min_offset_hint);
                return Ok(FrameRead::Again);
            }
        };

        let chunk_start = cur.offset + cur.pos as u64;
        let chunk_len = (cur.size - cur.pos).min(READ_CHUNK_SIZE);
        cur.pos += chunk_len;
        let frame_done = cur.pos >= cur.size;
        if frame_done {
            self.cur = None;
        }

        Ok(FrameRead::Data {
            data: data.slice(chunk_start as usize..(chunk_start + chunk_len as u64) as usize),
            frame_done,
        })
    }
}
