//! Frame payload readers.
//!
//! The muxer never owns frame bytes; it opens one frame at a time through a
//! [`FramesSource`] and pumps whatever `read` yields into the stream's
//! filter chain. The memory source serves a resident buffer in one read; the
//! cache source serves chunks out of a host-filled [`MediaCache`] and
//! suspends the segment-produce loop with [`FrameRead::Again`] while the
//! backing bytes are still being loaded.

pub mod cache;
pub mod memory;

pub use cache::{CacheFramesSource, MediaCache};
pub use memory::MemoryFramesSource;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::media::{FramesSourceSpec, InputFrame};

/// One step of reading the current frame.
#[derive(Debug, Clone)]
pub enum FrameRead {
    Data {
        data: Bytes,
        /// Whether this chunk completes the frame.
        frame_done: bool,
    },
    /// Backing I/O has not caught up; suspend and retry later.
    Again,
}

/// Reader over one frame's payload at a time.
pub trait FramesSource {
    /// Position on `frame`. `min_offset_hint` is the smallest pending frame
    /// offset among all streams sharing this source clip, so a cache-backed
    /// implementation can coalesce loads for adjacent frames.
    fn start_frame(&mut self, frame: &InputFrame, min_offset_hint: u64) -> Result<()>;

    /// Yield the next chunk of the current frame.
    fn read(&mut self) -> Result<FrameRead>;
}

/// Instantiate the reader for a frame part's source spec.
pub fn make_source(
    spec: &FramesSourceSpec,
    cache: Option<&Arc<MediaCache>>,
) -> Box<dyn FramesSource> {
    match spec {
        FramesSourceSpec::Memory { data } => Box::new(MemoryFramesSource::new(data.clone())),
        FramesSourceSpec::Cached { source_id } => {
            let cache = cache.cloned().unwrap_or_default();
            Box::new(CacheFramesSource::new(cache, source_id.clone()))
        }
    }
}
