//! # HLS VOD Muxer
//!
//! `hls-vod-mux` is the muxing core of an HLS streaming origin: given a
//! pre-parsed media set (tracks, frame tables, clip list), it produces the
//! bytes of a single MPEG-TS segment on demand through a write callback,
//! optionally AES-128 encrypted, together with the index / master / I-frame
//! `.m3u8` playlists that reference those segments.
//!
//! ## Core Features
//!
//! - **Streaming emission:** frames are scheduled across tracks by decode
//!   timestamp and pumped straight from the frames source into 188-byte
//!   transport packets, with minimal buffering and predictable memory use.
//! - **Byte-exact simulation:** the same scheduler runs without touching
//!   frame bytes to precompute segment sizes and key-frame byte ranges for
//!   I-frame playlists.
//! - **Cooperative suspension:** a cache-backed frames source may report
//!   [`ProcessStatus::Again`]; the host resumes `process` once the backing
//!   I/O completes.
//! - **Multi-clip media:** clip chains are walked transparently within a
//!   segment, or cut at clip boundaries when the media set uses HLS
//!   discontinuities.
//!
//! ## Usage
//!
//! ```ignore
//! let result = SegmentMuxer::init_segment(
//!     media_set,
//!     &MuxerConfig::default(),
//!     &EncryptionParams::default(),
//!     segment_index,
//!     None,
//!     Box::new(|buf| {
//!         response.extend_from_slice(&buf);
//!         Ok(WriteStatus::Done)
//!     }),
//! )?;
//!
//! if let Some(mut muxer) = result.muxer {
//!     while muxer.process()? == ProcessStatus::Again {
//!         wait_for_media_cache();
//!     }
//! }
//! ```

pub(crate) mod filter;
pub(crate) mod queue;

pub mod config;
pub mod crypt;
pub mod error;
pub mod frames;
pub mod media;
pub mod muxer;
pub mod playlist;
pub mod url;

#[cfg(test)]
pub(crate) mod tests;

pub use config::{EncryptionParams, EncryptionType, MuxerConfig, PlaylistConfig, Settings};
pub use error::{MuxError, Result};
pub use filter::TS_PACKET_SIZE;
pub use frames::{CacheFramesSource, FrameRead, FramesSource, MediaCache, MemoryFramesSource};
pub use media::{
    CodecId, FramePart, FramesSourceSpec, InputFrame, MediaInfo, MediaSet, MediaTrack, MediaType,
    SegmentDurationItem, SegmentDurations, HLS_DELAY, HLS_TIMESCALE,
};
pub use muxer::simulation::{simulate_get_iframes, IframeRecord};
pub use muxer::{InitSegmentResult, ProcessStatus, SegmentMuxer};
pub use playlist::{build_iframe_playlist, build_index_playlist, build_master_playlist};
pub use queue::{WriteCallback, WriteStatus};
pub use url::{SegmentUrl, TracksSpec};
