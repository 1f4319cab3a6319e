//! Playlist generation module
//!
//! This module handles HLS playlist generation:
//! - Index playlist with one segment URL per table entry
//! - Master playlist with variants and alternative audio renditions
//! - I-frame playlist built from simulated key-frame byte ranges
//! - Codec strings for the CODECS attribute

pub mod codec;
pub mod iframe;
pub mod index;
pub mod master;

pub use iframe::build_iframe_playlist;
pub use index::build_index_playlist;
pub use master::build_master_playlist;
