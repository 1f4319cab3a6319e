//! Muxer and playlist configuration

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};

/// Muxer tuning options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    /// Interleave audio frames with video at frame granularity instead of
    /// batching audio into delay-bounded PES payloads
    pub interleave_frames: bool,

    /// Pad the last transport packet of every PES with adaptation-field
    /// stuffing instead of letting the next PES continue mid-packet
    pub align_frames: bool,

    /// Append a synthetic timed-metadata stream carrying the first frame
    /// timestamp as an ID3 JSON payload
    pub output_id3_timestamps: bool,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            interleave_frames: false,
            align_frames: true,
            output_id3_timestamps: false,
        }
    }
}

/// Playlist generation options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistConfig {
    /// File name prefix for segment URLs
    pub segment_file_name_prefix: String,

    /// File name prefix for index playlist URLs
    pub index_file_name_prefix: String,

    /// File name of the encryption key, used when no explicit key URI is
    /// configured on the request
    pub encryption_key_file_name: String,

    /// Value of the KEYFORMAT attribute of `#EXT-X-KEY`; empty to omit
    pub encryption_key_format: String,

    /// Value of the KEYFORMATVERSIONS attribute of `#EXT-X-KEY`; empty to omit
    pub encryption_key_format_versions: String,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            segment_file_name_prefix: "seg".to_string(),
            index_file_name_prefix: "index".to_string(),
            encryption_key_file_name: "encryption".to_string(),
            encryption_key_format: String::new(),
            encryption_key_format_versions: String::new(),
        }
    }
}

impl PlaylistConfig {
    /// Playlist protocol version. Version 5 is required for SAMPLE-AES and
    /// for custom key formats; everything else is expressible in version 3.
    pub fn m3u8_version(&self, encryption: EncryptionType) -> u32 {
        if encryption == EncryptionType::SampleAes
            || !self.encryption_key_format.is_empty()
            || !self.encryption_key_format_versions.is_empty()
        {
            5
        } else {
            3
        }
    }
}

/// Segment encryption scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    #[default]
    None,
    Aes128,
    SampleAes,
}

/// Per-request encryption parameters
#[derive(Debug, Clone, Default)]
pub struct EncryptionParams {
    pub kind: EncryptionType,
    pub key: Option<[u8; 16]>,
    pub iv: Option<[u8; 16]>,
    /// Explicit key URI for `#EXT-X-KEY`; when absent the playlist builder
    /// derives one from the base URL and the configured key file name
    pub key_uri: Option<String>,
}

impl EncryptionParams {
    pub fn is_encrypted(&self) -> bool {
        self.kind != EncryptionType::None
    }
}

/// Top level settings, loadable from a TOML document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub muxer: MuxerConfig,
    pub playlist: PlaylistConfig,
}

impl Settings {
    /// Parse settings from a TOML document. Missing sections and fields fall
    /// back to defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| MuxError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = MuxerConfig::default();
        assert!(!conf.interleave_frames);
        assert!(conf.align_frames);
        assert!(!conf.output_id3_timestamps);
    }

    #[test]
    fn test_m3u8_version() {
        let conf = PlaylistConfig::default();
        assert_eq!(conf.m3u8_version(EncryptionType::None), 3);
        assert_eq!(conf.m3u8_version(EncryptionType::Aes128), 3);
        assert_eq!(conf.m3u8_version(EncryptionType::SampleAes), 5);

        let conf = PlaylistConfig {
            encryption_key_format: "identity".to_string(),
            ..Default::default()
        };
        assert_eq!(conf.m3u8_version(EncryptionType::Aes128), 5);
    }

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [muxer]
            interleave_frames = true

            [playlist]
            segment_file_name_prefix = "frag"
            "#,
        )
        .unwrap();
        assert!(settings.muxer.interleave_frames);
        assert!(settings.muxer.align_frames);
        assert_eq!(settings.playlist.segment_file_name_prefix, "frag");

        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.playlist.index_file_name_prefix, "index");
    }

    #[test]
    fn test_settings_bad_toml() {
        assert!(Settings::from_toml_str("muxer = 3").is_err());
    }

    #[test]
    fn test_settings_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[muxer]\nalign_frames = false\n").unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        let settings = Settings::from_toml_str(&text).unwrap();
        assert!(!settings.muxer.align_frames);
    }
}
