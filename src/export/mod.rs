//! Export module
//!
//! ffmpeg-backed encoding and playback, and trim re-encoding of finished
//! recordings.

pub mod ffmpeg;
pub mod player;
pub mod trim;
pub mod types;

pub use ffmpeg::{probe_media, FfmpegEncoderFactory, FfmpegFormatProbe, FfmpegPaths};
pub use player::{FfmpegPlaybackEngine, Playback, PlaybackEngine, PlaybackEvent};
pub use trim::{TrimReencoder, DEFAULT_SEEK_TIMEOUT};
pub use types::{clamp_selection, MediaInfo, TrimError, TrimSelection, MIN_TRIM_LENGTH};
