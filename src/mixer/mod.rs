//! Audio mixing
//!
//! Merges display/system audio and microphone audio into one track.

pub mod convert;
pub mod graph;

pub use graph::{
    AudioMixGraph, ContextState, MixConfig, MixError, MixInput, MixedAudioTrack, SourceRole,
};
