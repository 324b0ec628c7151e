//! Audio mix graph
//!
//! Connects the audio of several sources into one summing node and renders
//! the sum into a single output track, one quantum at a time.
//!
//! Mixing is best effort: sources without audio are skipped, sources that
//! fail to connect are logged and skipped, and a context that cannot be
//! resumed leaves the graph connected but silent. None of these raise.

use super::convert::{remap_channels, StreamResampler};
use crate::capture::media::{audio_track, AudioChunk, AudioTrack, AudioTrackWriter, MediaSource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default output sample rate
pub const DEFAULT_MIX_SAMPLE_RATE: u32 = 48000;

/// Default output channel count
pub const DEFAULT_MIX_CHANNELS: u16 = 2;

/// Render quantum length
pub const RENDER_QUANTUM: Duration = Duration::from_millis(20);

/// Inputs never buffer more than this many quanta ahead
const MAX_PENDING_QUANTA: usize = 50;

/// Minimum spacing of the warnings about dropped input
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Why a source is part of the mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceRole {
    SystemAudio,
    Microphone,
    Playback,
}

/// Output format of the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub quantum: Duration,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_MIX_SAMPLE_RATE,
            channels: DEFAULT_MIX_CHANNELS,
            quantum: RENDER_QUANTUM,
        }
    }
}

impl MixConfig {
    /// Sample frames rendered per quantum
    pub fn quantum_frames(&self) -> usize {
        (self.sample_rate as u128 * self.quantum.as_micros() / 1_000_000) as usize
    }
}

/// Power state of the processing context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MixError {
    #[error("Audio context is closed")]
    Closed,

    #[error("No async runtime available to render audio")]
    NoRuntime,
}

/// A connected input, as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixInput {
    pub label: String,
    pub role: SourceRole,
    pub sample_rate: u32,
    pub channels: u16,
}

/// The single logical output of a graph
#[derive(Clone)]
pub struct MixedAudioTrack {
    track: AudioTrack,
    inputs: Vec<MixInput>,
}

impl MixedAudioTrack {
    /// The mixed output as a regular audio track
    pub fn track(&self) -> &AudioTrack {
        &self.track
    }

    /// 0 when nothing was connected
    pub fn channel_count(&self) -> u16 {
        self.track.channels()
    }

    pub fn inputs(&self) -> &[MixInput] {
        &self.inputs
    }

    pub fn has_audio(&self) -> bool {
        self.channel_count() > 0
    }
}

struct InputNode {
    label: String,
    rx: mpsc::UnboundedReceiver<AudioChunk>,
    resampler: StreamResampler,
    pending: VecDeque<f32>,
    closed: bool,
    /// Frames discarded because the input ran too far ahead
    dropped_frames: u64,
    unreported_drops: u64,
    last_drop_warning: Option<Instant>,
}

impl InputNode {
    fn new(
        label: impl Into<String>,
        rx: mpsc::UnboundedReceiver<AudioChunk>,
        config: &MixConfig,
    ) -> Self {
        Self {
            label: label.into(),
            rx,
            resampler: StreamResampler::new(config.sample_rate, config.channels),
            pending: VecDeque::new(),
            closed: false,
            dropped_frames: 0,
            unreported_drops: 0,
            last_drop_warning: None,
        }
    }

    /// Pull everything the source produced since the last quantum
    fn drain(&mut self, config: &MixConfig) {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    let remapped = remap_channels(&chunk.samples, chunk.channels, config.channels);
                    let converted = self.resampler.process(&remapped, chunk.sample_rate);
                    self.pending.extend(converted);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        tracing::debug!("Mix input '{}' disconnected", self.label);
                        self.pending.extend(self.resampler.flush());
                    }
                    self.closed = true;
                    break;
                }
            }
        }

        let channels = config.channels.max(1) as usize;
        let limit = config.quantum_frames() * channels * MAX_PENDING_QUANTA;
        if self.pending.len() > limit {
            let excess = self.pending.len() - limit;
            self.pending.drain(..excess);
            self.record_drop((excess / channels) as u64);
        }
    }

    fn record_drop(&mut self, frames: u64) {
        self.dropped_frames += frames;
        self.unreported_drops += frames;

        let now = Instant::now();
        let due = self
            .last_drop_warning
            .map_or(true, |at| now.duration_since(at) >= DROP_WARN_INTERVAL);
        if due {
            tracing::warn!(
                "Mix input '{}' is ahead of the output, dropped {} frames ({} total)",
                self.label,
                self.unreported_drops,
                self.dropped_frames
            );
            self.unreported_drops = 0;
            self.last_drop_warning = Some(now);
        }
    }
}

/// Sum one quantum of every input. Inputs that run dry contribute silence.
fn render_quantum(nodes: &mut Vec<InputNode>, config: &MixConfig) -> Vec<f32> {
    let needed = config.quantum_frames() * config.channels as usize;
    let mut out = vec![0.0f32; needed];

    for node in nodes.iter_mut() {
        node.drain(config);
        let take = needed.min(node.pending.len());
        for (slot, sample) in out.iter_mut().zip(node.pending.drain(..take)) {
            *slot += sample;
        }
    }

    nodes.retain(|n| !(n.closed && n.pending.is_empty()));

    for sample in &mut out {
        *sample = sample.clamp(-1.0, 1.0);
    }

    out
}

/// Combines zero or more source audio tracks into one output track
pub struct AudioMixGraph {
    config: MixConfig,
    state: ContextState,
    nodes: Arc<Mutex<Vec<InputNode>>>,
    output: Option<Arc<AudioTrackWriter>>,
    cancel: CancellationToken,
    render: Option<JoinHandle<()>>,
}

impl AudioMixGraph {
    /// Create a graph. Its context starts suspended and is resumed by `mix`.
    pub fn new(config: MixConfig) -> Self {
        Self {
            config,
            state: ContextState::Suspended,
            nodes: Arc::new(Mutex::new(Vec::new())),
            output: None,
            cancel: CancellationToken::new(),
            render: None,
        }
    }

    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    pub fn context_state(&self) -> ContextState {
        self.state
    }

    /// Connect every source that currently yields audio and expose the sum.
    ///
    /// Calling `mix` again rebuilds the graph from scratch.
    pub fn mix(&mut self, sources: &[(&MediaSource, SourceRole)]) -> MixedAudioTrack {
        self.stop_rendering();
        self.nodes.lock().clear();
        self.output = None;

        let mut inputs = Vec::new();
        let mut nodes = Vec::new();

        for (source, role) in sources {
            let Some(audio) = source.audio() else {
                tracing::debug!("Source '{}' has no audio, skipping", source.label());
                continue;
            };
            if audio.channels() == 0 {
                tracing::debug!("Source '{}' yields zero audio channels, skipping", source.label());
                continue;
            }
            if audio.is_ended() {
                tracing::debug!("Audio of '{}' already ended, skipping", source.label());
                continue;
            }

            match audio.take_stream() {
                Ok(rx) => {
                    nodes.push(InputNode::new(audio.label(), rx, &self.config));
                    inputs.push(MixInput {
                        label: audio.label().to_string(),
                        role: *role,
                        sample_rate: audio.sample_rate(),
                        channels: audio.channels(),
                    });
                    tracing::info!(
                        "Connected {:?} audio '{}' ({}Hz, {}ch) to mix",
                        role,
                        audio.label(),
                        audio.sample_rate(),
                        audio.channels()
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to connect audio of '{}': {}", source.label(), e);
                }
            }
        }

        if inputs.is_empty() {
            tracing::info!("No audio sources connected, mixed track is silent");
            let (writer, track) = audio_track("mixed-audio", self.config.sample_rate, 0);
            self.output = Some(Arc::new(writer));
            return MixedAudioTrack { track, inputs };
        }

        let (writer, track) =
            audio_track("mixed-audio", self.config.sample_rate, self.config.channels);
        *self.nodes.lock() = nodes;
        self.output = Some(Arc::new(writer));

        if self.state == ContextState::Suspended {
            if let Err(e) = self.resume() {
                tracing::warn!("Failed to resume audio context, mixing continues: {}", e);
            }
        }

        MixedAudioTrack { track, inputs }
    }

    /// Start rendering quanta into the output track
    pub fn resume(&mut self) -> Result<(), MixError> {
        match self.state {
            ContextState::Closed => return Err(MixError::Closed),
            ContextState::Running => return Ok(()),
            ContextState::Suspended => {}
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| MixError::NoRuntime)?;

        if let Some(output) = self.output.clone() {
            let nodes = self.nodes.clone();
            let config = self.config;
            let cancel = self.cancel.child_token();
            self.render = Some(handle.spawn(render_loop(nodes, output, config, cancel)));
        }

        self.state = ContextState::Running;
        Ok(())
    }

    /// Stop rendering and disconnect everything. Idempotent.
    pub fn close(&mut self) {
        if self.state == ContextState::Closed {
            return;
        }
        self.stop_rendering();
        self.nodes.lock().clear();
        self.output = None;
        self.cancel.cancel();
        self.state = ContextState::Closed;
        tracing::debug!("Audio mix graph closed");
    }

    fn stop_rendering(&mut self) {
        if let Some(render) = self.render.take() {
            render.abort();
        }
        if self.state == ContextState::Running {
            self.state = ContextState::Suspended;
        }
    }
}

impl Default for AudioMixGraph {
    fn default() -> Self {
        Self::new(MixConfig::default())
    }
}

impl Drop for AudioMixGraph {
    fn drop(&mut self) {
        self.close();
    }
}

async fn render_loop(
    nodes: Arc<Mutex<Vec<InputNode>>>,
    output: Arc<AudioTrackWriter>,
    config: MixConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.quantum);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let block = {
            let mut nodes = nodes.lock();
            render_quantum(&mut nodes, &config)
        };

        if !output.push(block) {
            tracing::debug!("Mixed audio has no consumer left, stopping render");
            break;
        }
    }
}
