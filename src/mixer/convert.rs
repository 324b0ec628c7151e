//! Sample format conversion for mix inputs

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::collections::VecDeque;

/// Input frames handed to the sinc resampler per call
const RESAMPLER_CHUNK_FRAMES: usize = 256;

/// Bound on the silence blocks pushed through when flushing
const MAX_FLUSH_ROUNDS: usize = 16;

/// Convert interleaved samples between channel layouts.
///
/// Downmixing averages the source channels, upmixing repeats them.
pub fn remap_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let from = from as usize;
    let to = to as usize;
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);

    for frame in samples.chunks_exact(from) {
        if to < from && to == 1 {
            let sum: f32 = frame.iter().sum();
            out.push(sum / from as f32);
        } else {
            for ch in 0..to {
                out.push(frame[ch % from]);
            }
        }
    }

    out
}

/// Streaming sample rate converter for one mix input.
///
/// Input arrives in chunks of any size. Frames the resampler cannot consume
/// yet are carried to the next call, and the number of frames released never
/// runs ahead of `frames_in * output_rate / input_rate`, so a long stream
/// does not drift against the output clock.
pub struct StreamResampler {
    output_rate: u32,
    channels: usize,
    input_rate: Option<u32>,
    resampler: Option<SincFixedIn<f32>>,
    /// Planar input not yet consumed
    input: Vec<Vec<f32>>,
    /// Interleaved output not yet released
    ready: VecDeque<f32>,
    /// Leading output frames that only hold the filter delay
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    pub fn new(output_rate: u32, channels: u16) -> Self {
        let channels = channels as usize;
        Self {
            output_rate,
            channels,
            input_rate: None,
            resampler: None,
            input: vec![Vec::new(); channels],
            ready: VecDeque::new(),
            skip: 0,
            frames_in: 0,
            frames_out: 0,
        }
    }

    /// Rate of the input currently being converted
    pub fn input_rate(&self) -> Option<u32> {
        self.input_rate
    }

    fn reset(&mut self, input_rate: u32) {
        self.input_rate = Some(input_rate);
        self.resampler = None;
        self.input.iter_mut().for_each(Vec::clear);
        self.ready.clear();
        self.skip = 0;
        self.frames_in = 0;
        self.frames_out = 0;

        if input_rate == self.output_rate {
            return;
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = self.output_rate as f64 / input_rate as f64;

        match SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK_FRAMES, self.channels) {
            Ok(resampler) => {
                self.skip = resampler.output_delay();
                self.resampler = Some(resampler);
                tracing::debug!(
                    "Resampling {}Hz -> {}Hz ({}ch)",
                    input_rate,
                    self.output_rate,
                    self.channels
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Cannot resample {}Hz -> {}Hz, input is dropped: {}",
                    input_rate,
                    self.output_rate,
                    e
                );
            }
        }
    }

    /// Convert interleaved samples at `input_rate` to the output rate
    pub fn process(&mut self, samples: &[f32], input_rate: u32) -> Vec<f32> {
        if samples.is_empty() || self.channels == 0 || input_rate == 0 {
            return Vec::new();
        }
        if self.input_rate != Some(input_rate) {
            self.reset(input_rate);
        }
        if input_rate == self.output_rate {
            return samples.to_vec();
        }
        if self.resampler.is_none() {
            return Vec::new();
        }

        let frames = samples.len() / self.channels;
        for frame in samples.chunks_exact(self.channels) {
            for (ch, sample) in frame.iter().enumerate() {
                self.input[ch].push(*sample);
            }
        }
        self.frames_in += frames as u64;

        self.run(false);
        self.release()
    }

    /// Push the carried input and the filter tail out, e.g. when the
    /// source ended. Releases exactly the frames still owed.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() {
            return Vec::new();
        }
        self.run(true);
        self.input.iter_mut().for_each(Vec::clear);
        self.release()
    }

    fn owed_frames(&self) -> u64 {
        let Some(rate) = self.input_rate.filter(|r| *r > 0) else {
            return 0;
        };
        let target = self.frames_in as u128 * self.output_rate as u128 / rate as u128;
        (target as u64).saturating_sub(self.frames_out)
    }

    /// Feed whole resampler blocks. When `pad` is set the carried input is
    /// completed with silence until enough output exists to settle the debt.
    fn run(&mut self, pad: bool) {
        let owed = self.owed_frames();
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };

        let mut rounds = 0;
        loop {
            let needed = resampler.input_frames_next();
            let carried = self.input.first().map_or(0, Vec::len);

            if carried < needed {
                let settled = (self.ready.len() / self.channels) as u64 >= owed;
                if !pad || settled || rounds >= MAX_FLUSH_ROUNDS {
                    break;
                }
                for channel in &mut self.input {
                    channel.resize(needed, 0.0);
                }
                rounds += 1;
            }

            let block: Vec<Vec<f32>> = self
                .input
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();

            match resampler.process(&block, None) {
                Ok(out) => {
                    let produced = out.first().map_or(0, Vec::len);
                    for i in 0..produced {
                        if self.skip > 0 {
                            self.skip -= 1;
                            continue;
                        }
                        for channel in &out {
                            self.ready.push_back(channel[i]);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Resampling failed, block dropped: {}", e);
                }
            }
        }
    }

    fn release(&mut self) -> Vec<f32> {
        let available = (self.ready.len() / self.channels) as u64;
        let frames = available.min(self.owed_frames()) as usize;
        self.frames_out += frames as u64;
        self.ready.drain(..frames * self.channels).collect()
    }
}
