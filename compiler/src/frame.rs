// frame.rs: Per-call render inputs and the deterministic synthetic source
//
// A `Frame` is what one render call sees: elapsed time, an optional audio
// snapshot, and the pattern parameters. `SyntheticInput` produces the same
// frame sequence for the same settings on every run, using integer-derived
// values only, so both execution paths of the verifier see identical input.

use crate::registry::SPECTRUM_BINS;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioSnapshot {
    pub spectrum: [f32; SPECTRUM_BINS],
    pub energy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternParameters {
    pub brightness: f32,
    pub softness: f32,
    pub sensitivity: f32,
}

impl Default for PatternParameters {
    fn default() -> Self {
        PatternParameters {
            brightness: 1.0,
            softness: 0.5,
            sensitivity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub time: f32,
    pub audio: Option<AudioSnapshot>,
    pub params: PatternParameters,
}

/// Settings for the deterministic verification input.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticInput {
    /// Every `dropout_period`-th frame has no audio snapshot. 0 disables.
    pub dropout_period: u32,
    pub brightness: f32,
    pub sensitivity: f32,
    pub softness: f32,
}

impl Default for SyntheticInput {
    fn default() -> Self {
        SyntheticInput {
            dropout_period: 0,
            brightness: 1.0,
            sensitivity: 1.0,
            softness: 0.5,
        }
    }
}

impl SyntheticInput {
    /// Frame `k` of the sequence (60 frames per second).
    pub fn frame(&self, k: u32) -> Frame {
        let dropped = self.dropout_period > 0 && (k + 1) % self.dropout_period == 0;
        let audio = (!dropped).then(|| synthetic_snapshot(k));
        Frame {
            time: k as f32 / 60.0,
            audio,
            params: PatternParameters {
                brightness: self.brightness,
                softness: self.softness,
                sensitivity: self.sensitivity,
            },
        }
    }

    pub fn frames(&self, count: u32) -> impl Iterator<Item = Frame> + '_ {
        (0..count).map(move |k| self.frame(k))
    }
}

/// A moving triangle wave across the bins; energy is its mean.
fn synthetic_snapshot(k: u32) -> AudioSnapshot {
    let mut spectrum = [0.0f32; SPECTRUM_BINS];
    let mut sum = 0.0f32;
    for (b, v) in spectrum.iter_mut().enumerate() {
        let phase = (k as usize * 7 + b * 13) % 510;
        let tri = if phase < 255 { phase } else { 510 - phase };
        *v = tri as f32 / 255.0;
        sum += *v;
    }
    AudioSnapshot {
        spectrum,
        energy: sum / SPECTRUM_BINS as f32,
    }
}
