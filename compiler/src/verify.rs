// verify.rs: Equivalence verification of emitted artifacts
//
// Drives the same synthetic frame sequence through two execution paths and
// compares their 8-bit pixels: the emitted artifact, re-parsed into LIR and
// run in a fresh `PatternInstance`, and the `ReferenceSimulator` built from
// the lowered graph. The structural comparison of the two LIR programs is
// reported alongside the pixel verdict.
//
// Preconditions: `artifact_text` claims to be the emission of `graph`.
// Postconditions: the report covers exactly `options.frames` frames of
//   `frame_width` pixels each; the verdict is PASS iff no pixel differs.
// Failure modes: lowering errors, artifacts that do not parse, width
//   disagreements and execution faults abort with `PgcError`. Pixel
//   mismatches are not errors here; see `EquivalenceReport::ensure_passed`.
// Side effects: none.

use crate::error::{PgcError, PgcResult};
use crate::frame::SyntheticInput;
use crate::graph::Graph;
use crate::parser::parse_artifact;
use crate::pipeline::lower_checked;
use crate::sim::{PatternInstance, ReferenceSimulator};

// ── Options and report ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOptions {
    pub frames: u32,
    pub input: SyntheticInput,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            frames: 100,
            input: SyntheticInput::default(),
        }
    }
}

/// The first pixel on which the two paths disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("frame {frame}, pixel {pixel}: emitted {emitted:?}, reference {reference:?}")]
pub struct EquivalenceFailure {
    pub frame: u32,
    pub pixel: usize,
    pub emitted: [u8; 3],
    pub reference: [u8; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquivalenceReport {
    pub frames: u32,
    pub pixels_compared: usize,
    pub mismatches: usize,
    /// Largest sum of per-channel absolute differences on one pixel.
    pub max_channel_sum_delta: u32,
    pub first_mismatch: Option<EquivalenceFailure>,
    /// The re-parsed artifact has the lowered program's buffers and kernels.
    pub structurally_identical: bool,
}

impl EquivalenceReport {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    pub fn ensure_passed(&self) -> Result<(), EquivalenceFailure> {
        match &self.first_mismatch {
            Some(failure) if self.mismatches > 0 => Err(failure.clone()),
            _ => Ok(()),
        }
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Run `graph` and its emitted `artifact_text` side by side.
pub fn verify(graph: &Graph, artifact_text: &str, options: &VerifyOptions) -> PgcResult<EquivalenceReport> {
    let _span = tracing::debug_span!("verify", frames = options.frames).entered();

    let lowered = lower_checked(graph)?;
    let parsed = parse_artifact(artifact_text)?;
    if parsed.frame_width != graph.frame_width {
        return Err(PgcError::Artifact(vec![format!(
            "artifact renders {} pixels but the graph declares frame_width {}",
            parsed.frame_width, graph.frame_width
        )]));
    }

    let structurally_identical = lowered.structurally_eq(&parsed);
    if !structurally_identical {
        tracing::warn!("re-parsed artifact differs structurally from the lowered program");
    }

    let mut emitted = PatternInstance::new(parsed)?;
    let mut reference = ReferenceSimulator::new(lowered)?;
    let mut pixels = vec![[0u8; 3]; graph.frame_width];

    let mut report = EquivalenceReport {
        frames: options.frames,
        pixels_compared: 0,
        mismatches: 0,
        max_channel_sum_delta: 0,
        first_mismatch: None,
        structurally_identical,
    };

    for (k, frame) in options.input.frames(options.frames).enumerate() {
        emitted.render(&frame, &mut pixels)?;
        let expected = reference.render(&frame)?;
        for (p, (got, want)) in pixels.iter().zip(expected).enumerate() {
            report.pixels_compared += 1;
            if got == want {
                continue;
            }
            let delta: u32 = got
                .iter()
                .zip(want)
                .map(|(a, b)| u32::from(a.abs_diff(*b)))
                .sum();
            report.mismatches += 1;
            report.max_channel_sum_delta = report.max_channel_sum_delta.max(delta);
            if report.first_mismatch.is_none() {
                report.first_mismatch = Some(EquivalenceFailure {
                    frame: k as u32,
                    pixel: p,
                    emitted: *got,
                    reference: *want,
                });
            }
        }
    }

    tracing::debug!(
        pixels = report.pixels_compared,
        mismatches = report.mismatches,
        max_delta = report.max_channel_sum_delta,
        structural = report.structurally_identical,
        "verified"
    );
    Ok(report)
}

// ── Tests ───────────────────────────────────────────────────────────────────
