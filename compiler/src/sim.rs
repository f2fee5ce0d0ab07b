// sim.rs: LIR execution: pattern instances and the reference simulator
//
// A `PatternInstance` owns one LIR program plus all of its storage: the
// per-call temporaries, the persistent `StateArena`, and the local scratch
// registers. Construction resolves every buffer and local name to an index,
// so a render call performs no lookups and no allocation. Arithmetic is plain
// `f32`, evaluated in the order the expression tree gives, with the same
// clamp and rounding forms the emitted C++ uses.
//
// `ReferenceSimulator` is a pattern instance built directly from a lowered
// graph, without going through emitted text.
//
// Preconditions: callers serialize `render` calls on one instance.
// Postconditions: each `render` advances every executed state slot once.
// Failure modes: unknown symbols are rejected at construction; out-of-range
//   indices, missing audio reads and wrong output lengths are `ExecError`s.
// Side effects: none beyond the instance's own state.

use std::collections::HashMap;

use crate::error::PgcResult;
use crate::frame::Frame;
use crate::graph::Graph;
use crate::lir::*;
use crate::state::StateArena;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("index {index} out of bounds for `{buffer}` (len {len})")]
    OutOfBounds {
        buffer: String,
        index: usize,
        len: usize,
    },
    #[error("index `{index}` is negative at i = {i}")]
    NegativeIndex { index: String, i: usize },
    #[error("unknown buffer `{0}`")]
    UnknownBuffer(String),
    #[error("local `{0}` is read but never bound")]
    UnknownLocal(String),
    #[error("`{0}` does not match the element type of its buffer")]
    BadPlace(String),
    #[error("audio snapshot read while no audio is present")]
    AudioMissing,
    #[error("output holds {got} pixels, program renders {expected}")]
    OutputLength { expected: usize, got: usize },
}

/// Same form as the runtime header's `clamp_val(x, 0.0f, 1.0f)`.
pub fn clamp01(x: f32) -> f32 {
    if x < 0.0 {
        0.0
    } else if x > 1.0 {
        1.0
    } else {
        x
    }
}

// ── Resolved program ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Temp(usize),
    Slot(usize),
    Out,
}

#[derive(Debug, Clone, Copy)]
struct Place {
    storage: Storage,
    index: LirIndex,
    lanes: usize,
    lane: usize,
}

#[derive(Debug, Clone)]
enum Expr {
    Const(f32),
    IndexF,
    Load(Place),
    Local(usize),
    Param(ParamField),
    Spectrum(LirIndex),
    Energy,
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Clamp01(Box<Expr>),
    Floor(Box<Expr>),
}

#[derive(Debug, Clone)]
enum Instr {
    Let(usize, Expr),
    Store(Place, Expr),
}

#[derive(Debug, Clone)]
enum Stmt {
    Loop { count: usize, body: Vec<Instr> },
    If {
        pred: LirPred,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
}

/// Storage for one instance.
#[derive(Debug, Clone)]
struct Memory {
    temps: Vec<Vec<f32>>,
    temp_names: Vec<String>,
    arena: StateArena,
    locals: Vec<f32>,
}

struct Resolver<'a> {
    buffers: HashMap<&'a str, (Storage, ElemType)>,
    locals: HashMap<String, usize>,
}

impl<'a> Resolver<'a> {
    fn place(&self, place: &LirPlace) -> Result<Place, ExecError> {
        let (storage, elem) = match &place.target {
            Target::Out => (Storage::Out, ElemType::Rgb),
            Target::Buffer(sym) => *self
                .buffers
                .get(sym.as_str())
                .ok_or_else(|| ExecError::UnknownBuffer(sym.clone()))?,
        };
        let lane = match (elem, place.channel) {
            (ElemType::Float, None) => 0,
            (ElemType::Rgb, Some(ch)) => ch.lane(),
            _ => return Err(ExecError::BadPlace(place.to_string())),
        };
        Ok(Place {
            storage,
            index: place.index,
            lanes: elem.lanes(),
            lane,
        })
    }

    fn expr(&self, expr: &LirExpr) -> Result<Expr, ExecError> {
        Ok(match expr {
            LirExpr::Const(v) => Expr::Const(*v),
            LirExpr::IndexF => Expr::IndexF,
            LirExpr::Load(p) => Expr::Load(self.place(p)?),
            LirExpr::Local(name) => Expr::Local(
                *self
                    .locals
                    .get(name)
                    .ok_or_else(|| ExecError::UnknownLocal(name.clone()))?,
            ),
            LirExpr::Param(p) => Expr::Param(*p),
            LirExpr::Spectrum(idx) => Expr::Spectrum(*idx),
            LirExpr::Energy => Expr::Energy,
            LirExpr::Binary(op, a, b) => {
                Expr::Binary(*op, Box::new(self.expr(a)?), Box::new(self.expr(b)?))
            }
            LirExpr::Clamp01(x) => Expr::Clamp01(Box::new(self.expr(x)?)),
            LirExpr::Floor(x) => Expr::Floor(Box::new(self.expr(x)?)),
        })
    }

    fn stmts(&mut self, stmts: &[LirStmt]) -> Result<Vec<Stmt>, ExecError> {
        let mut out = Vec::new();
        for stmt in stmts {
            match stmt {
                LirStmt::Note(_) => {}
                LirStmt::Loop { count, body } => {
                    let mut instrs = Vec::with_capacity(body.len());
                    for instr in body {
                        instrs.push(match instr {
                            LirInstr::Let { name, value } => {
                                // Resolve the value before binding, so a
                                // self-reference is reported.
                                let value = self.expr(value)?;
                                let next = self.locals.len();
                                let slot = *self.locals.entry(name.clone()).or_insert(next);
                                Instr::Let(slot, value)
                            }
                            LirInstr::Store { place, value } => {
                                Instr::Store(self.place(place)?, self.expr(value)?)
                            }
                        });
                    }
                    out.push(Stmt::Loop {
                        count: *count,
                        body: instrs,
                    });
                }
                LirStmt::If {
                    pred,
                    then_body,
                    else_body,
                } => out.push(Stmt::If {
                    pred: *pred,
                    then_body: self.stmts(then_body)?,
                    else_body: self.stmts(else_body)?,
                }),
            }
        }
        Ok(out)
    }
}

// ── Pattern instance ────────────────────────────────────────────────────────

/// One runnable pattern: program, temporaries and persistent state.
#[derive(Debug, Clone)]
pub struct PatternInstance {
    lir: LirProgram,
    program: Vec<Stmt>,
    mem: Memory,
}

impl PatternInstance {
    /// Allocate every buffer the program declares and resolve its symbols.
    pub fn new(lir: LirProgram) -> Result<Self, ExecError> {
        let mut buffers = HashMap::new();
        let mut temps = Vec::with_capacity(lir.temps.len());
        let mut temp_names = Vec::with_capacity(lir.temps.len());
        for temp in &lir.temps {
            buffers.insert(temp.symbol.as_str(), (Storage::Temp(temps.len()), temp.elem));
            temps.push(vec![0.0; temp.len * temp.elem.lanes()]);
            temp_names.push(temp.symbol.clone());
        }
        let mut arena = StateArena::new();
        for slot in &lir.slots {
            let idx = arena.ensure(&slot.owner, slot.len);
            buffers.insert(slot.symbol.as_str(), (Storage::Slot(idx), ElemType::Float));
        }

        let mut resolver = Resolver {
            buffers,
            locals: HashMap::new(),
        };
        let program = resolver.stmts(&lir.body)?;
        let locals = vec![0.0; resolver.locals.len()];
        drop(resolver);

        Ok(PatternInstance {
            lir,
            program,
            mem: Memory {
                temps,
                temp_names,
                arena,
                locals,
            },
        })
    }

    pub fn lir(&self) -> &LirProgram {
        &self.lir
    }

    pub fn frame_width(&self) -> usize {
        self.lir.frame_width
    }

    pub fn state(&self) -> &StateArena {
        &self.mem.arena
    }

    /// Contents of a temporary after the last render (interleaved RGB).
    pub fn temp(&self, symbol: &str) -> Option<&[f32]> {
        self.mem
            .temp_names
            .iter()
            .position(|n| n == symbol)
            .map(|idx| self.mem.temps[idx].as_slice())
    }

    /// Reinitialize the instance: all persistent state back to zero.
    pub fn reset(&mut self) {
        self.mem.arena.reset();
    }

    /// Render one frame into `out`, which must hold `frame_width` pixels.
    pub fn render(&mut self, frame: &Frame, out: &mut [[u8; 3]]) -> Result<(), ExecError> {
        if out.len() != self.lir.frame_width {
            return Err(ExecError::OutputLength {
                expected: self.lir.frame_width,
                got: out.len(),
            });
        }
        // Temporaries are `= {}` in emitted code: zeroed on every call.
        for temp in &mut self.mem.temps {
            temp.iter_mut().for_each(|v| *v = 0.0);
        }
        exec_stmts(&self.program, &mut self.mem, frame, out)
    }
}

fn exec_stmts(
    stmts: &[Stmt],
    mem: &mut Memory,
    frame: &Frame,
    out: &mut [[u8; 3]],
) -> Result<(), ExecError> {
    for stmt in stmts {
        match stmt {
            Stmt::Loop { count, body } => {
                for i in 0..*count {
                    for instr in body {
                        match instr {
                            Instr::Let(slot, value) => {
                                let v = eval(value, i, mem, frame, out)?;
                                mem.locals[*slot] = v;
                            }
                            Instr::Store(place, value) => {
                                let v = eval(value, i, mem, frame, out)?;
                                write(place, i, v, mem, out)?;
                            }
                        }
                    }
                }
            }
            Stmt::If {
                pred,
                then_body,
                else_body,
            } => {
                let taken = match pred {
                    LirPred::AudioPresent => frame.audio.is_some(),
                    LirPred::EnergyAbove(t) => frame.audio.as_ref().is_some_and(|a| a.energy > *t),
                };
                let branch = if taken { then_body } else { else_body };
                exec_stmts(branch, mem, frame, out)?;
            }
        }
    }
    Ok(())
}

fn element(place: &Place, i: usize, mem: &Memory, out_len: usize) -> Result<usize, ExecError> {
    let idx = place.index.resolve(i).ok_or_else(|| ExecError::NegativeIndex {
        index: place.index.to_string(),
        i,
    })?;
    let (len, name) = match place.storage {
        Storage::Temp(t) => (mem.temps[t].len() / place.lanes, mem.temp_names[t].as_str()),
        Storage::Slot(s) => (mem.arena.data(s).len(), mem.arena.owner(s)),
        Storage::Out => (out_len, "out"),
    };
    if idx >= len {
        return Err(ExecError::OutOfBounds {
            buffer: name.to_string(),
            index: idx,
            len,
        });
    }
    Ok(idx)
}

fn eval(
    expr: &Expr,
    i: usize,
    mem: &Memory,
    frame: &Frame,
    out: &[[u8; 3]],
) -> Result<f32, ExecError> {
    Ok(match expr {
        Expr::Const(v) => *v,
        Expr::IndexF => i as f32,
        Expr::Load(place) => {
            let idx = element(place, i, mem, out.len())?;
            match place.storage {
                Storage::Temp(t) => mem.temps[t][idx * place.lanes + place.lane],
                Storage::Slot(s) => mem.arena.data(s)[idx],
                Storage::Out => out[idx][place.lane] as f32,
            }
        }
        Expr::Local(slot) => mem.locals[*slot],
        Expr::Param(field) => match field {
            ParamField::Brightness => frame.params.brightness,
            ParamField::Softness => frame.params.softness,
            ParamField::Sensitivity => frame.params.sensitivity,
        },
        Expr::Spectrum(index) => {
            let audio = frame.audio.as_ref().ok_or(ExecError::AudioMissing)?;
            let idx = index.resolve(i).ok_or_else(|| ExecError::NegativeIndex {
                index: index.to_string(),
                i,
            })?;
            *audio.spectrum.get(idx).ok_or_else(|| ExecError::OutOfBounds {
                buffer: "audio->spectrum".into(),
                index: idx,
                len: audio.spectrum.len(),
            })?
        }
        Expr::Energy => frame.audio.as_ref().ok_or(ExecError::AudioMissing)?.energy,
        Expr::Binary(op, a, b) => {
            let a = eval(a, i, mem, frame, out)?;
            let b = eval(b, i, mem, frame, out)?;
            op.apply(a, b)
        }
        Expr::Clamp01(x) => clamp01(eval(x, i, mem, frame, out)?),
        Expr::Floor(x) => eval(x, i, mem, frame, out)?.floor(),
    })
}

fn write(
    place: &Place,
    i: usize,
    value: f32,
    mem: &mut Memory,
    out: &mut [[u8; 3]],
) -> Result<(), ExecError> {
    let idx = element(place, i, mem, out.len())?;
    match place.storage {
        Storage::Temp(t) => mem.temps[t][idx * place.lanes + place.lane] = value,
        Storage::Slot(s) => mem.arena.data_mut(s)[idx] = value,
        // `(uint8_t)` conversion of a value already in [0, 255].
        Storage::Out => out[idx][place.lane] = value as u8,
    }
    Ok(())
}

// ── Reference simulator ─────────────────────────────────────────────────────

/// Interprets the lowered LIR of a graph, with no emitted text involved.
#[derive(Debug, Clone)]
pub struct ReferenceSimulator {
    instance: PatternInstance,
    pixels: Vec<[u8; 3]>,
}

impl ReferenceSimulator {
    /// Lower `graph` and build an instance from the result.
    pub fn from_graph(graph: &Graph) -> PgcResult<Self> {
        let lir = crate::pipeline::lower_checked(graph)?;
        Ok(Self::new(lir)?)
    }

    pub fn new(lir: LirProgram) -> Result<Self, ExecError> {
        let instance = PatternInstance::new(lir)?;
        let pixels = vec![[0u8; 3]; instance.frame_width()];
        Ok(ReferenceSimulator { instance, pixels })
    }

    /// Render one frame; the returned pixels are valid until the next call.
    pub fn render(&mut self, frame: &Frame) -> Result<&[[u8; 3]], ExecError> {
        self.instance.render(frame, &mut self.pixels)?;
        Ok(&self.pixels)
    }

    pub fn instance(&self) -> &PatternInstance {
        &self.instance
    }

    pub fn reset(&mut self) {
        self.instance.reset();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PatternParameters, SyntheticInput};
    use crate::graph::load_graph;

    fn sim(src: &str) -> ReferenceSimulator {
        let graph = load_graph(src).graph.expect("graph");
        ReferenceSimulator::from_graph(&graph).expect("simulator")
    }

    fn quiet_frame() -> Frame {
        Frame {
            time: 0.0,
            audio: None,
            params: PatternParameters::default(),
        }
    }

    const RAMP: &str = r#"{"frame_width": 16, "nodes": [
        {"id": "ramp", "kind": "RampShape"},
        {"id": "color", "kind": "Colorize"},
        {"id": "out", "kind": "PixelOutput"}
    ]}"#;

    #[test]
    fn ramp_endpoints_and_monotone() {
        let mut s = sim(RAMP);
        s.render(&quiet_frame()).unwrap();
        let ramp = s.instance().temp("tmp_f0").unwrap().to_vec();
        assert_eq!(ramp[0], 0.0);
        assert_eq!(ramp[15], 1.0);
        assert!(ramp.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn quantization_rounds_half_up() {
        let mut s = sim(RAMP);
        let pixels = s.render(&quiet_frame()).unwrap().to_vec();
        assert_eq!(pixels[0], [0, 0, 0]);
        assert_eq!(pixels[15], [255, 255, 255]);
        // 1/15 * 255 lands just above 17.
        assert_eq!(pixels[1][0], 17);
    }

    #[test]
    fn brightness_scales_and_clamps() {
        let mut s = sim(RAMP);
        let mut frame = quiet_frame();
        frame.params.brightness = 0.5;
        assert_eq!(s.render(&frame).unwrap()[15], [128, 128, 128]);
        frame.params.brightness = 3.0;
        assert_eq!(s.render(&frame).unwrap()[15], [255, 255, 255]);
        frame.params.brightness = -1.0;
        assert_eq!(s.render(&frame).unwrap()[15], [0, 0, 0]);
    }

    #[test]
    fn persist_decay_converges() {
        let mut s = sim(
            r#"{"frame_width": 2, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "decay", "kind": "PersistDecay", "decay_factor": 0.92},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        let frame = quiet_frame();
        let mut history = Vec::new();
        for _ in 0..200 {
            s.render(&frame).unwrap();
            history.push(s.instance().state().get("decay").unwrap()[1]);
        }
        assert!((history[0] - 0.08).abs() < 1e-6);
        assert!((history[1] - 0.1536).abs() < 1e-6);
        assert!(history.windows(2).all(|w| w[0] <= w[1]));
        assert!(1.0 - history[165] <= 1e-6);

        s.reset();
        assert_eq!(s.instance().state().get("decay").unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn center_mirror_is_symmetric() {
        let mut s = sim(
            r#"{"frame_width": 10, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "m", "kind": "MirrorCenter"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        let px = s.render(&quiet_frame()).unwrap().to_vec();
        for i in 0..5 {
            assert_eq!(px[4 - i], px[5 + i]);
        }
        assert_eq!(px[4], [0, 0, 0]);
    }

    #[test]
    fn full_mirror_reverses() {
        let mut s = sim(
            r#"{"frame_width": 6, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "m", "kind": "Mirror", "variant": "full_reversal"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        let px = s.render(&quiet_frame()).unwrap().to_vec();
        assert_eq!(px[0], [255, 255, 255]);
        assert_eq!(px[5], [0, 0, 0]);
    }

    #[test]
    fn audio_input_zero_fills_without_audio() {
        let mut s = sim(
            r#"{"frame_width": 8, "nodes": [
                {"id": "audio", "kind": "AudioInput"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert!(s.render(&quiet_frame()).unwrap().iter().all(|p| *p == [0, 0, 0]));
        let loud = SyntheticInput::default().frame(10);
        let expected = (loud.audio.as_ref().unwrap().spectrum[3] * 255.0 + 0.5).floor() as u8;
        assert_eq!(s.render(&loud).unwrap()[3][0], expected);
    }

    #[test]
    fn fallback_renders_when_audio_is_missing() {
        let mut s = sim(
            r#"{"frame_width": 4, "nodes": [
                {"id": "audio", "kind": "AudioInput"},
                {"id": "gate", "kind": "ConditionalFallback", "fallback": [
                    {"id": "amb", "kind": "RampShape"},
                    {"id": "amb_color", "kind": "Colorize", "map": "tint", "tint_r": 0.0, "tint_g": 0.0, "tint_b": 1.0}
                ]},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        let px = s.render(&quiet_frame()).unwrap().to_vec();
        assert_eq!(px[3], [0, 0, 255]);
    }

    #[test]
    fn wrong_output_length_is_rejected() {
        let graph = load_graph(RAMP).graph.unwrap();
        let lir = crate::pipeline::lower_checked(&graph).unwrap();
        let mut inst = PatternInstance::new(lir).unwrap();
        let mut out = vec![[0u8; 3]; 3];
        assert_eq!(
            inst.render(&quiet_frame(), &mut out),
            Err(ExecError::OutputLength {
                expected: 16,
                got: 3
            })
        );
    }

    #[test]
    fn unknown_symbols_fail_at_construction() {
        let graph = load_graph(RAMP).graph.unwrap();
        let mut lir = crate::pipeline::lower_checked(&graph).unwrap();
        lir.temps.remove(0);
        assert_eq!(
            PatternInstance::new(lir).unwrap_err(),
            ExecError::UnknownBuffer("tmp_f0".into())
        );
    }

    #[test]
    fn out_of_range_index_is_an_exec_error() {
        let graph = load_graph(RAMP).graph.unwrap();
        let mut lir = crate::pipeline::lower_checked(&graph).unwrap();
        if let Some(LirStmt::Loop { count, .. }) = lir
            .body
            .iter_mut()
            .find(|s| matches!(s, LirStmt::Loop { .. }))
        {
            *count = 17;
        }
        let mut inst = PatternInstance::new(lir).unwrap();
        let mut out = vec![[0u8; 3]; 16];
        assert!(matches!(
            inst.render(&quiet_frame(), &mut out),
            Err(ExecError::OutOfBounds { index: 16, len: 16, .. })
        ));
    }
}
