//! LIR – loop-level IR shared by the emitter, the simulator and the artifact
//! parser.
//!
//! A `LirProgram` is fully resolved: every buffer has a symbol and a length,
//! every kernel is a counted loop over `i`, and every arithmetic step is an
//! explicit expression tree. `codegen` prints it, `sim` executes it, and
//! `parser` rebuilds it from emitted text, so structural equality between the
//! lowered and the re-parsed program is meaningful.

use std::fmt;

// ── Top-level ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LirProgram {
    /// Render function symbol.
    pub function: String,
    pub frame_width: usize,
    pub slots: Vec<LirSlot>,
    pub temps: Vec<LirTemp>,
    pub body: Vec<LirStmt>,
}

/// A persistent state buffer (module-scope static in emitted code).
#[derive(Debug, Clone, PartialEq)]
pub struct LirSlot {
    pub symbol: String,
    /// Owning node id. Re-parsed artifacts use the symbol.
    pub owner: String,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    Float,
    Rgb,
}

impl ElemType {
    pub fn cpp_type(self) -> &'static str {
        match self {
            ElemType::Float => "float",
            ElemType::Rgb => "CRGBF",
        }
    }

    /// Scalar lanes per element.
    pub fn lanes(self) -> usize {
        match self {
            ElemType::Float => 1,
            ElemType::Rgb => 3,
        }
    }
}

/// A per-call temporary buffer (stack array in emitted code).
#[derive(Debug, Clone, PartialEq)]
pub struct LirTemp {
    pub symbol: String,
    pub elem: ElemType,
    pub len: usize,
}

// ── Statements ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum LirStmt {
    /// Comment line; dropped by the artifact parser.
    Note(String),
    /// `for (int i = 0; i < count; ++i) { body }`
    Loop { count: usize, body: Vec<LirInstr> },
    If {
        pred: LirPred,
        then_body: Vec<LirStmt>,
        else_body: Vec<LirStmt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LirInstr {
    /// `const float name = value;`
    Let { name: String, value: LirExpr },
    /// `place = value;` (stores to `out` quantize to `uint8_t`)
    Store { place: LirPlace, value: LirExpr },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LirPred {
    AudioPresent,
    EnergyAbove(f32),
}

// ── Places and indices ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A temp or state slot, by symbol.
    Buffer(String),
    /// The device pixel array.
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LirIndex {
    /// `i`
    I,
    /// `last - i`
    Reverse { last: usize },
    /// `k + i`
    Offset(usize),
}

impl LirIndex {
    /// Concrete element index for loop counter `i`, if non-negative.
    pub fn resolve(self, i: usize) -> Option<usize> {
        match self {
            LirIndex::I => Some(i),
            LirIndex::Reverse { last } => last.checked_sub(i),
            LirIndex::Offset(k) => k.checked_add(i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    R,
    G,
    B,
}

pub const CHANNELS: [Channel; 3] = [Channel::R, Channel::G, Channel::B];

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::R => "r",
            Channel::G => "g",
            Channel::B => "b",
        }
    }

    pub fn lane(self) -> usize {
        match self {
            Channel::R => 0,
            Channel::G => 1,
            Channel::B => 2,
        }
    }

    pub fn from_name(name: &str) -> Option<Channel> {
        match name {
            "r" => Some(Channel::R),
            "g" => Some(Channel::G),
            "b" => Some(Channel::B),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LirPlace {
    pub target: Target,
    pub index: LirIndex,
    pub channel: Option<Channel>,
}

impl LirPlace {
    pub fn buffer(symbol: &str, index: LirIndex) -> Self {
        LirPlace {
            target: Target::Buffer(symbol.to_string()),
            index,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }
}

// ── Expressions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamField {
    Brightness,
    Softness,
    Sensitivity,
}

impl ParamField {
    pub fn name(self) -> &'static str {
        match self {
            ParamField::Brightness => "brightness",
            ParamField::Softness => "softness",
            ParamField::Sensitivity => "sensitivity",
        }
    }

    pub fn from_name(name: &str) -> Option<ParamField> {
        match name {
            "brightness" => Some(ParamField::Brightness),
            "softness" => Some(ParamField::Softness),
            "sensitivity" => Some(ParamField::Sensitivity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }

    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Add | BinOp::Sub => 1,
            BinOp::Mul | BinOp::Div => 2,
        }
    }

    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LirExpr {
    Const(f32),
    /// `(float)i`
    IndexF,
    Load(LirPlace),
    Local(String),
    Param(ParamField),
    Spectrum(LirIndex),
    Energy,
    Binary(BinOp, Box<LirExpr>, Box<LirExpr>),
    Clamp01(Box<LirExpr>),
    Floor(Box<LirExpr>),
}

impl LirExpr {
    pub fn binary(op: BinOp, lhs: LirExpr, rhs: LirExpr) -> LirExpr {
        LirExpr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn add(lhs: LirExpr, rhs: LirExpr) -> LirExpr {
        Self::binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: LirExpr, rhs: LirExpr) -> LirExpr {
        Self::binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: LirExpr, rhs: LirExpr) -> LirExpr {
        Self::binary(BinOp::Mul, lhs, rhs)
    }

    pub fn div(lhs: LirExpr, rhs: LirExpr) -> LirExpr {
        Self::binary(BinOp::Div, lhs, rhs)
    }

    pub fn clamp01(inner: LirExpr) -> LirExpr {
        LirExpr::Clamp01(Box::new(inner))
    }

    pub fn floor(inner: LirExpr) -> LirExpr {
        LirExpr::Floor(Box::new(inner))
    }

    pub fn load(place: LirPlace) -> LirExpr {
        LirExpr::Load(place)
    }

    pub fn local(name: &str) -> LirExpr {
        LirExpr::Local(name.to_string())
    }

    /// Binding strength for printing; atoms bind tightest.
    pub fn precedence(&self) -> u8 {
        match self {
            LirExpr::Binary(op, _, _) => op.precedence(),
            _ => 3,
        }
    }
}

// ── Program helpers ────────────────────────────────────────────────────────

impl LirProgram {
    pub fn temp(&self, symbol: &str) -> Option<&LirTemp> {
        self.temps.iter().find(|t| t.symbol == symbol)
    }

    pub fn slot(&self, symbol: &str) -> Option<&LirSlot> {
        self.slots.iter().find(|s| s.symbol == symbol)
    }

    /// Copy of the statement list with every `Note` removed, recursively.
    pub fn body_without_notes(&self) -> Vec<LirStmt> {
        strip_notes(&self.body)
    }

    /// Structural equality ignoring comments, slot ownership and the
    /// function symbol: same buffers, same kernels, same expression trees.
    pub fn structurally_eq(&self, other: &LirProgram) -> bool {
        let slot_shape = |p: &LirProgram| -> Vec<(String, usize)> {
            p.slots.iter().map(|s| (s.symbol.clone(), s.len)).collect()
        };
        self.frame_width == other.frame_width
            && slot_shape(self) == slot_shape(other)
            && self.temps == other.temps
            && self.body_without_notes() == other.body_without_notes()
    }

    /// Number of loop kernels, including those inside branches.
    pub fn loop_count(&self) -> usize {
        fn count(stmts: &[LirStmt]) -> usize {
            stmts
                .iter()
                .map(|s| match s {
                    LirStmt::Note(_) => 0,
                    LirStmt::Loop { .. } => 1,
                    LirStmt::If {
                        then_body,
                        else_body,
                        ..
                    } => count(then_body) + count(else_body),
                })
                .sum()
        }
        count(&self.body)
    }
}

fn strip_notes(stmts: &[LirStmt]) -> Vec<LirStmt> {
    stmts
        .iter()
        .filter_map(|s| match s {
            LirStmt::Note(_) => None,
            LirStmt::Loop { count, body } => Some(LirStmt::Loop {
                count: *count,
                body: body.clone(),
            }),
            LirStmt::If {
                pred,
                then_body,
                else_body,
            } => Some(LirStmt::If {
                pred: *pred,
                then_body: strip_notes(then_body),
                else_body: strip_notes(else_body),
            }),
        })
        .collect()
}

// ── Dump (`--emit lir`) ────────────────────────────────────────────────────

impl fmt::Display for LirIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirIndex::I => write!(f, "i"),
            LirIndex::Reverse { last } => write!(f, "{} - i", last),
            LirIndex::Offset(k) => write!(f, "{} + i", k),
        }
    }
}

impl fmt::Display for LirPlace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Buffer(sym) => write!(f, "{}[{}]", sym, self.index)?,
            Target::Out => write!(f, "out[{}]", self.index)?,
        }
        if let Some(ch) = self.channel {
            write!(f, ".{}", ch.name())?;
        }
        Ok(())
    }
}

impl fmt::Display for LirExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirExpr::Const(v) => write!(f, "{:?}", v),
            LirExpr::IndexF => write!(f, "float(i)"),
            LirExpr::Load(place) => write!(f, "{}", place),
            LirExpr::Local(name) => write!(f, "%{}", name),
            LirExpr::Param(p) => write!(f, "param.{}", p.name()),
            LirExpr::Spectrum(idx) => write!(f, "spectrum[{}]", idx),
            LirExpr::Energy => write!(f, "energy"),
            LirExpr::Binary(op, a, b) => write!(f, "({} {} {})", op.symbol(), a, b),
            LirExpr::Clamp01(x) => write!(f, "(clamp01 {})", x),
            LirExpr::Floor(x) => write!(f, "(floor {})", x),
        }
    }
}

impl fmt::Display for LirPred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirPred::AudioPresent => write!(f, "audio_present"),
            LirPred::EnergyAbove(t) => write!(f, "energy > {:?}", t),
        }
    }
}

/// Human-readable LIR listing; prefix-form expressions, one kernel per block.
pub fn dump(program: &LirProgram) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "lir {} (frame_width = {})", program.function, program.frame_width);
    for slot in &program.slots {
        let _ = writeln!(out, "slot {}: f32[{}] owner \"{}\"", slot.symbol, slot.len, slot.owner);
    }
    for temp in &program.temps {
        let elem = match temp.elem {
            ElemType::Float => "f32",
            ElemType::Rgb => "rgb",
        };
        let _ = writeln!(out, "temp {}: {}[{}]", temp.symbol, elem, temp.len);
    }
    dump_stmts(&mut out, &program.body, 0);
    out
}

fn dump_stmts(out: &mut String, stmts: &[LirStmt], depth: usize) {
    use std::fmt::Write as _;

    let pad = "  ".repeat(depth);
    for stmt in stmts {
        match stmt {
            LirStmt::Note(text) => {
                let _ = writeln!(out, "{}; {}", pad, text);
            }
            LirStmt::Loop { count, body } => {
                let _ = writeln!(out, "{}loop i < {}", pad, count);
                for instr in body {
                    match instr {
                        LirInstr::Let { name, value } => {
                            let _ = writeln!(out, "{}  %{} = {}", pad, name, value);
                        }
                        LirInstr::Store { place, value } => {
                            let _ = writeln!(out, "{}  {} <- {}", pad, place, value);
                        }
                    }
                }
            }
            LirStmt::If {
                pred,
                then_body,
                else_body,
            } => {
                let _ = writeln!(out, "{}if {}", pad, pred);
                dump_stmts(out, then_body, depth + 1);
                let _ = writeln!(out, "{}else", pad);
                dump_stmts(out, else_body, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> LirProgram {
        LirProgram {
            function: "pattern_tiny_render".into(),
            frame_width: 4,
            slots: vec![LirSlot {
                symbol: "state_d".into(),
                owner: "d".into(),
                len: 4,
            }],
            temps: vec![LirTemp {
                symbol: "tmp_f0".into(),
                elem: ElemType::Float,
                len: 4,
            }],
            body: vec![
                LirStmt::Note("node \"ramp\": RampShape".into()),
                LirStmt::Loop {
                    count: 4,
                    body: vec![LirInstr::Store {
                        place: LirPlace::buffer("tmp_f0", LirIndex::I),
                        value: LirExpr::div(LirExpr::IndexF, LirExpr::Const(3.0)),
                    }],
                },
            ],
        }
    }

    #[test]
    fn index_resolution() {
        assert_eq!(LirIndex::I.resolve(3), Some(3));
        assert_eq!(LirIndex::Reverse { last: 7 }.resolve(2), Some(5));
        assert_eq!(LirIndex::Reverse { last: 1 }.resolve(2), None);
        assert_eq!(LirIndex::Offset(4).resolve(1), Some(5));
    }

    #[test]
    fn structural_eq_ignores_notes_and_owner() {
        let a = tiny();
        let mut b = tiny();
        b.body.remove(0);
        b.slots[0].owner = "state_d".into();
        b.function = "renamed".into();
        assert!(a.structurally_eq(&b));

        let mut c = tiny();
        c.temps[0].len = 5;
        assert!(!a.structurally_eq(&c));
    }

    #[test]
    fn dump_lists_buffers_and_kernels() {
        let text = dump(&tiny());
        assert!(text.contains("slot state_d: f32[4] owner \"d\""));
        assert!(text.contains("temp tmp_f0: f32[4]"));
        assert!(text.contains("tmp_f0[i] <- (/ float(i) 3.0)"));
    }

    #[test]
    fn loop_count_descends_into_branches() {
        let mut p = tiny();
        let kernel = p.body[1].clone();
        p.body.push(LirStmt::If {
            pred: LirPred::AudioPresent,
            then_body: vec![kernel.clone()],
            else_body: vec![kernel],
        });
        assert_eq!(p.loop_count(), 3);
    }
}
