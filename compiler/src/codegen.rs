// codegen.rs: C++ emission of lowered pattern programs
//
// Prints a `LirProgram` as one self-contained C++ render procedure: a
// provenance header, includes, one module-scope static per state slot, and an
// `extern "C"` function whose body declares the temporaries and then runs the
// kernels in declaration order. Expression trees are printed with the minimum
// parentheses that still reproduce the exact tree, so `parser` can read the
// text back into the same LIR.
//
// Preconditions: `lir` came from `lower::lower` (or passed its obligations).
// Postconditions: the same LIR, provenance and options always yield
//   byte-identical text.
// Failure modes: none.
// Side effects: none.

use std::fmt::Write as _;

use crate::lir::*;
use crate::pipeline::Provenance;
use crate::registry::SPECTRUM_BINS;

// ── Public types ────────────────────────────────────────────────────────────

/// Emission flavour. Changes includes and attributes, never numerics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetProfile {
    #[default]
    Firmware,
    Host,
}

impl TargetProfile {
    pub fn name(self) -> &'static str {
        match self {
            TargetProfile::Firmware => "firmware",
            TargetProfile::Host => "host",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodegenOptions {
    pub profile: TargetProfile,
    /// Overrides the default `pattern_<graph>_render` symbol.
    pub function_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCode {
    pub cpp_source: String,
    pub function_name: String,
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn codegen(lir: &LirProgram, provenance: &Provenance, options: &CodegenOptions) -> GeneratedCode {
    let _span = tracing::debug_span!("codegen", profile = options.profile.name()).entered();

    let function_name = options
        .function_name
        .as_deref()
        .map(c_identifier)
        .unwrap_or_else(|| lir.function.clone());
    let mut ctx = CodegenCtx {
        lir,
        options,
        out: String::new(),
    };
    ctx.emit_preamble(provenance);
    ctx.emit_state_storage();
    ctx.emit_function(&function_name);

    tracing::debug!(bytes = ctx.out.len(), function = %function_name, "emitted");
    GeneratedCode {
        cpp_source: ctx.out,
        function_name,
    }
}

/// The `pgc_runtime.h` header every emitted procedure includes.
pub fn runtime_header() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "// pgc_runtime.h: ABI of pgc-generated render procedures.");
    let _ = writeln!(out, "#pragma once");
    let _ = writeln!(out);
    let _ = writeln!(out, "#include <cmath>");
    let _ = writeln!(out, "#include <cstdint>");
    let _ = writeln!(out);
    let _ = writeln!(out, "struct CRGBF {{\n    float r;\n    float g;\n    float b;\n}};");
    let _ = writeln!(out);
    let _ = writeln!(out, "struct CRGB8 {{\n    uint8_t r;\n    uint8_t g;\n    uint8_t b;\n}};");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "struct AudioSnapshot {{\n    float spectrum[{}];\n    float energy;\n}};",
        SPECTRUM_BINS
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "struct PatternParameters {{\n    float brightness;\n    float softness;\n    float sensitivity;\n}};"
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "static inline float clamp_val(float x, float lo, float hi) {{");
    let _ = writeln!(out, "    return x < lo ? lo : (x > hi ? hi : x);");
    let _ = writeln!(out, "}}");
    out
}

/// Map an arbitrary name onto a C identifier.
fn c_identifier(name: &str) -> String {
    let mut id = crate::state::sanitize(name);
    if id.is_empty() || id.starts_with(|c: char| c.is_ascii_digit()) {
        id.insert(0, '_');
    }
    id
}

// ── Codegen context ─────────────────────────────────────────────────────────

struct CodegenCtx<'a> {
    lir: &'a LirProgram,
    options: &'a CodegenOptions,
    out: String,
}

impl<'a> CodegenCtx<'a> {
    fn emit_preamble(&mut self, provenance: &Provenance) {
        let _ = writeln!(
            self.out,
            "// Generated by pgc {}. Do not edit.",
            provenance.compiler_version
        );
        let _ = writeln!(self.out, "// graph-sha256: {}", provenance.source_hash_hex());
        let _ = writeln!(self.out, "// profile: {}", self.options.profile.name());
        let _ = writeln!(
            self.out,
            "// Float expressions are evaluation-ordered; build with -ffp-contract=off."
        );
        let _ = writeln!(self.out);
        match self.options.profile {
            TargetProfile::Firmware => {
                let _ = writeln!(self.out, "#include \"esp_attr.h\"");
            }
            TargetProfile::Host => {
                let _ = writeln!(self.out, "#include <cmath>");
            }
        }
        let _ = writeln!(self.out, "#include \"pgc_runtime.h\"");
        let _ = writeln!(self.out);
    }

    fn emit_state_storage(&mut self) {
        if self.lir.slots.is_empty() {
            return;
        }
        for slot in &self.lir.slots {
            let _ = writeln!(self.out, "static float {}[{}] = {{}};", slot.symbol, slot.len);
        }
        let _ = writeln!(self.out);
    }

    fn emit_function(&mut self, name: &str) {
        let attr = match self.options.profile {
            TargetProfile::Firmware => " IRAM_ATTR",
            TargetProfile::Host => "",
        };
        let _ = writeln!(
            self.out,
            "extern \"C\" void{} {}(float time, const AudioSnapshot* audio, const PatternParameters& params, CRGB8* out) {{",
            attr, name
        );
        for temp in &self.lir.temps {
            let _ = writeln!(
                self.out,
                "    {} {}[{}] = {{}};",
                temp.elem.cpp_type(),
                temp.symbol,
                temp.len
            );
        }
        if !self.lir.temps.is_empty() {
            let _ = writeln!(self.out);
        }
        let lir = self.lir;
        self.emit_stmts(&lir.body, 1);
        let _ = writeln!(self.out, "}}");
    }

    fn emit_stmts(&mut self, stmts: &[LirStmt], depth: usize) {
        let pad = "    ".repeat(depth);
        for stmt in stmts {
            match stmt {
                LirStmt::Note(text) => {
                    let _ = writeln!(self.out, "{}// {}", pad, text.replace(['\n', '\r'], " "));
                }
                LirStmt::Loop { count, body } => {
                    let _ = writeln!(self.out, "{}for (int i = 0; i < {}; ++i) {{", pad, count);
                    for instr in body {
                        let _ = writeln!(self.out, "{}    {}", pad, instr_text(instr));
                    }
                    let _ = writeln!(self.out, "{}}}", pad);
                }
                LirStmt::If {
                    pred,
                    then_body,
                    else_body,
                } => {
                    let _ = writeln!(self.out, "{}if ({}) {{", pad, pred_text(pred));
                    self.emit_stmts(then_body, depth + 1);
                    let _ = writeln!(self.out, "{}}} else {{", pad);
                    self.emit_stmts(else_body, depth + 1);
                    let _ = writeln!(self.out, "{}}}", pad);
                }
            }
        }
    }
}

// ── Expression printing ─────────────────────────────────────────────────────

/// Shortest round-trip decimal plus `f`.
pub fn float_literal(v: f32) -> String {
    format!("{:?}f", v)
}

fn pred_text(pred: &LirPred) -> String {
    match pred {
        LirPred::AudioPresent => "audio != nullptr".to_string(),
        LirPred::EnergyAbove(t) => format!(
            "audio != nullptr && audio->energy > {}",
            float_literal(*t)
        ),
    }
}

fn instr_text(instr: &LirInstr) -> String {
    match instr {
        LirInstr::Let { name, value } => format!("const float {} = {};", name, expr_text(value)),
        LirInstr::Store { place, value } if place.target == Target::Out => format!(
            "{} = (uint8_t)({});",
            place_text(place),
            expr_text(value)
        ),
        LirInstr::Store { place, value } => {
            format!("{} = {};", place_text(place), expr_text(value))
        }
    }
}

fn place_text(place: &LirPlace) -> String {
    let base = match &place.target {
        Target::Buffer(sym) => sym.as_str(),
        Target::Out => "out",
    };
    match place.channel {
        Some(ch) => format!("{}[{}].{}", base, place.index, ch.name()),
        None => format!("{}[{}]", base, place.index),
    }
}

/// C++ text of an expression tree.
pub fn expr_text(expr: &LirExpr) -> String {
    match expr {
        LirExpr::Const(v) => float_literal(*v),
        LirExpr::IndexF => "(float)i".to_string(),
        LirExpr::Load(place) => place_text(place),
        LirExpr::Local(name) => name.clone(),
        LirExpr::Param(field) => format!("params.{}", field.name()),
        LirExpr::Spectrum(idx) => format!("audio->spectrum[{}]", idx),
        LirExpr::Energy => "audio->energy".to_string(),
        LirExpr::Binary(op, lhs, rhs) => {
            // Left-associative: a right operand of equal precedence needs parens.
            let prec = op.precedence();
            let l = wrap(lhs, lhs.precedence() < prec);
            let r = wrap(rhs, rhs.precedence() <= prec);
            format!("{} {} {}", l, op.symbol(), r)
        }
        LirExpr::Clamp01(x) => format!("clamp_val({}, 0.0f, 1.0f)", expr_text(x)),
        LirExpr::Floor(x) => format!("std::floor({})", expr_text(x)),
    }
}

fn wrap(expr: &LirExpr, parens: bool) -> String {
    if parens {
        format!("({})", expr_text(expr))
    } else {
        expr_text(expr)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::load_graph;
    use crate::lower::lower;
    use crate::pipeline::compute_provenance;

    const SRC: &str = r#"{"name": "bloom", "frame_width": 8, "nodes": [
        {"id": "ramp", "kind": "RampShape"},
        {"id": "decay", "kind": "PersistDecay", "decay_factor": 0.92},
        {"id": "color", "kind": "Colorize"},
        {"id": "out", "kind": "PixelOutput"}
    ]}"#;

    fn emit(options: &CodegenOptions) -> GeneratedCode {
        let graph = load_graph(SRC).graph.unwrap();
        let lir = lower(&graph).lir.unwrap();
        codegen(&lir, &compute_provenance(SRC), options)
    }

    #[test]
    fn float_literals_round_trip() {
        assert_eq!(float_literal(1.0), "1.0f");
        assert_eq!(float_literal(0.92), "0.92f");
        assert_eq!(float_literal(255.0), "255.0f");
        assert_eq!(float_literal(1e-7), "1e-7f");
        for v in [0.1f32, 0.92, 1.0 / 3.0, 123456.79] {
            let text = float_literal(v);
            assert_eq!(text.trim_end_matches('f').parse::<f32>().unwrap(), v);
        }
    }

    #[test]
    fn parentheses_follow_the_tree() {
        let decay = LirExpr::add(
            LirExpr::mul(LirExpr::Const(0.92), LirExpr::local("s")),
            LirExpr::mul(
                LirExpr::sub(LirExpr::Const(1.0), LirExpr::Const(0.92)),
                LirExpr::local("x"),
            ),
        );
        assert_eq!(expr_text(&decay), "0.92f * s + (1.0f - 0.92f) * x");

        let right_nested = LirExpr::sub(
            LirExpr::local("a"),
            LirExpr::sub(LirExpr::local("b"), LirExpr::local("c")),
        );
        assert_eq!(expr_text(&right_nested), "a - (b - c)");

        let left_nested = LirExpr::sub(
            LirExpr::sub(LirExpr::local("a"), LirExpr::local("b")),
            LirExpr::local("c"),
        );
        assert_eq!(expr_text(&left_nested), "a - b - c");
    }

    #[test]
    fn places_and_reads() {
        let place = LirPlace::buffer("tmp_rgb0", LirIndex::Reverse { last: 7 }).with_channel(Channel::G);
        assert_eq!(place_text(&place), "tmp_rgb0[7 - i].g");
        assert_eq!(
            expr_text(&LirExpr::Spectrum(LirIndex::Offset(4))),
            "audio->spectrum[4 + i]"
        );
        assert_eq!(
            pred_text(&LirPred::EnergyAbove(0.25)),
            "audio != nullptr && audio->energy > 0.25f"
        );
    }

    #[test]
    fn firmware_and_host_profiles() {
        let fw = emit(&CodegenOptions::default()).cpp_source;
        assert!(fw.contains("#include \"esp_attr.h\""));
        assert!(fw.contains("extern \"C\" void IRAM_ATTR pattern_bloom_render("));

        let host = emit(&CodegenOptions {
            profile: TargetProfile::Host,
            function_name: None,
        })
        .cpp_source;
        assert!(host.contains("#include <cmath>"));
        assert!(host.contains("extern \"C\" void pattern_bloom_render("));
        assert!(!host.contains("IRAM_ATTR"));
    }

    #[test]
    fn layout_order() {
        let code = emit(&CodegenOptions::default()).cpp_source;
        let pos = |needle: &str| code.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
        assert!(pos("// Generated by pgc") < pos("#include"));
        assert!(pos("#include") < pos("static float state_decay[8] = {};"));
        assert!(pos("static float state_decay") < pos("extern \"C\""));
        assert!(pos("    float tmp_f0[8] = {};") < pos("    // node \"ramp\": RampShape"));
        assert!(code.contains(
            "        state_decay[i] = 0.92f * state_decay[i] + (1.0f - 0.92f) * tmp_f0[i];"
        ));
        assert!(code.contains(
            "        out[i].r = (uint8_t)(std::floor(clamp_val(tmp_rgb0[i].r, 0.0f, 1.0f) * bright * 255.0f + 0.5f));"
        ));
        assert!(code.ends_with("}\n"));
    }

    #[test]
    fn function_name_override_is_sanitized() {
        let code = emit(&CodegenOptions {
            profile: TargetProfile::Host,
            function_name: Some("9-lives".into()),
        });
        assert_eq!(code.function_name, "_9_lives");
        assert!(code.cpp_source.contains("void _9_lives(float time"));
    }

    #[test]
    fn emission_is_deterministic() {
        let a = emit(&CodegenOptions::default());
        let b = emit(&CodegenOptions::default());
        assert_eq!(a, b);
    }

    #[test]
    fn runtime_header_declares_abi() {
        let h = runtime_header();
        for needle in [
            "struct CRGBF",
            "struct CRGB8",
            "float spectrum[256];",
            "struct PatternParameters",
            "static inline float clamp_val",
        ] {
            assert!(h.contains(needle), "missing {needle}");
        }
    }
}
