// registry.rs: Node kind table: data contracts and parameter resolution
//
// The closed set of node kinds, each with its buffer contract (what it reads,
// what it writes, whether it owns persistent state), plus the typed
// resolution of a declared node into a `NodeOp` carrying validated params.
// `lower.rs` turns `NodeOp`s into LIR kernels; nothing else interprets kinds.
//
// Preconditions: nodes come from a schema-valid `Graph`.
// Postconditions: `resolve_node` returns a `NodeOp` whose params are in range.
// Failure modes: unknown kind names, out-of-range or ill-typed params produce
//   lowering diagnostics naming the node id.
// Side effects: none.

use serde::Serialize;

use crate::diag::{codes, Diagnostic};
use crate::graph::{Node, ParamValue};

/// Number of spectrum bins in an `AudioSnapshot`.
pub const SPECTRUM_BINS: usize = 256;

/// Default `decay_factor` of the original bloom generator.
pub const DEFAULT_DECAY: f32 = 0.92;

// ── Kinds ───────────────────────────────────────────────────────────────────

/// The closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    AudioInput,
    RampShape,
    PersistDecay,
    Colorize,
    Mirror,
    ConditionalFallback,
    PixelOutput,
}

/// All kinds in table order (used for iteration and fingerprinting).
pub const ALL_KINDS: [NodeKind; 7] = [
    NodeKind::AudioInput,
    NodeKind::RampShape,
    NodeKind::PersistDecay,
    NodeKind::Colorize,
    NodeKind::Mirror,
    NodeKind::ConditionalFallback,
    NodeKind::PixelOutput,
];

/// What a node consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Port {
    Nothing,
    Audio,
    Float,
    Rgb,
    /// Whatever buffer reaches the node; used by the conditional.
    Passthrough,
    Pixels,
}

/// Static data contract of a node kind.
#[derive(Debug, Clone, Serialize)]
pub struct KindContract {
    pub kind: NodeKind,
    pub name: &'static str,
    /// Names accepted from the original firmware graph files.
    pub aliases: &'static [&'static str],
    pub reads: Port,
    pub writes: Port,
    pub stateful: bool,
    pub transfer: &'static str,
}

impl NodeKind {
    pub fn name(self) -> &'static str {
        self.contract().name
    }

    pub fn is_stateful(self) -> bool {
        self.contract().stateful
    }

    /// True if the kind reads the buffer left by the previous node.
    pub fn consumes_buffer(self) -> bool {
        matches!(
            self.contract().reads,
            Port::Float | Port::Rgb | Port::Passthrough
        )
    }

    pub fn contract(self) -> KindContract {
        match self {
            NodeKind::AudioInput => KindContract {
                kind: self,
                name: "AudioInput",
                aliases: &["AudioSpectrum"],
                reads: Port::Audio,
                writes: Port::Float,
                stateful: false,
                transfer: "f[i] = audio ? clamp01(spectrum[i] * sensitivity) : 0",
            },
            NodeKind::RampShape => KindContract {
                kind: self,
                name: "RampShape",
                aliases: &["BandShape"],
                reads: Port::Nothing,
                writes: Port::Float,
                stateful: false,
                transfer: "f[i] = (float)i / (float)(width - 1)",
            },
            NodeKind::PersistDecay => KindContract {
                kind: self,
                name: "PersistDecay",
                aliases: &["BufferPersist"],
                reads: Port::Float,
                writes: Port::Float,
                stateful: true,
                transfer: "s[i] = d * s[i] + (1 - d) * in[i]",
            },
            NodeKind::Colorize => KindContract {
                kind: self,
                name: "Colorize",
                aliases: &[],
                reads: Port::Float,
                writes: Port::Rgb,
                stateful: false,
                transfer: "rgb[i] = clamp01(v[i]) * tint",
            },
            NodeKind::Mirror => KindContract {
                kind: self,
                name: "Mirror",
                aliases: &["MirrorReverse", "MirrorCenter"],
                reads: Port::Rgb,
                writes: Port::Rgb,
                stateful: false,
                transfer: "reverse: out[i] = in[N-1-i]; center: out[N/2-1-i] = out[N/2+i] = in[i]",
            },
            NodeKind::ConditionalFallback => KindContract {
                kind: self,
                name: "ConditionalFallback",
                aliases: &[],
                reads: Port::Passthrough,
                writes: Port::Passthrough,
                stateful: false,
                transfer: "if (predicate) primary else fallback",
            },
            NodeKind::PixelOutput => KindContract {
                kind: self,
                name: "PixelOutput",
                aliases: &["LedOutput"],
                reads: Port::Rgb,
                writes: Port::Pixels,
                stateful: false,
                transfer: "byte = floor(clamp01(c) * clamp01(brightness) * 255 + 0.5)",
            },
        }
    }

    /// Look up a kind by canonical name or alias.
    pub fn from_name(name: &str) -> Option<NodeKind> {
        ALL_KINDS
            .iter()
            .copied()
            .find(|k| k.name() == name || k.contract().aliases.contains(&name))
    }
}

/// Canonical compact JSON of the whole table, used as a fingerprint input.
pub fn canonical_json() -> String {
    let table: Vec<KindContract> = ALL_KINDS.iter().map(|k| k.contract()).collect();
    serde_json::to_string(&table).unwrap_or_default()
}

// ── Resolved nodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorVariant {
    FullReversal,
    CenterOrigin,
}

impl MirrorVariant {
    pub fn name(self) -> &'static str {
        match self {
            MirrorVariant::FullReversal => "full_reversal",
            MirrorVariant::CenterOrigin => "center_origin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColorMap {
    Grayscale,
    Tint([f32; 3]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate {
    AudioAvailable,
    EnergyAbove(f32),
}

/// A node kind together with its validated parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOp {
    AudioInput { bins: Option<usize> },
    RampShape,
    PersistDecay { decay: f32, bins: Option<usize> },
    Colorize { map: ColorMap },
    Mirror(MirrorVariant),
    ConditionalFallback { predicate: Predicate },
    PixelOutput,
}

impl NodeOp {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeOp::AudioInput { .. } => NodeKind::AudioInput,
            NodeOp::RampShape => NodeKind::RampShape,
            NodeOp::PersistDecay { .. } => NodeKind::PersistDecay,
            NodeOp::Colorize { .. } => NodeKind::Colorize,
            NodeOp::Mirror(_) => NodeKind::Mirror,
            NodeOp::ConditionalFallback { .. } => NodeKind::ConditionalFallback,
            NodeOp::PixelOutput => NodeKind::PixelOutput,
        }
    }
}

/// Resolve a declared node's kind and parameters.
pub fn resolve_node(node: &Node) -> Result<NodeOp, Diagnostic> {
    let Some(kind) = NodeKind::from_name(&node.kind) else {
        return Err(Diagnostic::error(
            codes::E_UNKNOWN_KIND,
            format!("unknown node kind `{}`", node.kind),
        )
        .with_node(node.id.clone())
        .with_field("kind")
        .with_hint(format!(
            "expected one of: {}",
            ALL_KINDS.iter().map(|k| k.name()).collect::<Vec<_>>().join(", ")
        )));
    };

    if node.has_fallback_key && kind != NodeKind::ConditionalFallback {
        return Err(bad_param(node, "fallback", "only ConditionalFallback nodes take a `fallback` list"));
    }

    let op = match kind {
        NodeKind::AudioInput => NodeOp::AudioInput {
            bins: bins_param(node)?,
        },
        NodeKind::RampShape => NodeOp::RampShape,
        NodeKind::PersistDecay => NodeOp::PersistDecay {
            decay: decay_param(node)?,
            bins: bins_param(node)?,
        },
        NodeKind::Colorize => NodeOp::Colorize {
            map: color_map_param(node)?,
        },
        NodeKind::Mirror => NodeOp::Mirror(mirror_variant(node)?),
        NodeKind::ConditionalFallback => NodeOp::ConditionalFallback {
            predicate: predicate_param(node)?,
        },
        NodeKind::PixelOutput => NodeOp::PixelOutput,
    };
    Ok(op)
}

fn bad_param(node: &Node, field: &str, message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(codes::E_BAD_PARAM, message)
        .with_node(node.id.clone())
        .with_field(field)
}

fn finite_number(node: &Node, field: &str) -> Result<Option<f32>, Diagnostic> {
    match node.param(field) {
        None => Ok(None),
        Some(ParamValue::Number(n)) if n.is_finite() => {
            let narrowed = *n as f32;
            if narrowed.is_finite() {
                Ok(Some(narrowed))
            } else {
                Err(bad_param(
                    node,
                    field,
                    format!("`{}` {} does not fit in an f32", field, n),
                ))
            }
        }
        Some(other) => Err(bad_param(
            node,
            field,
            format!("`{}` must be a finite number, got {:?}", field, other),
        )),
    }
}

fn decay_param(node: &Node) -> Result<f32, Diagnostic> {
    let decay = match node.param("decay_factor") {
        None => return Ok(DEFAULT_DECAY),
        Some(ParamValue::Number(n)) => *n,
        Some(other) => {
            return Err(Diagnostic::error(
                codes::E_PARAM_RANGE,
                format!("`decay_factor` must be a number in [0, 1], got {:?}", other),
            )
            .with_node(node.id.clone())
            .with_field("decay_factor"))
        }
    };
    if !(0.0..=1.0).contains(&decay) {
        return Err(Diagnostic::error(
            codes::E_PARAM_RANGE,
            format!("`decay_factor` {} is outside [0, 1]", decay),
        )
        .with_node(node.id.clone())
        .with_field("decay_factor"));
    }
    Ok(decay as f32)
}

fn bins_param(node: &Node) -> Result<Option<usize>, Diagnostic> {
    match node.param("bins") {
        None => Ok(None),
        Some(ParamValue::Number(n)) if n.fract() == 0.0 && *n >= 1.0 => Ok(Some(*n as usize)),
        Some(other) => Err(bad_param(
            node,
            "bins",
            format!("`bins` must be a positive integer, got {:?}", other),
        )),
    }
}

fn color_map_param(node: &Node) -> Result<ColorMap, Diagnostic> {
    let map = node
        .param("map")
        .map(|v| v.as_text().unwrap_or_default())
        .unwrap_or("grayscale");
    match map {
        "grayscale" => Ok(ColorMap::Grayscale),
        "tint" => {
            let mut tint = [1.0f32; 3];
            for (slot, field) in tint.iter_mut().zip(["tint_r", "tint_g", "tint_b"]) {
                if let Some(v) = finite_number(node, field)? {
                    *slot = v;
                }
            }
            Ok(ColorMap::Tint(tint))
        }
        other => Err(bad_param(
            node,
            "map",
            format!("unknown color map `{}` (expected `grayscale` or `tint`)", other),
        )),
    }
}

fn mirror_variant(node: &Node) -> Result<MirrorVariant, Diagnostic> {
    let from_kind = match node.kind.as_str() {
        "MirrorReverse" => Some(MirrorVariant::FullReversal),
        "MirrorCenter" => Some(MirrorVariant::CenterOrigin),
        _ => None,
    };
    let from_param = match node.param("variant") {
        None => None,
        Some(value) => match value.as_text() {
            Some("full_reversal") | Some("reverse") => Some(MirrorVariant::FullReversal),
            Some("center_origin") | Some("center") => Some(MirrorVariant::CenterOrigin),
            _ => {
                return Err(Diagnostic::error(
                    codes::E_MIRROR_VARIANT,
                    format!("unknown Mirror variant {:?}", value),
                )
                .with_node(node.id.clone())
                .with_field("variant")
                .with_hint("use \"full_reversal\" or \"center_origin\""))
            }
        },
    };
    match (from_kind, from_param) {
        (Some(k), Some(p)) if k != p => Err(Diagnostic::error(
            codes::E_MIRROR_VARIANT,
            format!(
                "kind `{}` conflicts with variant \"{}\"",
                node.kind,
                p.name()
            ),
        )
        .with_node(node.id.clone())
        .with_field("variant")),
        (Some(v), _) | (None, Some(v)) => Ok(v),
        (None, None) => Err(Diagnostic::error(
            codes::E_MIRROR_VARIANT,
            "Mirror must declare its variant",
        )
        .with_node(node.id.clone())
        .with_field("variant")
        .with_hint(
            "set \"variant\": \"full_reversal\" or \"center_origin\", or use MirrorReverse / MirrorCenter",
        )),
    }
}

fn predicate_param(node: &Node) -> Result<Predicate, Diagnostic> {
    let name = node
        .param("predicate")
        .map(|v| v.as_text().unwrap_or_default())
        .unwrap_or("audio_available");
    match name {
        "audio_available" => Ok(Predicate::AudioAvailable),
        "energy_above" => match finite_number(node, "threshold")? {
            Some(t) => Ok(Predicate::EnergyAbove(t)),
            None => Err(bad_param(
                node,
                "threshold",
                "predicate `energy_above` needs a numeric `threshold`",
            )),
        },
        other => Err(bad_param(
            node,
            "predicate",
            format!(
                "unknown predicate `{}` (expected `audio_available` or `energy_above`)",
                other
            ),
        )),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
