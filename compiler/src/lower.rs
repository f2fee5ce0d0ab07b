// lower.rs: Graph lowering to LIR & obligation checks
//
// Walks the node chain in declaration order, resolves each node through the
// kind table, and emits its transfer function as LIR loop kernels over
// explicitly allocated temporaries and state slots. The conditional fallback
// becomes a single `If` whose two branches join into one buffer. After
// lowering, the program is checked against the obligations both execution
// paths rely on (terminal coverage, static index bounds, declared buffers,
// single state writer per path) and a `Cert` records the outcome.
//
// Preconditions: `graph` passed schema validation (`graph::load_graph`).
// Postconditions: on success, `LowerResult.lir` is a self-contained program
//   whose kernels only touch declared buffers within bounds.
// Failure modes: unknown kinds, bad params, buffer type/length mismatches,
//   missing inputs, misplaced terminal or conditional nodes produce error
//   diagnostics naming the node id. Dropped buffers produce warnings.
// Side effects: none.

use std::collections::BTreeMap;

use crate::diag::{codes, has_errors, Diagnostic};
use crate::graph::{Graph, Node};
use crate::id::IdAllocator;
use crate::lir::*;
use crate::registry::{
    resolve_node, ColorMap, MirrorVariant, NodeKind, NodeOp, Predicate, SPECTRUM_BINS,
};
use crate::state::{sanitize, StateAllocator};

// ── Output types ────────────────────────────────────────────────────────────

/// Result of lowering.
#[derive(Debug)]
pub struct LowerResult {
    pub lir: Option<LirProgram>,
    pub cert: Option<Cert>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LowerResult {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }
}

/// Machine-checkable evidence for the lowering obligations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cert {
    /// Exactly one top-level kernel writes every output pixel, all channels.
    pub terminal_covers_frame: bool,
    /// Every index a kernel can form stays inside its buffer.
    pub indices_in_bounds: bool,
    /// Every buffer symbol referenced is a declared temp or slot.
    pub buffers_declared: bool,
    /// On every path, each state slot is written by at most one kernel.
    pub single_state_writer: bool,
}

impl Cert {
    pub fn all_pass(&self) -> bool {
        self.terminal_covers_frame
            && self.indices_in_bounds
            && self.buffers_declared
            && self.single_state_writer
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Lower a validated graph to LIR and check the lowering obligations.
pub fn lower(graph: &Graph) -> LowerResult {
    let _span = tracing::debug_span!("lower", nodes = graph.node_count()).entered();

    let mut engine = Lowerer {
        frame_width: graph.frame_width,
        ids: IdAllocator::new(),
        state: StateAllocator::new(),
        temps: Vec::new(),
        float_temps: 0,
        rgb_temps: 0,
        seen_conditional: false,
        diagnostics: Vec::new(),
    };

    let body = engine.lower_top(&graph.nodes);
    let Lowerer {
        state,
        temps,
        mut diagnostics,
        ..
    } = engine;

    let Some(body) = body.filter(|_| !has_errors(&diagnostics)) else {
        return LowerResult {
            lir: None,
            cert: None,
            diagnostics,
        };
    };

    let base = graph
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or("graph");
    let lir = LirProgram {
        function: format!("pattern_{}_render", sanitize(base)),
        frame_width: graph.frame_width,
        slots: state.into_slots(),
        temps,
        body,
    };

    let cert = verify_obligations(&lir);
    if !cert.all_pass() {
        diagnostics.push(Diagnostic::error(
            codes::E_OBLIGATION,
            format!("lowered program failed its obligations: {:?}", cert),
        ));
    }
    tracing::debug!(
        slots = lir.slots.len(),
        temps = lir.temps.len(),
        kernels = lir.loop_count(),
        "lowered"
    );

    let ok = !has_errors(&diagnostics);
    LowerResult {
        lir: ok.then_some(lir),
        cert: Some(cert),
        diagnostics,
    }
}

// ── Lowering engine ─────────────────────────────────────────────────────────

/// The buffer a node leaves behind for the next one.
#[derive(Debug, Clone)]
struct Buf {
    symbol: String,
    elem: ElemType,
    len: usize,
    producer: String,
    /// Warn if the next node ignores this buffer.
    warn_if_dropped: bool,
}

fn elem_name(elem: ElemType) -> &'static str {
    match elem {
        ElemType::Float => "float",
        ElemType::Rgb => "RGB",
    }
}

struct Lowerer {
    frame_width: usize,
    ids: IdAllocator,
    state: StateAllocator,
    temps: Vec<LirTemp>,
    float_temps: usize,
    rgb_temps: usize,
    seen_conditional: bool,
    diagnostics: Vec<Diagnostic>,
}

/// Where a chain segment sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Top,
    Branch,
}

type Lowered<T> = Result<T, Diagnostic>;

impl Lowerer {
    fn lower_top(&mut self, nodes: &[Node]) -> Option<Vec<LirStmt>> {
        let (stmts, _) = self.lower_chain(nodes, None, Scope::Top)?;
        let ends_in_output = nodes
            .last()
            .and_then(|n| NodeKind::from_name(&n.kind))
            .is_some_and(|k| k == NodeKind::PixelOutput);
        if !ends_in_output {
            let last = nodes.last().map(|n| n.id.clone()).unwrap_or_default();
            self.diagnostics.push(
                Diagnostic::error(codes::E_TERMINAL, "graph must end with a PixelOutput node")
                    .with_node(last),
            );
            return None;
        }
        Some(stmts)
    }

    /// Lower a node sequence. Returns the statements and the buffer left by
    /// the last node, or `None` after recording an error.
    fn lower_chain(
        &mut self,
        nodes: &[Node],
        entry: Option<Buf>,
        scope: Scope,
    ) -> Option<(Vec<LirStmt>, Option<Buf>)> {
        let mut stmts = Vec::new();
        let mut cur = entry;
        let mut i = 0;
        while i < nodes.len() {
            let node = &nodes[i];
            let op = match resolve_node(node) {
                Ok(op) => op,
                Err(diag) => {
                    self.diagnostics.push(diag);
                    return None;
                }
            };
            tracing::trace!(node = %node.id, kind = op.kind().name(), "lowering node");

            if let NodeOp::ConditionalFallback { predicate } = op {
                let rest = &nodes[i + 1..];
                let split = match rest.last().and_then(|n| NodeKind::from_name(&n.kind)) {
                    Some(NodeKind::PixelOutput) => rest.len() - 1,
                    _ => rest.len(),
                };
                match self.lower_conditional(node, predicate, &rest[..split], cur.clone(), scope) {
                    Ok((stmt_block, joined)) => {
                        stmts.extend(stmt_block);
                        cur = Some(joined);
                    }
                    Err(diag) => {
                        self.diagnostics.push(diag);
                        return None;
                    }
                }
                i += 1 + split;
                continue;
            }

            let next_consumes = match nodes.get(i + 1) {
                Some(next) => NodeKind::from_name(&next.kind).map_or(true, |k| k.consumes_buffer()),
                None => scope == Scope::Branch,
            };
            let is_last = i + 1 == nodes.len();
            match self.lower_node(node, &op, cur.take(), next_consumes, is_last, scope, &mut stmts) {
                Ok(next) => cur = next,
                Err(diag) => {
                    self.diagnostics.push(diag);
                    return None;
                }
            }
            i += 1;
        }
        Some((stmts, cur))
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_node(
        &mut self,
        node: &Node,
        op: &NodeOp,
        cur: Option<Buf>,
        next_consumes: bool,
        is_last: bool,
        scope: Scope,
        stmts: &mut Vec<LirStmt>,
    ) -> Lowered<Option<Buf>> {
        let kind = op.kind();
        match *op {
            NodeOp::AudioInput { bins } => {
                if !next_consumes {
                    stmts.push(LirStmt::Note(format!(
                        "node {:?}: AudioInput (unused, spectrum not sampled)",
                        node.id
                    )));
                    return Ok(cur);
                }
                let bins = bins.unwrap_or(self.frame_width);
                if bins > SPECTRUM_BINS {
                    return Err(Diagnostic::error(
                        codes::E_BAD_PARAM,
                        format!("`bins` {} exceeds the {} spectrum bins", bins, SPECTRUM_BINS),
                    )
                    .with_node(node.id.clone())
                    .with_field("bins"));
                }
                self.warn_dropped(&cur, node);
                let dst = self.acquire(ElemType::Float, bins, None, &node.id);
                stmts.push(note(node, kind));
                let sample = LirExpr::clamp01(LirExpr::mul(
                    LirExpr::Spectrum(LirIndex::I),
                    LirExpr::Param(ParamField::Sensitivity),
                ));
                stmts.push(LirStmt::If {
                    pred: LirPred::AudioPresent,
                    then_body: vec![kernel(bins, vec![store(&dst, LirIndex::I, None, sample)])],
                    else_body: vec![kernel(
                        bins,
                        vec![store(&dst, LirIndex::I, None, LirExpr::Const(0.0))],
                    )],
                });
                Ok(Some(dst))
            }

            NodeOp::RampShape => {
                self.warn_dropped(&cur, node);
                let n = self.frame_width;
                let avoid = cur.as_ref().map(|b| b.symbol.clone());
                let dst = self.acquire(ElemType::Float, n, avoid.as_deref(), &node.id);
                let value = if n == 1 {
                    LirExpr::Const(0.0)
                } else {
                    LirExpr::div(LirExpr::IndexF, LirExpr::Const((n - 1) as f32))
                };
                stmts.push(note(node, kind));
                stmts.push(kernel(n, vec![store(&dst, LirIndex::I, None, value)]));
                Ok(Some(dst))
            }

            NodeOp::PersistDecay { decay, bins } => {
                let src = need_input(node, kind, cur, ElemType::Float)?;
                if let Some(bins) = bins {
                    if bins != src.len {
                        return Err(Diagnostic::error(
                            codes::E_LENGTH_MISMATCH,
                            format!(
                                "declared `bins` {} does not match input length {} from {:?}",
                                bins, src.len, src.producer
                            ),
                        )
                        .with_node(node.id.clone())
                        .with_field("bins"));
                    }
                }
                let slot_id = self.ids.alloc_slot();
                let slot = self.state.allocate(slot_id, &node.id, src.len).symbol.clone();
                let dst = Buf {
                    symbol: slot,
                    elem: ElemType::Float,
                    len: src.len,
                    producer: node.id.clone(),
                    warn_if_dropped: true,
                };
                let value = LirExpr::add(
                    LirExpr::mul(LirExpr::Const(decay), load(&dst, LirIndex::I, None)),
                    LirExpr::mul(
                        LirExpr::sub(LirExpr::Const(1.0), LirExpr::Const(decay)),
                        load(&src, LirIndex::I, None),
                    ),
                );
                stmts.push(note(node, kind));
                stmts.push(kernel(src.len, vec![store(&dst, LirIndex::I, None, value)]));
                Ok(Some(dst))
            }

            NodeOp::Colorize { map } => {
                let src = need_input(node, kind, cur, ElemType::Float)?;
                let dst = self.acquire(ElemType::Rgb, src.len, None, &node.id);
                let mut body = vec![LirInstr::Let {
                    name: "v".into(),
                    value: LirExpr::clamp01(load(&src, LirIndex::I, None)),
                }];
                for ch in CHANNELS {
                    let value = match map {
                        ColorMap::Grayscale => LirExpr::local("v"),
                        ColorMap::Tint(tint) => {
                            LirExpr::mul(LirExpr::local("v"), LirExpr::Const(tint[ch.lane()]))
                        }
                    };
                    body.push(store(&dst, LirIndex::I, Some(ch), value));
                }
                stmts.push(note(node, kind));
                stmts.push(kernel(src.len, body));
                Ok(Some(dst))
            }

            NodeOp::Mirror(variant) => {
                let src = need_input(node, kind, cur, ElemType::Rgb)?;
                let n = src.len;
                if variant == MirrorVariant::CenterOrigin && n % 2 != 0 {
                    return Err(Diagnostic::error(
                        codes::E_MIRROR_ODD_WIDTH,
                        format!("center-origin Mirror needs an even buffer length, got {}", n),
                    )
                    .with_node(node.id.clone())
                    .with_hint("use variant \"full_reversal\" or an even frame_width"));
                }
                let dst = self.acquire(ElemType::Rgb, n, Some(&src.symbol), &node.id);
                let (count, body) = match variant {
                    MirrorVariant::FullReversal => {
                        let from = LirIndex::Reverse { last: n - 1 };
                        let body = CHANNELS
                            .iter()
                            .map(|&ch| store(&dst, LirIndex::I, Some(ch), load(&src, from, Some(ch))))
                            .collect();
                        (n, body)
                    }
                    MirrorVariant::CenterOrigin => {
                        let half = n / 2;
                        let mut body = Vec::with_capacity(6);
                        for to in [LirIndex::Reverse { last: half - 1 }, LirIndex::Offset(half)] {
                            for ch in CHANNELS {
                                body.push(store(&dst, to, Some(ch), load(&src, LirIndex::I, Some(ch))));
                            }
                        }
                        (half, body)
                    }
                };
                stmts.push(LirStmt::Note(format!(
                    "node {:?}: Mirror ({})",
                    node.id,
                    variant.name()
                )));
                stmts.push(kernel(count, body));
                Ok(Some(dst))
            }

            NodeOp::PixelOutput => {
                if scope == Scope::Branch || !is_last {
                    return Err(Diagnostic::error(
                        codes::E_TERMINAL,
                        "PixelOutput must be the last node of the top-level chain",
                    )
                    .with_node(node.id.clone()));
                }
                let src = need_input(node, kind, cur, ElemType::Rgb)?;
                if src.len != self.frame_width {
                    return Err(Diagnostic::error(
                        codes::E_LENGTH_MISMATCH,
                        format!(
                            "PixelOutput needs {} pixels (frame_width) but {:?} produces {}",
                            self.frame_width, src.producer, src.len
                        ),
                    )
                    .with_node(node.id.clone()));
                }
                let mut body = vec![LirInstr::Let {
                    name: "bright".into(),
                    value: LirExpr::clamp01(LirExpr::Param(ParamField::Brightness)),
                }];
                for ch in CHANNELS {
                    let scaled = LirExpr::mul(
                        LirExpr::mul(
                            LirExpr::clamp01(load(&src, LirIndex::I, Some(ch))),
                            LirExpr::local("bright"),
                        ),
                        LirExpr::Const(255.0),
                    );
                    body.push(LirInstr::Store {
                        place: LirPlace {
                            target: Target::Out,
                            index: LirIndex::I,
                            channel: Some(ch),
                        },
                        value: LirExpr::floor(LirExpr::add(scaled, LirExpr::Const(0.5))),
                    });
                }
                stmts.push(note(node, kind));
                stmts.push(kernel(self.frame_width, body));
                Ok(None)
            }

            // Handled in `lower_chain`, which owns the branch segment.
            NodeOp::ConditionalFallback { .. } => Ok(cur),
        }
    }

    /// The primary branch lowers before the fallback list, so its temps and
    /// state slots are numbered first.
    fn lower_conditional(
        &mut self,
        node: &Node,
        predicate: Predicate,
        primary: &[Node],
        entry: Option<Buf>,
        scope: Scope,
    ) -> Lowered<(Vec<LirStmt>, Buf)> {
        let placement = |msg: &str| {
            Diagnostic::error(codes::E_CONDITIONAL_PLACEMENT, msg.to_string())
                .with_node(node.id.clone())
        };
        if scope == Scope::Branch {
            return Err(placement("ConditionalFallback cannot appear inside a fallback branch"));
        }
        if self.seen_conditional {
            return Err(placement("a graph may contain at most one ConditionalFallback"));
        }
        self.seen_conditional = true;
        if node.fallback.is_empty() {
            return Err(placement("ConditionalFallback needs a non-empty `fallback` list")
                .with_field("fallback"));
        }
        if primary.is_empty() {
            return Err(placement(
                "ConditionalFallback needs at least one node between it and PixelOutput",
            ));
        }

        let branch_entry = entry.map(|b| Buf {
            warn_if_dropped: false,
            ..b
        });

        let (mut then_body, primary_out) =
            self.lower_branch(primary, branch_entry.clone())?;
        let (mut else_body, fallback_out) =
            self.lower_branch(&node.fallback, branch_entry)?;

        let (Some(primary_out), Some(fallback_out)) = (primary_out, fallback_out) else {
            return Err(Diagnostic::error(
                codes::E_MISSING_INPUT,
                "both branches of ConditionalFallback must produce a buffer",
            )
            .with_node(node.id.clone()));
        };
        if primary_out.elem != fallback_out.elem {
            return Err(Diagnostic::error(
                codes::E_TYPE_MISMATCH,
                format!(
                    "branches disagree: primary yields {} from {:?}, fallback yields {} from {:?}",
                    elem_name(primary_out.elem),
                    primary_out.producer,
                    elem_name(fallback_out.elem),
                    fallback_out.producer
                ),
            )
            .with_node(node.id.clone()));
        }
        if primary_out.len != fallback_out.len {
            return Err(Diagnostic::error(
                codes::E_LENGTH_MISMATCH,
                format!(
                    "branches disagree: primary yields {} elements, fallback yields {}",
                    primary_out.len, fallback_out.len
                ),
            )
            .with_node(node.id.clone()));
        }

        // State slots never serve as the join buffer.
        let join = if self.temps.iter().any(|t| t.symbol == primary_out.symbol) {
            Buf {
                producer: node.id.clone(),
                warn_if_dropped: true,
                ..primary_out.clone()
            }
        } else {
            self.fresh_temp(primary_out.elem, primary_out.len, &node.id)
        };
        for (body, out) in [(&mut then_body, &primary_out), (&mut else_body, &fallback_out)] {
            if out.symbol != join.symbol {
                body.push(LirStmt::Note(format!("join {} into {}", out.symbol, join.symbol)));
                body.push(copy_kernel(out, &join));
            }
        }

        let pred = match predicate {
            Predicate::AudioAvailable => LirPred::AudioPresent,
            Predicate::EnergyAbove(t) => LirPred::EnergyAbove(t),
        };
        let stmts = vec![
            note(node, NodeKind::ConditionalFallback),
            LirStmt::If {
                pred,
                then_body,
                else_body,
            },
        ];
        Ok((stmts, join))
    }

    fn lower_branch(
        &mut self,
        nodes: &[Node],
        entry: Option<Buf>,
    ) -> Lowered<(Vec<LirStmt>, Option<Buf>)> {
        let before = self.diagnostics.len();
        match self.lower_chain(nodes, entry, Scope::Branch) {
            Some(result) => Ok(result),
            None => {
                // `lower_chain` recorded the cause; surface it to the caller.
                let diag = self.diagnostics.drain(before..).find(Diagnostic::is_error);
                Err(diag.unwrap_or_else(|| {
                    Diagnostic::error(codes::E_CONDITIONAL_PLACEMENT, "branch failed to lower")
                }))
            }
        }
    }

    fn warn_dropped(&mut self, cur: &Option<Buf>, node: &Node) {
        if let Some(prev) = cur.as_ref().filter(|b| b.warn_if_dropped) {
            self.diagnostics.push(
                Diagnostic::warning(
                    codes::W_DISCARDED_OUTPUT,
                    format!(
                        "output of {:?} is discarded: {:?} does not read its input",
                        prev.producer, node.id
                    ),
                )
                .with_node(prev.producer.clone()),
            );
        }
    }

    /// Reuse the lowest-numbered temp of matching shape other than `avoid`,
    /// or declare a new one.
    fn acquire(&mut self, elem: ElemType, len: usize, avoid: Option<&str>, producer: &str) -> Buf {
        let reused = self
            .temps
            .iter()
            .find(|t| t.elem == elem && t.len == len && Some(t.symbol.as_str()) != avoid)
            .map(|t| t.symbol.clone());
        match reused {
            Some(symbol) => Buf {
                symbol,
                elem,
                len,
                producer: producer.to_string(),
                warn_if_dropped: true,
            },
            None => self.fresh_temp(elem, len, producer),
        }
    }

    fn fresh_temp(&mut self, elem: ElemType, len: usize, producer: &str) -> Buf {
        let id = self.ids.alloc_temp();
        let symbol = match elem {
            ElemType::Float => {
                self.float_temps += 1;
                format!("tmp_f{}", self.float_temps - 1)
            }
            ElemType::Rgb => {
                self.rgb_temps += 1;
                format!("tmp_rgb{}", self.rgb_temps - 1)
            }
        };
        tracing::trace!(temp = id.0, %symbol, len, "temp declared");
        self.temps.push(LirTemp {
            symbol: symbol.clone(),
            elem,
            len,
        });
        Buf {
            symbol,
            elem,
            len,
            producer: producer.to_string(),
            warn_if_dropped: true,
        }
    }
}

fn need_input(node: &Node, kind: NodeKind, cur: Option<Buf>, elem: ElemType) -> Lowered<Buf> {
    match cur {
        None => Err(Diagnostic::error(
            codes::E_MISSING_INPUT,
            format!(
                "{} needs a {} input buffer but no earlier node produces one",
                kind.name(),
                elem_name(elem)
            ),
        )
        .with_node(node.id.clone())),
        Some(buf) if buf.elem != elem => Err(Diagnostic::error(
            codes::E_TYPE_MISMATCH,
            format!(
                "{} expects a {} buffer but {:?} produces {}",
                kind.name(),
                elem_name(elem),
                buf.producer,
                elem_name(buf.elem)
            ),
        )
        .with_node(node.id.clone())),
        Some(buf) => Ok(buf),
    }
}

// ── Kernel builders ─────────────────────────────────────────────────────────

fn note(node: &Node, kind: NodeKind) -> LirStmt {
    LirStmt::Note(format!("node {:?}: {}", node.id, kind.name()))
}

fn kernel(count: usize, body: Vec<LirInstr>) -> LirStmt {
    LirStmt::Loop { count, body }
}

fn place(buf: &Buf, index: LirIndex, channel: Option<Channel>) -> LirPlace {
    LirPlace {
        target: Target::Buffer(buf.symbol.clone()),
        index,
        channel,
    }
}

fn load(buf: &Buf, index: LirIndex, channel: Option<Channel>) -> LirExpr {
    LirExpr::Load(place(buf, index, channel))
}

fn store(buf: &Buf, index: LirIndex, channel: Option<Channel>, value: LirExpr) -> LirInstr {
    LirInstr::Store {
        place: place(buf, index, channel),
        value,
    }
}

fn copy_kernel(src: &Buf, dst: &Buf) -> LirStmt {
    let body = match src.elem {
        ElemType::Float => vec![store(dst, LirIndex::I, None, load(src, LirIndex::I, None))],
        ElemType::Rgb => CHANNELS
            .iter()
            .map(|&ch| store(dst, LirIndex::I, Some(ch), load(src, LirIndex::I, Some(ch))))
            .collect(),
    };
    kernel(src.len, body)
}

// ── Obligations ─────────────────────────────────────────────────────────────

/// Check the lowered program against the obligations the simulator and the
/// emitted code both rely on.
pub fn verify_obligations(lir: &LirProgram) -> Cert {
    Cert {
        terminal_covers_frame: terminal_covers_frame(lir),
        indices_in_bounds: walk_loops(&lir.body).all(|(count, body)| {
            body.iter().all(|instr| instr_in_bounds(lir, count, instr))
        }),
        buffers_declared: walk_loops(&lir.body).all(|(_, body)| {
            body.iter().all(|instr| {
                instr_places(instr).all(|p| match &p.target {
                    Target::Buffer(sym) => lir.temp(sym).is_some() || lir.slot(sym).is_some(),
                    Target::Out => true,
                })
            })
        }),
        single_state_writer: slot_writes(lir, &lir.body).values().all(|&n| n <= 1),
    }
}

fn terminal_covers_frame(lir: &LirProgram) -> bool {
    let writers: Vec<&LirStmt> = lir
        .body
        .iter()
        .filter(|s| match s {
            LirStmt::Loop { body, .. } => body.iter().any(stores_out),
            _ => false,
        })
        .collect();
    let nested_out = walk_loops(&lir.body).filter(|(_, b)| b.iter().any(stores_out)).count();
    match writers.as_slice() {
        [LirStmt::Loop { count, body }] if nested_out == 1 => {
            *count == lir.frame_width
                && CHANNELS.iter().all(|&ch| {
                    body.iter().any(|instr| {
                        matches!(instr, LirInstr::Store { place, .. }
                            if place.target == Target::Out
                                && place.index == LirIndex::I
                                && place.channel == Some(ch))
                    })
                })
        }
        _ => false,
    }
}

fn stores_out(instr: &LirInstr) -> bool {
    matches!(instr, LirInstr::Store { place, .. } if place.target == Target::Out)
}

/// Every loop in the statement tree, as (count, body).
fn walk_loops(stmts: &[LirStmt]) -> impl Iterator<Item = (usize, &[LirInstr])> + '_ {
    let mut out: Vec<(usize, &[LirInstr])> = Vec::new();
    fn collect<'a>(stmts: &'a [LirStmt], out: &mut Vec<(usize, &'a [LirInstr])>) {
        for s in stmts {
            match s {
                LirStmt::Note(_) => {}
                LirStmt::Loop { count, body } => out.push((*count, body)),
                LirStmt::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    collect(then_body, out);
                    collect(else_body, out);
                }
            }
        }
    }
    collect(stmts, &mut out);
    out.into_iter()
}

/// Every place an instruction touches (the store target and all loads).
fn instr_places(instr: &LirInstr) -> impl Iterator<Item = &LirPlace> {
    fn loads<'a>(e: &'a LirExpr, out: &mut Vec<&'a LirPlace>) {
        match e {
            LirExpr::Load(p) => out.push(p),
            LirExpr::Binary(_, a, b) => {
                loads(a, out);
                loads(b, out);
            }
            LirExpr::Clamp01(x) | LirExpr::Floor(x) => loads(x, out),
            _ => {}
        }
    }
    let mut out = Vec::new();
    match instr {
        LirInstr::Let { value, .. } => loads(value, &mut out),
        LirInstr::Store { place, value } => {
            out.push(place);
            loads(value, &mut out);
        }
    }
    out.into_iter()
}

fn spectrum_indices(e: &LirExpr, out: &mut Vec<LirIndex>) {
    match e {
        LirExpr::Spectrum(idx) => out.push(*idx),
        LirExpr::Binary(_, a, b) => {
            spectrum_indices(a, out);
            spectrum_indices(b, out);
        }
        LirExpr::Clamp01(x) | LirExpr::Floor(x) => spectrum_indices(x, out),
        _ => {}
    }
}

/// True if `index` stays in `[0, len)` for every `i` in `[0, count)`.
fn index_fits(index: LirIndex, count: usize, len: usize) -> bool {
    if count == 0 {
        return true;
    }
    let (lo, hi) = match index {
        LirIndex::I => (Some(0), Some(count - 1)),
        LirIndex::Reverse { last } => (last.checked_sub(count - 1), Some(last)),
        LirIndex::Offset(k) => (Some(k), k.checked_add(count - 1)),
    };
    matches!((lo, hi), (Some(_), Some(hi)) if hi < len)
}

fn instr_in_bounds(lir: &LirProgram, count: usize, instr: &LirInstr) -> bool {
    let places_ok = instr_places(instr).all(|p| {
        let len = match &p.target {
            Target::Out => Some(lir.frame_width),
            Target::Buffer(sym) => lir
                .temp(sym)
                .map(|t| t.len)
                .or_else(|| lir.slot(sym).map(|s| s.len)),
        };
        len.is_some_and(|len| index_fits(p.index, count, len))
    });
    let mut spectrum = Vec::new();
    match instr {
        LirInstr::Let { value, .. } | LirInstr::Store { value, .. } => {
            spectrum_indices(value, &mut spectrum)
        }
    }
    places_ok
        && spectrum
            .into_iter()
            .all(|idx| index_fits(idx, count, SPECTRUM_BINS))
}

/// Max number of kernels writing each slot along any single path.
fn slot_writes(lir: &LirProgram, stmts: &[LirStmt]) -> BTreeMap<String, usize> {
    let mut total: BTreeMap<String, usize> = BTreeMap::new();
    for stmt in stmts {
        match stmt {
            LirStmt::Note(_) => {}
            LirStmt::Loop { body, .. } => {
                let mut written: Vec<&str> = body
                    .iter()
                    .filter_map(|instr| match instr {
                        LirInstr::Store {
                            place:
                                LirPlace {
                                    target: Target::Buffer(sym),
                                    ..
                                },
                            ..
                        } if lir.slot(sym).is_some() => Some(sym.as_str()),
                        _ => None,
                    })
                    .collect();
                written.dedup();
                for sym in written {
                    *total.entry(sym.to_string()).or_default() += 1;
                }
            }
            LirStmt::If {
                then_body,
                else_body,
                ..
            } => {
                let a = slot_writes(lir, then_body);
                let b = slot_writes(lir, else_body);
                let mut merged = a.clone();
                for (sym, n) in b {
                    let entry = merged.entry(sym).or_default();
                    *entry = (*entry).max(n);
                }
                for (sym, n) in merged {
                    *total.entry(sym).or_default() += n;
                }
            }
        }
    }
    total
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::load_graph;

    fn graph(src: &str) -> Graph {
        let result = load_graph(src);
        assert!(!result.has_errors(), "{:#?}", result.diagnostics);
        result.graph.expect("graph")
    }

    fn lower_ok(src: &str) -> (LirProgram, Vec<Diagnostic>) {
        let result = lower(&graph(src));
        assert!(!result.has_errors(), "{:#?}", result.diagnostics);
        assert!(result.cert.as_ref().is_some_and(Cert::all_pass));
        (result.lir.expect("lir"), result.diagnostics)
    }

    fn lower_err(src: &str) -> Diagnostic {
        let result = lower(&graph(src));
        assert!(result.lir.is_none());
        result
            .diagnostics
            .into_iter()
            .find(Diagnostic::is_error)
            .expect("an error diagnostic")
    }

    const BLOOM: &str = r#"{"name": "bloom", "frame_width": 8, "nodes": [
        {"id": "audio", "kind": "AudioInput"},
        {"id": "ramp", "kind": "RampShape"},
        {"id": "decay", "kind": "PersistDecay", "decay_factor": 0.92},
        {"id": "color", "kind": "Colorize"},
        {"id": "mirror", "kind": "Mirror", "variant": "full_reversal"},
        {"id": "out", "kind": "PixelOutput"}
    ]}"#;

    #[test]
    fn bloom_chain_buffers() {
        let (lir, diags) = lower_ok(BLOOM);
        assert!(diags.is_empty());
        assert_eq!(lir.function, "pattern_bloom_render");
        assert_eq!(lir.slots.len(), 1);
        assert_eq!(lir.slots[0].symbol, "state_decay");
        assert_eq!(lir.slots[0].owner, "decay");
        assert_eq!(lir.slots[0].len, 8);
        let temps: Vec<&str> = lir.temps.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(temps, vec!["tmp_f0", "tmp_rgb0", "tmp_rgb1"]);
        assert_eq!(lir.loop_count(), 5);
    }

    #[test]
    fn persist_decay_kernel_shape() {
        let (lir, _) = lower_ok(BLOOM);
        let expected = LirExpr::add(
            LirExpr::mul(
                LirExpr::Const(0.92),
                LirExpr::Load(LirPlace::buffer("state_decay", LirIndex::I)),
            ),
            LirExpr::mul(
                LirExpr::sub(LirExpr::Const(1.0), LirExpr::Const(0.92)),
                LirExpr::Load(LirPlace::buffer("tmp_f0", LirIndex::I)),
            ),
        );
        let found = lir.body.iter().any(|s| {
            matches!(s, LirStmt::Loop { body, .. }
                if body == &vec![LirInstr::Store {
                    place: LirPlace::buffer("state_decay", LirIndex::I),
                    value: expected.clone(),
                }])
        });
        assert!(found, "{}", dump(&lir));
    }

    #[test]
    fn unused_audio_input_is_a_note() {
        let (lir, _) = lower_ok(BLOOM);
        assert!(matches!(&lir.body[0], LirStmt::Note(n) if n.contains("unused")));
    }

    #[test]
    fn consumed_audio_input_branches_on_presence() {
        let (lir, _) = lower_ok(
            r#"{"frame_width": 4, "nodes": [
                {"id": "audio", "kind": "AudioInput"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert!(lir
            .body
            .iter()
            .any(|s| matches!(s, LirStmt::If { pred: LirPred::AudioPresent, .. })));
    }

    #[test]
    fn single_pixel_ramp_is_zero() {
        let (lir, _) = lower_ok(
            r#"{"frame_width": 1, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        let LirStmt::Loop { body, .. } = &lir.body[1] else {
            panic!("expected ramp kernel");
        };
        assert!(matches!(&body[0], LirInstr::Store { value: LirExpr::Const(v), .. } if *v == 0.0));
    }

    #[test]
    fn temps_are_reused_when_shapes_match() {
        let (lir, _) = lower_ok(
            r#"{"frame_width": 4, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "m1", "kind": "MirrorReverse"},
                {"id": "m2", "kind": "MirrorCenter"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(lir.temps.len(), 3);
        let last = lir
            .body
            .iter()
            .filter_map(|s| match s {
                LirStmt::Loop { count: 2, body } => Some(body),
                _ => None,
            })
            .next()
            .expect("center mirror kernel");
        assert!(matches!(&last[0], LirInstr::Store { place, .. }
            if place.target == Target::Buffer("tmp_rgb0".into())));
    }

    #[test]
    fn unknown_kind_names_the_node() {
        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "sparkle", "kind": "Sparkle"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_UNKNOWN_KIND));
        assert_eq!(err.node.as_deref(), Some("sparkle"));
    }

    #[test]
    fn missing_input_and_type_mismatch() {
        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "decay", "kind": "PersistDecay"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_MISSING_INPUT));
        assert_eq!(err.node.as_deref(), Some("decay"));

        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_TYPE_MISMATCH));
        assert_eq!(err.node.as_deref(), Some("out"));
    }

    #[test]
    fn length_mismatches() {
        let err = lower_err(
            r#"{"frame_width": 32, "nodes": [
                {"id": "audio", "kind": "AudioInput", "bins": 16},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_LENGTH_MISMATCH));
        assert_eq!(err.node.as_deref(), Some("out"));

        let err = lower_err(
            r#"{"frame_width": 8, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "decay", "kind": "PersistDecay", "bins": 4},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_LENGTH_MISMATCH));
        assert_eq!(err.node.as_deref(), Some("decay"));
    }

    #[test]
    fn too_many_bins() {
        let err = lower_err(
            r#"{"frame_width": 300, "nodes": [
                {"id": "audio", "kind": "AudioInput"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_BAD_PARAM));
    }

    #[test]
    fn center_mirror_rejects_odd_width() {
        let err = lower_err(
            r#"{"frame_width": 5, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "m", "kind": "Mirror", "variant": "center_origin"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_MIRROR_ODD_WIDTH));
        assert_eq!(err.node.as_deref(), Some("m"));
    }

    #[test]
    fn terminal_placement() {
        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_TERMINAL));

        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"},
                {"id": "out2", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_TERMINAL));
        assert_eq!(err.node.as_deref(), Some("out"));
    }

    #[test]
    fn discarded_buffer_warns() {
        let (_, diags) = lower_ok(
            r#"{"frame_width": 4, "nodes": [
                {"id": "first", "kind": "RampShape"},
                {"id": "second", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::W_DISCARDED_OUTPUT));
        assert_eq!(diags[0].node.as_deref(), Some("first"));
    }

    const FALLBACK: &str = r#"{"name": "ambient", "frame_width": 4, "nodes": [
        {"id": "audio", "kind": "AudioInput"},
        {"id": "gate", "kind": "ConditionalFallback", "fallback": [
            {"id": "amb_ramp", "kind": "RampShape"},
            {"id": "amb_color", "kind": "Colorize", "map": "tint", "tint_r": 0.2, "tint_g": 0.1, "tint_b": 0.6},
            {"id": "amb_mirror", "kind": "MirrorReverse"}
        ]},
        {"id": "decay", "kind": "PersistDecay", "decay_factor": 0.5},
        {"id": "color", "kind": "Colorize"},
        {"id": "out", "kind": "PixelOutput"}
    ]}"#;

    fn conditional(lir: &LirProgram) -> (&LirPred, &[LirStmt], &[LirStmt]) {
        let gate = lir
            .body
            .iter()
            .position(|s| matches!(s, LirStmt::Note(n) if n.contains("ConditionalFallback")))
            .expect("conditional note");
        match &lir.body[gate + 1] {
            LirStmt::If {
                pred,
                then_body,
                else_body,
            } => (pred, then_body.as_slice(), else_body.as_slice()),
            other => panic!("expected If after the gate note, got {:?}", other),
        }
    }

    fn has_join(stmts: &[LirStmt]) -> bool {
        stmts
            .iter()
            .any(|s| matches!(s, LirStmt::Note(n) if n.starts_with("join")))
    }

    #[test]
    fn conditional_joins_branches() {
        let (lir, diags) = lower_ok(FALLBACK);
        assert!(diags.is_empty(), "{:#?}", diags);
        let (pred, then_body, else_body) = conditional(&lir);
        assert_eq!(*pred, LirPred::AudioPresent);
        // Primary ends in tmp_rgb0, which becomes the join buffer.
        assert!(!has_join(then_body));
        assert!(has_join(else_body));
        assert!(matches!(else_body.last(), Some(LirStmt::Loop { body, .. })
            if matches!(&body[0], LirInstr::Store { place, .. }
                if place.target == Target::Buffer("tmp_rgb0".into()))));
    }

    #[test]
    fn conditional_placement_errors() {
        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "gate", "kind": "ConditionalFallback"},
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_CONDITIONAL_PLACEMENT));

        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "gate", "kind": "ConditionalFallback", "fallback": [
                    {"id": "r2", "kind": "RampShape"}, {"id": "c2", "kind": "Colorize"}
                ]},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_CONDITIONAL_PLACEMENT));

        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "gate", "kind": "ConditionalFallback", "fallback": [
                    {"id": "r2", "kind": "RampShape"},
                    {"id": "c2", "kind": "Colorize"},
                    {"id": "o2", "kind": "PixelOutput"}
                ]},
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_TERMINAL));
        assert_eq!(err.node.as_deref(), Some("o2"));
    }

    #[test]
    fn branch_type_mismatch() {
        let err = lower_err(
            r#"{"frame_width": 4, "nodes": [
                {"id": "gate", "kind": "ConditionalFallback", "fallback": [
                    {"id": "r2", "kind": "RampShape"}
                ]},
                {"id": "ramp", "kind": "RampShape"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        assert_eq!(err.code, Some(codes::E_TYPE_MISMATCH));
        assert_eq!(err.node.as_deref(), Some("gate"));
    }

    #[test]
    fn energy_predicate_with_state_in_both_branches() {
        let (lir, _) = lower_ok(
            r#"{"frame_width": 4, "nodes": [
                {"id": "ramp", "kind": "RampShape"},
                {"id": "gate", "kind": "ConditionalFallback", "predicate": "energy_above", "threshold": 0.3,
                 "fallback": [
                    {"id": "dim", "kind": "PersistDecay", "decay_factor": 0.99},
                    {"id": "dim_color", "kind": "Colorize"}
                 ]},
                {"id": "glow", "kind": "PersistDecay"},
                {"id": "color", "kind": "Colorize"},
                {"id": "out", "kind": "PixelOutput"}
            ]}"#,
        );
        // Lowering order, not declaration order: primary branch first.
        let owners: Vec<&str> = lir.slots.iter().map(|s| s.owner.as_str()).collect();
        assert_eq!(owners, vec!["glow", "dim"]);
        let (pred, _, _) = conditional(&lir);
        assert_eq!(*pred, LirPred::EnergyAbove(0.3));
        assert!(verify_obligations(&lir).single_state_writer);
    }

    #[test]
    fn obligations_catch_out_of_bounds_kernels() {
        let (mut lir, _) = lower_ok(BLOOM);
        for stmt in &mut lir.body {
            if let LirStmt::Loop { count, .. } = stmt {
                *count += 1;
            }
        }
        let cert = verify_obligations(&lir);
        assert!(!cert.indices_in_bounds);
        assert!(!cert.terminal_covers_frame);
        assert!(!cert.all_pass());
    }

    #[test]
    fn obligations_catch_double_state_write() {
        let (mut lir, _) = lower_ok(BLOOM);
        let decay_kernel = lir
            .body
            .iter()
            .find(|s| matches!(s, LirStmt::Loop { body, .. }
                if matches!(&body[0], LirInstr::Store { place, .. }
                    if place.target == Target::Buffer("state_decay".into()))))
            .cloned()
            .expect("decay kernel");
        lir.body.push(decay_kernel);
        assert!(!verify_obligations(&lir).single_state_writer);
    }
}
