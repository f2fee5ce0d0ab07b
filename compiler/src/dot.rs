// dot.rs: Graphviz DOT output for pattern graphs
//
// Draws the node chain left to right in declaration order. A conditional
// fallback gets its nested sub-pipeline drawn as a dashed cluster, entered
// from the conditional and rejoining at the terminal node.
//
// Preconditions: `graph` passed schema validation.
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::graph::{Graph, Node};
use crate::registry::NodeKind;

/// Emit the pattern graph as a Graphviz DOT string.
pub fn emit_dot(graph: &Graph) -> String {
    let mut buf = String::new();
    let title = graph.name.as_deref().unwrap_or("pattern");
    let _ = writeln!(buf, "digraph {} {{", sanitize(title));
    let _ = writeln!(buf, "    rankdir=LR;");
    let _ = writeln!(buf, "    label=\"{} (frame_width {})\";", escape(title), graph.frame_width);
    let _ = writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];");
    let _ = writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];");
    let _ = writeln!(buf);

    for (i, node) in graph.nodes.iter().enumerate() {
        write_node(&mut buf, &format!("n{}", i), node, "    ");
    }

    let conditional = graph.nodes.iter().position(|n| !n.fallback.is_empty());
    for i in 1..graph.nodes.len() {
        let label = if Some(i - 1) == conditional {
            " [label=\"primary\"]"
        } else {
            ""
        };
        let _ = writeln!(buf, "    n{} -> n{}{};", i - 1, i, label);
    }

    if let Some(c) = conditional {
        let fallback = &graph.nodes[c].fallback;
        let _ = writeln!(buf);
        let _ = writeln!(buf, "    subgraph cluster_fallback {{");
        let _ = writeln!(buf, "        label=\"fallback\";");
        let _ = writeln!(buf, "        style=dashed;");
        let _ = writeln!(buf, "        color=gray50;");
        for (j, node) in fallback.iter().enumerate() {
            write_node(&mut buf, &format!("f{}", j), node, "        ");
        }
        for j in 1..fallback.len() {
            let _ = writeln!(buf, "        f{} -> f{};", j - 1, j);
        }
        let _ = writeln!(buf, "    }}");
        let _ = writeln!(buf, "    n{} -> f0 [label=\"fallback\", style=dashed];", c);
        let last = graph.nodes.len() - 1;
        if last > c {
            let _ = writeln!(buf, "    f{} -> n{} [style=dashed];", fallback.len() - 1, last);
        }
    }

    let _ = writeln!(buf, "}}");
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Sanitize a name to valid DOT identifier characters.
fn sanitize(name: &str) -> String {
    let id = crate::state::sanitize(name);
    if id.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{}", id)
    } else {
        id
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn write_node(buf: &mut String, dot_id: &str, node: &Node, indent: &str) {
    let kind = NodeKind::from_name(&node.kind);
    let kind_name = kind.map(NodeKind::name).unwrap_or(node.kind.as_str());
    let _ = writeln!(
        buf,
        "{}{} [label=\"{}\\n{}\", {}];",
        indent,
        dot_id,
        escape(&node.id),
        escape(kind_name),
        node_attrs(kind)
    );
}

fn node_attrs(kind: Option<NodeKind>) -> &'static str {
    match kind {
        Some(NodeKind::AudioInput) => "shape=invhouse",
        Some(NodeKind::PersistDecay) => "shape=box, style=\"rounded,filled\", fillcolor=lightyellow",
        Some(NodeKind::ConditionalFallback) => "shape=diamond",
        Some(NodeKind::PixelOutput) => "shape=house, style=filled, fillcolor=lightgray",
        Some(_) => "shape=box, style=rounded",
        None => "shape=box, color=red",
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
