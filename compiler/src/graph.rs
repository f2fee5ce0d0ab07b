// graph.rs: Pattern graph model, JSON loading and schema validation
//
// Parses a JSON graph description into a `Graph`: frame width plus an ordered
// node list. Declaration order is data-flow order; there is no edge list.
//
// Preconditions: input is UTF-8 text.
// Postconditions: on success, `LoadResult.graph` holds nodes in declaration
//   order with unique ids (including nested fallback nodes) and scalar params.
// Failure modes: malformed JSON, a missing, non-positive or oversized
//   `frame_width`, missing or empty `nodes`, nodes without `id`/`kind`,
//   duplicate ids, or non-scalar params produce error diagnostics. Kind names are NOT checked here; unknown
//   kinds are a lowering error.
// Side effects: none.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::diag::{codes, has_errors, Diagnostic};

/// Largest accepted `frame_width`. Every temporary and state slot is sized
/// by it, on the device stack and in host-side instances.
pub const MAX_FRAME_WIDTH: usize = 4096;

// ── Model ───────────────────────────────────────────────────────────────────

/// A scalar node parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl ParamValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One pipeline stage as declared in the graph description.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    /// Kind name as written (`"PersistDecay"`, `"BufferPersist"`, ...).
    /// Resolved against the lowering table in `registry::resolve_node`.
    pub kind: String,
    pub params: BTreeMap<String, ParamValue>,
    /// Nested sub-pipeline of a `ConditionalFallback` node; empty otherwise.
    pub fallback: Vec<Node>,
    /// True if the description carried a `fallback` key at all.
    pub has_fallback_key: bool,
}

impl Node {
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }
}

/// A validated pattern graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: Option<String>,
    pub frame_width: usize,
    pub nodes: Vec<Node>,
}

impl Graph {
    /// Total node count, fallback nodes included.
    pub fn node_count(&self) -> usize {
        fn count(nodes: &[Node]) -> usize {
            nodes.iter().map(|n| 1 + count(&n.fallback)).sum()
        }
        count(&self.nodes)
    }

    /// Find a node by id anywhere in the graph.
    pub fn find(&self, id: &str) -> Option<&Node> {
        fn find_in<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Node> {
            nodes
                .iter()
                .find_map(|n| if n.id == id { Some(n) } else { find_in(&n.fallback, id) })
        }
        find_in(&self.nodes, id)
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Result of loading: the graph (if schema-valid) plus diagnostics.
#[derive(Debug)]
pub struct LoadResult {
    pub graph: Option<Graph>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LoadResult {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }
}

/// Load and schema-validate a JSON graph description.
pub fn load_graph(source: &str) -> LoadResult {
    let mut diagnostics = Vec::new();
    let root: Value = match serde_json::from_str(source) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::error(
                codes::E_INVALID_JSON,
                format!("invalid graph JSON: {}", e),
            ));
            return LoadResult {
                graph: None,
                diagnostics,
            };
        }
    };
    let graph = match root.as_object() {
        Some(obj) => load_root(obj, &mut diagnostics),
        None => {
            diagnostics.push(Diagnostic::error(
                codes::E_INVALID_JSON,
                "graph description must be a JSON object",
            ));
            None
        }
    };
    let graph = if has_errors(&diagnostics) { None } else { graph };
    tracing::debug!(
        ok = graph.is_some(),
        diagnostics = diagnostics.len(),
        "graph loaded"
    );
    LoadResult { graph, diagnostics }
}

fn load_root(obj: &Map<String, Value>, diags: &mut Vec<Diagnostic>) -> Option<Graph> {
    let name = obj.get("name").and_then(Value::as_str).map(str::to_string);
    let frame_width = load_frame_width(obj, diags);

    let nodes = match obj.get("nodes") {
        None => {
            diags.push(
                Diagnostic::error(codes::E_MISSING_NODES, "graph has no `nodes` array")
                    .with_field("nodes"),
            );
            None
        }
        Some(Value::Array(items)) if items.is_empty() => {
            diags.push(
                Diagnostic::error(codes::E_EMPTY_NODES, "graph `nodes` array is empty")
                    .with_field("nodes"),
            );
            None
        }
        Some(Value::Array(items)) => Some(load_nodes(items, "nodes", diags)),
        Some(_) => {
            diags.push(
                Diagnostic::error(codes::E_MISSING_NODES, "`nodes` must be an array")
                    .with_field("nodes"),
            );
            None
        }
    };

    let nodes = nodes?;
    check_unique_ids(&nodes, diags);
    Some(Graph {
        name,
        frame_width: frame_width?,
        nodes,
    })
}

fn load_frame_width(obj: &Map<String, Value>, diags: &mut Vec<Diagnostic>) -> Option<usize> {
    let (field, value) = match (obj.get("frame_width"), obj.get("num_leds")) {
        (Some(v), _) => ("frame_width", v),
        (None, Some(v)) => ("num_leds", v),
        (None, None) => {
            diags.push(
                Diagnostic::error(codes::E_MISSING_FRAME_WIDTH, "graph has no `frame_width`")
                    .with_field("frame_width"),
            );
            return None;
        }
    };
    match value.as_i64() {
        Some(w) if w > 0 && w as u64 <= MAX_FRAME_WIDTH as u64 => Some(w as usize),
        Some(w) if w > 0 => {
            diags.push(
                Diagnostic::error(
                    codes::E_BAD_FRAME_WIDTH,
                    format!("`{}` {} exceeds the {} pixel limit", field, w, MAX_FRAME_WIDTH),
                )
                .with_field(field),
            );
            None
        }
        Some(w) => {
            diags.push(
                Diagnostic::error(
                    codes::E_BAD_FRAME_WIDTH,
                    format!("`{}` must be positive, got {}", field, w),
                )
                .with_field(field),
            );
            None
        }
        None => {
            diags.push(
                Diagnostic::error(
                    codes::E_BAD_FRAME_WIDTH,
                    format!("`{}` must be an integer, got {}", field, value),
                )
                .with_field(field),
            );
            None
        }
    }
}

fn load_nodes(items: &[Value], path: &str, diags: &mut Vec<Diagnostic>) -> Vec<Node> {
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| load_node(item, &format!("{}[{}]", path, i), diags))
        .collect()
}

fn load_node(item: &Value, path: &str, diags: &mut Vec<Diagnostic>) -> Option<Node> {
    let Some(obj) = item.as_object() else {
        diags.push(
            Diagnostic::error(codes::E_INVALID_JSON, "node must be a JSON object").with_field(path),
        );
        return None;
    };

    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(_) => {
            diags.push(
                Diagnostic::error(codes::E_MISSING_ID, "node `id` must be a non-empty string")
                    .with_field(format!("{}.id", path)),
            );
            None
        }
        None => {
            diags.push(
                Diagnostic::error(codes::E_MISSING_ID, "node has no `id`")
                    .with_field(format!("{}.id", path)),
            );
            None
        }
    };

    let kind = match obj.get("kind").or_else(|| obj.get("type")) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            diags.push(
                with_opt_node(
                    Diagnostic::error(codes::E_MISSING_KIND, "node `kind` must be a string"),
                    &id,
                )
                .with_field(format!("{}.kind", path)),
            );
            None
        }
        None => {
            diags.push(
                with_opt_node(
                    Diagnostic::error(codes::E_MISSING_KIND, "node has no `kind`"),
                    &id,
                )
                .with_field(format!("{}.kind", path)),
            );
            None
        }
    };

    let mut params = BTreeMap::new();
    let mut fallback = Vec::new();
    let mut has_fallback_key = false;
    for (key, value) in obj {
        match key.as_str() {
            "id" | "kind" | "type" => {}
            "fallback" => {
                has_fallback_key = true;
                match value {
                    Value::Array(items) => {
                        fallback = load_nodes(items, &format!("{}.fallback", path), diags);
                    }
                    _ => diags.push(
                        with_opt_node(
                            Diagnostic::error(
                                codes::E_BAD_PARAM_VALUE,
                                "`fallback` must be an array of nodes",
                            ),
                            &id,
                        )
                        .with_field(format!("{}.fallback", path)),
                    ),
                }
            }
            _ => match scalar(value) {
                Some(v) => {
                    params.insert(key.clone(), v);
                }
                None => diags.push(
                    with_opt_node(
                        Diagnostic::error(
                            codes::E_BAD_PARAM_VALUE,
                            format!("parameter `{}` must be a number, string or bool", key),
                        ),
                        &id,
                    )
                    .with_field(format!("{}.{}", path, key)),
                ),
            },
        }
    }

    Some(Node {
        id: id?,
        kind: kind?,
        params,
        fallback,
        has_fallback_key,
    })
}

fn with_opt_node(diag: Diagnostic, id: &Option<String>) -> Diagnostic {
    match id {
        Some(id) => diag.with_node(id.clone()),
        None => diag,
    }
}

fn scalar(value: &Value) -> Option<ParamValue> {
    match value {
        Value::Number(n) => n.as_f64().map(ParamValue::Number),
        Value::String(s) => Some(ParamValue::Text(s.clone())),
        Value::Bool(b) => Some(ParamValue::Bool(*b)),
        _ => None,
    }
}

/// Reject duplicate ids across the chain and every fallback branch.
/// The set is only used for membership; reporting follows declaration order.
fn check_unique_ids(nodes: &[Node], diags: &mut Vec<Diagnostic>) {
    fn walk(nodes: &[Node], seen: &mut HashSet<String>, diags: &mut Vec<Diagnostic>) {
        for node in nodes {
            if !seen.insert(node.id.clone()) {
                diags.push(
                    Diagnostic::error(
                        codes::E_DUPLICATE_ID,
                        format!("duplicate node id \"{}\"", node.id),
                    )
                    .with_node(node.id.clone())
                    .with_field("id"),
                );
            }
            walk(&node.fallback, seen, diags);
        }
    }
    let mut seen = HashSet::new();
    walk(nodes, &mut seen, diags);
}

// ── Tests ───────────────────────────────────────────────────────────────────
