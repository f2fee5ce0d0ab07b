use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use pgc::codegen::CodegenOptions;
use pgc::frame::SyntheticInput;
use pgc::sim::ReferenceSimulator;
use pgc::verify::VerifyOptions;
use pgc::*;

// Latency scenarios: one per shape of graph the compiler sees in practice.

const MINIMAL_GRAPH: &str = r#"{"name": "minimal", "frame_width": 8, "nodes": [
    {"id": "ramp", "kind": "RampShape"},
    {"id": "color", "kind": "Colorize"},
    {"id": "out", "kind": "PixelOutput"}
]}"#;

const SPECTRUM_GRAPH: &str = r#"{"name": "spectrum", "frame_width": 256, "nodes": [
    {"id": "fft", "kind": "AudioInput"},
    {"id": "bands", "kind": "RampShape"},
    {"id": "trail", "kind": "PersistDecay", "decay_factor": 0.92},
    {"id": "color", "kind": "Colorize"},
    {"id": "mirror", "kind": "Mirror", "variant": "full_reversal"},
    {"id": "out", "kind": "PixelOutput"}
]}"#;

const FALLBACK_GRAPH: &str = r#"{"name": "ambient", "frame_width": 160, "nodes": [
    {"id": "fft", "kind": "AudioInput"},
    {"id": "gate", "kind": "ConditionalFallback", "predicate": "energy_above", "threshold": 0.2,
     "fallback": [
        {"id": "idle", "kind": "RampShape"},
        {"id": "idle_color", "kind": "Colorize", "map": "tint", "tint_r": 0.2, "tint_g": 0.1, "tint_b": 0.6}
     ]},
    {"id": "glow", "kind": "PersistDecay", "decay_factor": 0.8},
    {"id": "color", "kind": "Colorize"},
    {"id": "mirror", "kind": "MirrorCenter"},
    {"id": "out", "kind": "PixelOutput"}
]}"#;

fn scenarios() -> [(&'static str, &'static str); 3] {
    [
        ("minimal", MINIMAL_GRAPH),
        ("spectrum", SPECTRUM_GRAPH),
        ("fallback", FALLBACK_GRAPH),
    ]
}

/// A ramp of `width` pixels through the full colour chain.
fn generate_width_graph(width: usize) -> String {
    format!(
        r#"{{"frame_width": {}, "nodes": [
            {{"id": "ramp", "kind": "RampShape"}},
            {{"id": "decay", "kind": "PersistDecay", "decay_factor": 0.9}},
            {{"id": "color", "kind": "Colorize"}},
            {{"id": "mirror", "kind": "MirrorReverse"}},
            {{"id": "out", "kind": "PixelOutput"}}
        ]}}"#,
        width
    )
}

// ── Compile latency ─────────────────────────────────────────────────────────

fn bench_full_compile_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_compile_latency");
    let opts = CodegenOptions::default();

    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| pipeline::compile(black_box(source), &opts).map(|c| c.generated.cpp_source.len()));
        });
    }
    group.finish();
}

fn bench_phase_latency(c: &mut Criterion) {
    let graph = match pipeline::load_checked(FALLBACK_GRAPH) {
        Ok(g) => g,
        Err(e) => panic!("bench graph does not load: {}", e),
    };
    let lir = match pipeline::lower_checked(&graph) {
        Ok(l) => l,
        Err(e) => panic!("bench graph does not lower: {}", e),
    };
    let provenance = pipeline::compute_provenance(FALLBACK_GRAPH);
    let cpp = codegen::codegen(&lir, &provenance, &CodegenOptions::default()).cpp_source;

    {
        let mut group = c.benchmark_group("kpi/phase_latency/load");
        group.bench_function("fallback", |b| {
            b.iter(|| graph::load_graph(black_box(FALLBACK_GRAPH)))
        });
        group.finish();
    }
    {
        let mut group = c.benchmark_group("kpi/phase_latency/lower");
        group.bench_function("fallback", |b| b.iter(|| lower::lower(black_box(&graph))));
        group.finish();
    }
    {
        let mut group = c.benchmark_group("kpi/phase_latency/codegen");
        group.bench_function("fallback", |b| {
            b.iter(|| codegen::codegen(black_box(&lir), &provenance, &CodegenOptions::default()))
        });
        group.finish();
    }
    {
        let mut group = c.benchmark_group("kpi/phase_latency/parse_artifact");
        group.bench_function("fallback", |b| b.iter(|| parser::parse(black_box(&cpp))));
        group.finish();
    }
}

// ── Render and verify ───────────────────────────────────────────────────────

fn bench_render_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/render_frame");
    let input = SyntheticInput {
        dropout_period: 5,
        ..SyntheticInput::default()
    };
    let frames: Vec<_> = input.frames(16).collect();

    for (name, source) in scenarios() {
        let graph = match pipeline::load_checked(source) {
            Ok(g) => g,
            Err(e) => panic!("{} does not load: {}", name, e),
        };
        group.bench_with_input(BenchmarkId::from_parameter(name), &graph, |b, graph| {
            b.iter_batched(
                || match ReferenceSimulator::from_graph(graph) {
                    Ok(sim) => sim,
                    Err(e) => panic!("{} does not lower: {}", name, e),
                },
                |mut sim| {
                    for frame in &frames {
                        let _ = black_box(sim.render(frame).map(|px| px.len()));
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_verify_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/verify_scaling");
    let options = VerifyOptions {
        frames: 20,
        ..VerifyOptions::default()
    };

    for width in [16usize, 64, 256] {
        let source = generate_width_graph(width);
        let compiled = match pipeline::compile(&source, &CodegenOptions::default()) {
            Ok(c) => c,
            Err(e) => panic!("width {} does not compile: {}", width, e),
        };
        group.bench_with_input(BenchmarkId::from_parameter(width), &compiled, |b, compiled| {
            b.iter(|| {
                verify::verify(
                    &compiled.graph,
                    black_box(&compiled.generated.cpp_source),
                    &options,
                )
                .map(|r| r.mismatches)
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_full_compile_latency,
    bench_phase_latency,
    bench_render_frame,
    bench_verify_scaling
);
criterion_main!(benches);
