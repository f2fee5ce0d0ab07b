use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use pgc::codegen::{CodegenOptions, TargetProfile};
use pgc::frame::SyntheticInput;
use pgc::pass::{descriptor, PassId};
use pgc::pipeline::{run_pipeline, CompilationState};
use pgc::verify::VerifyOptions;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Profile {
    Firmware,
    Host,
}

impl From<Profile> for TargetProfile {
    fn from(p: Profile) -> Self {
        match p {
            Profile::Firmware => TargetProfile::Firmware,
            Profile::Host => TargetProfile::Host,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    Cpp,
    Lir,
    Dot,
    BuildInfo,
    RuntimeHeader,
}

#[derive(Parser, Debug)]
#[command(
    name = "pgc",
    version,
    about = "Pattern Graph Compiler: lowers audio-reactive LED pattern graphs to C++ render procedures"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a graph description into an artifact
    Compile(CompileArgs),
    /// Compile a graph and check the artifact against the reference simulator
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Input graph description (.json)
    #[arg(short, long)]
    input: PathBuf,

    /// Target profile
    #[arg(long, value_enum, default_value_t = Profile::Firmware)]
    profile: Profile,

    /// Print compiler passes and timing
    #[arg(long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct CompileArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Output file path (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Cpp)]
    emit: EmitStage,

    /// Render function symbol (default: pattern_<graph>_render)
    #[arg(long)]
    function_name: Option<String>,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of frames to compare
    #[arg(long, default_value_t = 100)]
    frames: u32,

    /// Drop the audio snapshot on every K-th frame (0 = never)
    #[arg(long, default_value_t = 0)]
    dropout_period: u32,

    /// Brightness parameter for every frame
    #[arg(long, default_value_t = 1.0)]
    brightness: f32,

    /// Check this artifact file instead of a fresh emission
    #[arg(long)]
    artifact: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Compile(a) => a.common.verbose,
        Command::Verify(a) => a.common.verbose,
    };
    init_tracing(verbose);

    match cli.command {
        Command::Compile(args) => compile(args),
        Command::Verify(args) => verify(args),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

fn read_source(path: &Path) -> Result<String, ExitCode> {
    std::fs::read_to_string(path).map_err(|e| {
        eprintln!("pgc: error: {}: {}", path.display(), e);
        ExitCode::from(2)
    })
}

/// Print diagnostics as they arrive, pass by pass.
fn report_pass(verbose: bool) -> impl FnMut(PassId, &[pgc::diag::Diagnostic]) {
    move |pass: PassId, diags: &[pgc::diag::Diagnostic]| {
        for d in diags {
            eprintln!("pgc: {}", d);
        }
        if verbose {
            eprintln!("pgc: {} complete", descriptor(pass).name);
        }
    }
}

fn compile(args: CompileArgs) -> ExitCode {
    let codegen_options = CodegenOptions {
        profile: args.common.profile.into(),
        function_name: args.function_name.clone(),
    };

    if args.emit == EmitStage::RuntimeHeader {
        return write_output(args.output.as_deref(), &pgc::codegen::runtime_header());
    }

    let source = match read_source(&args.common.input) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let terminal = match args.emit {
        EmitStage::Dot => PassId::Load,
        EmitStage::Lir => PassId::Lower,
        _ => PassId::Codegen,
    };

    let mut state = CompilationState::new(source);
    if let Err(e) = run_pipeline(
        &mut state,
        terminal,
        &codegen_options,
        &VerifyOptions::default(),
        report_pass(args.common.verbose),
    ) {
        eprintln!(
            "pgc: {} failed with {} error(s)",
            descriptor(e.failing_pass).name,
            e.error.diagnostics().len()
        );
        return ExitCode::from(1);
    }

    let text = match args.emit {
        EmitStage::Dot => state.graph.as_ref().map(pgc::dot::emit_dot),
        EmitStage::Lir => state.lir.as_ref().map(pgc::lir::dump),
        EmitStage::BuildInfo => Some(state.provenance.to_json(codegen_options.profile)),
        EmitStage::Cpp => state.generated.map(|g| g.cpp_source),
        EmitStage::RuntimeHeader => None,
    };
    match text {
        Some(text) => write_output(args.output.as_deref(), &text),
        None => {
            eprintln!("pgc: nothing to emit");
            ExitCode::from(1)
        }
    }
}

fn write_output(path: Option<&Path>, text: &str) -> ExitCode {
    match path {
        Some(path) => match std::fs::write(path, text) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("pgc: error: {}: {}", path.display(), e);
                ExitCode::from(2)
            }
        },
        None => {
            print!("{}", text);
            ExitCode::SUCCESS
        }
    }
}

fn verify(args: VerifyArgs) -> ExitCode {
    let source = match read_source(&args.common.input) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let artifact = match args.artifact.as_deref().map(read_source).transpose() {
        Ok(a) => a,
        Err(code) => return code,
    };
    let codegen_options = CodegenOptions {
        profile: args.common.profile.into(),
        function_name: None,
    };
    let verify_options = VerifyOptions {
        frames: args.frames,
        input: SyntheticInput {
            dropout_period: args.dropout_period,
            brightness: args.brightness,
            ..SyntheticInput::default()
        },
    };

    let mut state = CompilationState::new(source);
    let Some(artifact) = artifact else {
        // Fresh emission: the whole pipeline, verify pass included.
        let outcome = run_pipeline(
            &mut state,
            PassId::Verify,
            &codegen_options,
            &verify_options,
            report_pass(args.common.verbose),
        );
        if let Some(report) = &state.report {
            print_report(report);
        }
        return match outcome {
            Ok(()) => {
                println!("pgc: PASS");
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("pgc: FAIL ({})", descriptor(e.failing_pass).name);
                ExitCode::from(1)
            }
        };
    };

    if run_pipeline(
        &mut state,
        PassId::Lower,
        &codegen_options,
        &verify_options,
        report_pass(args.common.verbose),
    )
    .is_err()
    {
        println!("pgc: FAIL (graph)");
        return ExitCode::from(1);
    }
    let Some(graph) = state.graph.as_ref() else {
        return ExitCode::from(1);
    };
    match pgc::verify::verify(graph, &artifact, &verify_options) {
        Ok(report) => {
            print_report(&report);
            match report.ensure_passed() {
                Ok(()) => {
                    println!("pgc: PASS");
                    ExitCode::SUCCESS
                }
                Err(first) => {
                    eprintln!("pgc: first mismatch: {}", first);
                    println!("pgc: FAIL (verify)");
                    ExitCode::from(1)
                }
            }
        }
        Err(e) => {
            eprintln!("pgc: error: {}", e);
            println!("pgc: FAIL (verify)");
            ExitCode::from(1)
        }
    }
}

fn print_report(report: &pgc::verify::EquivalenceReport) {
    println!(
        "pgc: {} frames, {} pixels compared, {} mismatches, max delta {}{}",
        report.frames,
        report.pixels_compared,
        report.mismatches,
        report.max_channel_sum_delta,
        if report.structurally_identical {
            ""
        } else {
            " (structure differs)"
        }
    );
}
