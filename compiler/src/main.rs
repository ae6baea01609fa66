use clap::Parser;
use std::path::PathBuf;

use lowattr::pass::PassId;
use lowattr::pipeline::{run_pipeline, CompilationState};
use lowattr::program::Module;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitFormat {
    Json,
    Summary,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StopAfter {
    Sequence,
    LoopNest,
    Storage,
}

impl StopAfter {
    fn pass(self) -> PassId {
        match self {
            StopAfter::Sequence => PassId::DefaultSequence,
            StopAfter::LoopNest => PassId::DefaultLoopNest,
            StopAfter::Storage => PassId::DefaultStorage,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "lowattr",
    version,
    about = "Infers default sequence, loop nest and storage attributes of loop-nest dataflow programs"
)]
struct Cli {
    /// Input module (JSON)
    input: PathBuf,

    /// Output file path (stdout if absent)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = EmitFormat::Json)]
    emit: EmitFormat,

    /// Last pass to run
    #[arg(long, value_enum, default_value_t = StopAfter::Storage)]
    stop_after: StopAfter,

    /// Print passes and timing
    #[arg(long)]
    verbose: bool,
}

/// Log to stderr; `RUST_LOG` overrides the level picked from `--verbose`.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.verbose {
        eprintln!("lowattr: input = {}", cli.input.display());
        eprintln!("lowattr: emit  = {:?}", cli.emit);
    }

    // ── Read module ──
    let text = match std::fs::read_to_string(&cli.input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("lowattr: error: {}: {}", cli.input.display(), e);
            std::process::exit(2);
        }
    };
    let module: Module = match serde_json::from_str(&text) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("lowattr: error: {}: {}", cli.input.display(), e);
            std::process::exit(2);
        }
    };

    if cli.verbose {
        eprintln!("lowattr: {} program(s)", module.programs.len());
    }

    // ── Run the pipeline per program ──
    let terminal = cli.stop_after.pass();
    let mut failed = false;
    let mut annotated = Module::default();
    for program in module.programs {
        let name = program.name.clone();
        if cli.verbose {
            eprintln!("lowattr: program {}", name);
        }
        let mut state = CompilationState::new(program);
        let result = run_pipeline(&mut state, terminal, cli.verbose, |_, diags| {
            for diag in diags {
                eprintln!("lowattr: {}: {}: {}", name, diag.location, diag);
            }
        });
        if state.has_error && result.is_ok() {
            // Structural errors are reported before any pass runs.
            for diag in &state.diagnostics {
                eprintln!("lowattr: {}: {}: {}", name, diag.location, diag);
            }
        }
        failed |= result.is_err() || state.has_error;
        annotated.programs.push(state.program);
    }
    if failed {
        std::process::exit(1);
    }

    // ── Emit ──
    let rendered = match cli.emit {
        EmitFormat::Json => match serde_json::to_string_pretty(&annotated) {
            Ok(s) => s + "\n",
            Err(e) => {
                eprintln!("lowattr: error: {}", e);
                std::process::exit(2);
            }
        },
        EmitFormat::Summary => annotated.programs.iter().map(|p| p.to_string()).collect(),
    };
    let written = match &cli.output {
        Some(path) => std::fs::write(path, rendered),
        None => {
            print!("{}", rendered);
            Ok(())
        }
    };
    if let Err(e) = written {
        eprintln!("lowattr: error: {}", e);
        std::process::exit(2);
    }
}
