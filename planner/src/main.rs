use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use dplan::config::CompilationConfig;
use dplan::diag::{codes, line_col, Diagnostic};
use dplan::pass::PassId;
use dplan::pipeline::{self, CompilationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    Ast,
    Ir,
    Domains,
    Placements,
    Json,
}

impl EmitStage {
    fn terminal(self) -> Option<PassId> {
        match self {
            EmitStage::Ast => None,
            EmitStage::Ir => Some(PassId::Lower),
            EmitStage::Domains => Some(PassId::Analyze),
            EmitStage::Placements | EmitStage::Json => Some(PassId::Extract),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "dplan",
    version,
    about = "Device placement planner — decides where every subexpression of a .dp program runs"
)]
struct Cli {
    /// Input .dp source file
    source: PathBuf,

    /// Target configuration (JSON); defaults to a single llvm CPU
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Placements)]
    emit: EmitStage,

    /// Print planner phases and timing, and enable debug tracing
    #[arg(long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    if !verbose {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dplan=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_diag(path: &Path, source: &str, diag: &Diagnostic) {
    let (line, col) = line_col(source, diag.span.start);
    eprintln!("dplan: {}:{}:{}: {}", path.display(), line, col, diag);
    for related in &diag.related_spans {
        let (line, col) = line_col(source, related.span.start);
        eprintln!("  note: {}:{}:{}: {}", path.display(), line, col, related.label);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.verbose {
        eprintln!("dplan: source = {}", cli.source.display());
        eprintln!("dplan: emit   = {:?}", cli.emit);
    }

    // ── Load configuration ──
    let config = match &cli.config {
        Some(path) => match CompilationConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("dplan: error: {}", e);
                return ExitCode::from(2);
            }
        },
        None => CompilationConfig::default(),
    };

    if cli.verbose {
        eprintln!(
            "dplan: {} targets, host = {}, default = {}",
            config.targets.len(),
            config.host_placement(),
            config.default_primitive_placement()
        );
    }

    // ── Read and parse source ──
    let source = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("dplan: error: {}: {}", cli.source.display(), e);
            return ExitCode::from(2);
        }
    };

    let parse_result = dplan::parser::parse(&source);
    if !parse_result.errors.is_empty() {
        for err in &parse_result.errors {
            let (line, col) = line_col(&source, err.span().start);
            eprintln!(
                "dplan: {}:{}:{}: error[{}]: {}",
                cli.source.display(),
                line,
                col,
                codes::E0001,
                err
            );
        }
        return ExitCode::from(1);
    }
    let Some(program) = parse_result.program else {
        eprintln!("dplan: parse failed with no output");
        return ExitCode::from(1);
    };

    if cli.verbose {
        eprintln!("dplan: parsed {} items", program.items.len());
    }

    let Some(terminal) = cli.emit.terminal() else {
        println!("{:#?}", program);
        return ExitCode::SUCCESS;
    };

    // ── Run passes ──
    let mut state = CompilationState::new(program, config);
    state.provenance = Some(pipeline::compute_provenance(&source, &state.config));
    let path = cli.source.clone();
    let result = pipeline::run_pipeline(&mut state, terminal, cli.verbose, |_, diags| {
        for diag in diags {
            print_diag(&path, &source, diag);
        }
    });
    if result.is_err() || state.has_error {
        return ExitCode::from(1);
    }

    // ── Emit ──
    let output = match cli.emit {
        EmitStage::Ast => None,
        EmitStage::Ir => state.module.as_ref().map(|m| m.to_string()),
        EmitStage::Domains => state.constraints.clone(),
        EmitStage::Placements => state
            .module
            .as_ref()
            .zip(state.plan.as_ref())
            .map(|(m, p)| pipeline::render_placements(m, p)),
        EmitStage::Json => pipeline::report_json(&state, &source),
    };
    match output {
        Some(text) => {
            print!("{}", text);
            if !text.ends_with('\n') {
                println!();
            }
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("dplan: nothing to emit for {:?}", cli.emit);
            ExitCode::from(1)
        }
    }
}
