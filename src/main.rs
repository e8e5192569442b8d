use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tjs::diagnostic::{Diagnostic, ansi::AnsiRenderer, json};
use tjs::{Engine, EngineConfig};

/// Run a TJS script, or an inline snippet, on a fresh engine.
#[derive(Parser, Debug)]
#[command(name = "tjs", version, about)]
struct Cli {
    /// Script file to run.
    #[arg(required_unless_present = "eval", conflicts_with = "eval")]
    file: Option<PathBuf>,

    /// Source text to run instead of a file.
    #[arg(short, long)]
    eval: Option<String>,

    /// JSON file with engine limits.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    max_call_depth: Option<usize>,

    #[arg(long)]
    max_array_length: Option<usize>,

    /// Print the result and any error as JSON.
    #[arg(long)]
    json: bool,

    /// Disable ANSI colors in error output.
    #[arg(long)]
    no_color: bool,

    /// Print the compiled bytecode instead of running it.
    #[arg(long)]
    dump: bool,
}

fn load_config(cli: &Cli) -> Result<EngineConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("error reading {}: {e}", path.display()))?;
            serde_json::from_str(&text).map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(depth) = cli.max_call_depth {
        config.max_call_depth = depth;
    }
    if let Some(len) = cli.max_array_length {
        config.max_array_length = len;
    }
    Ok(config)
}

fn report(cli: &Cli, d: &Diagnostic) {
    if cli.json {
        eprintln!("{}", json::render(d));
    } else {
        let renderer = AnsiRenderer { use_color: !cli.no_color && std::io::stderr().is_terminal() };
        eprint!("{}", renderer.render(d));
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("TJS_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let source = match (&cli.eval, &cli.file) {
        (Some(src), _) => src.clone(),
        (None, Some(path)) => match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                report(&cli, &Diagnostic::error(format!("error reading {}: {e}", path.display())));
                return ExitCode::FAILURE;
            }
        },
        (None, None) => {
            report(&cli, &Diagnostic::error("no script given"));
            return ExitCode::FAILURE;
        }
    };

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(msg) => {
            report(&cli, &Diagnostic::error(msg));
            return ExitCode::FAILURE;
        }
    };
    let engine = Engine::with_config(config);

    if cli.dump {
        return match engine.compile(&source) {
            Ok(chunk) => {
                print!("{chunk}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                report(&cli, &Diagnostic::from(&e).with_source(source.as_str()));
                ExitCode::FAILURE
            }
        };
    }

    match engine.eval(&source) {
        Ok(value) => {
            if cli.json {
                println!("{}", serde_json::json!({ "result": value.to_json() }));
            } else if !value.is_void() {
                println!("{value}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&cli, &Diagnostic::from(&e).with_source(source.as_str()));
            ExitCode::FAILURE
        }
    }
}
