use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use rpn_jit::repl::{self, Repl};
use rpn_jit::{evaluate, Config};

/// Integer RPN calculator that JIT-compiles every line to native code.
#[derive(Parser, Debug)]
#[command(name = "rpn-jit", version)]
struct Cli {
    /// Check instruction and value-stack capacity before every emitted operation
    #[arg(long, env = "RPN_JIT_HARDENED")]
    hardened: bool,

    /// Evaluate EXPR, print its result and exit (may be repeated)
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    eval: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = if cli.hardened {
        Config::hardened()
    } else {
        Config::default()
    };

    let result = if cli.eval.is_empty() {
        let stdin = io::stdin();
        Repl::new(stdin.lock(), io::stdout().lock(), config).run()
    } else {
        let mut out = io::stdout().lock();
        cli.eval.iter().try_for_each(|expr| {
            writeln!(out, "{}", repl::render(&evaluate(expr, config)))
        })
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "i/o failure");
            ExitCode::FAILURE
        }
    }
}
