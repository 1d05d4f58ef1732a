#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, WrapErr};
use tracing_subscriber::EnvFilter;

use pythoc::Session;
use pythoc_ast::Unit;

/// Ahead-of-time compiler for a statically-typed host-language subset.
///
/// The host parser is an external collaborator: each input file is a
/// translation unit serialized as JSON in the `pythoc-ast` shape.
#[derive(Parser)]
#[command(name = "pythoc", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile units and write LLVM IR plus a compile manifest.
    Build {
        /// Translation units (JSON ASTs), in compilation order.
        units: Vec<PathBuf>,
        /// Output path for the LLVM IR.
        #[arg(short, long, default_value = "out.ll")]
        output: PathBuf,
        /// Optional path for the JSON compile manifest.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Run every check without emitting IR.
    Check {
        units: Vec<PathBuf>,
    },
    /// Compile units and print the LLVM IR to stdout.
    EmitIr {
        units: Vec<PathBuf>,
    },
}

fn load_units(paths: &[PathBuf]) -> miette::Result<Vec<Unit>> {
    let mut units = Vec::new();
    for path in paths {
        let text = fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let unit: Unit = serde_json::from_str(&text)
            .into_diagnostic()
            .wrap_err_with(|| format!("parsing {}", path.display()))?;
        units.push(unit);
    }
    Ok(units)
}

fn compile(units: &[Unit]) -> miette::Result<Session> {
    let mut session = Session::new();
    for unit in units {
        session.add_unit(unit)?;
    }
    session.compile_all()?;
    Ok(session)
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Build { units, output, manifest } => {
            let session = compile(&load_units(&units)?)?;
            let ir = session.emit_llvm_ir()?;
            fs::write(&output, ir)
                .into_diagnostic()
                .wrap_err_with(|| format!("writing {}", output.display()))?;
            if let Some(path) = manifest {
                let json = serde_json::to_string_pretty(session.manifest()).into_diagnostic()?;
                fs::write(&path, json)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("writing {}", path.display()))?;
            }
            eprintln!(
                "compiled {} symbol(s) -> {}",
                session.manifest().symbols.len(),
                output.display()
            );
            Ok(())
        }
        Command::Check { units } => {
            let session = compile(&load_units(&units)?)?;
            eprintln!("ok: {} symbol(s) checked", session.manifest().symbols.len());
            Ok(())
        }
        Command::EmitIr { units } => {
            let session = compile(&load_units(&units)?)?;
            print!("{}", session.emit_llvm_ir()?);
            Ok(())
        }
    }
}
