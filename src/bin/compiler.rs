//! The compiler binary: source file in, either assembly text or a run of
//! the reference VM out, depending on whether an output path was given.
//!
//! Run with `--help` for usage.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use jftt_compiler::{back, front, middle, vm};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Source file to compile.
    input: PathBuf,
    /// Where to write the assembled program. Omit to run it on the
    /// reference VM against stdin/stdout instead.
    output: Option<PathBuf>,
    /// Dump an intermediate stage instead of writing assembly or running
    /// the VM; a debugging convenience, not part of the normal pipeline.
    #[arg(value_enum, long)]
    dump: Option<Dump>,
}

/// Which intermediate representation `--dump` prints.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Dump {
    /// The lexer's token stream.
    Tokens,
    /// The parsed AST.
    Ast,
    /// The LIR after lowering, allocation, and spilling.
    Lir,
    /// The final assembly text (same as writing to an output file).
    Asm,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;

    if let Some(dump) = args.dump {
        return run_dump(dump, &source);
    }

    let ast = front::parse(&source).map_err(|e| anyhow::anyhow!("{e}"))?;

    let diagnostics = front::analyze(&ast);
    let mut fatal = false;
    for d in &diagnostics {
        eprintln!("{d}");
        fatal |= !d.is_warning;
    }
    if fatal {
        anyhow::bail!("semantic analysis found errors");
    }

    let lir = middle::lower(&ast).map_err(|diags| {
        for d in &diags {
            eprintln!("{d}");
        }
        anyhow::anyhow!("emission found errors")
    })?;

    let allocation = middle::regalloc::allocate(lir).map_err(|d| anyhow::anyhow!("{d}"))?;
    let assembled = back::asm::assemble(&allocation);

    match &args.output {
        Some(path) => {
            std::fs::write(path, assembled.to_text())
                .with_context(|| format!("writing {}", path.display()))?;
        }
        None => {
            let inputs = read_stdin_numbers()?;
            let mut machine = vm::Vm::new(&assembled);
            let stdout = std::io::stdout();
            let mut iter = inputs.into_iter();
            machine
                .run(&mut iter, &mut |value| {
                    let mut handle = stdout.lock();
                    let _ = writeln!(handle, "{value}");
                })
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", machine.cost());
        }
    }

    Ok(())
}

/// `--dump`'s four stops: lex only, lex+parse, lex+parse+lower+allocate, or
/// the full pipeline through assembly. Each stage re-runs everything before
/// it rather than sharing state with `run`, since a dump is a one-shot
/// debugging invocation, not part of the compile-then-execute path.
fn run_dump(dump: Dump, source: &str) -> anyhow::Result<()> {
    if dump == Dump::Tokens {
        let tokens = front::lex::Lexer::new(source).lex_all().map_err(|e| anyhow::anyhow!("{e}"))?;
        for token in tokens {
            println!("{token}");
        }
        return Ok(());
    }

    let ast = front::parse(source).map_err(|e| anyhow::anyhow!("{e}"))?;
    if dump == Dump::Ast {
        println!("{ast:#?}");
        return Ok(());
    }

    let lir = middle::lower(&ast).map_err(|diags| {
        for d in &diags {
            eprintln!("{d}");
        }
        anyhow::anyhow!("emission found errors")
    })?;
    let allocation = middle::regalloc::allocate(lir).map_err(|d| anyhow::anyhow!("{d}"))?;
    if dump == Dump::Lir {
        println!("{:#?}", allocation.program);
        return Ok(());
    }

    let assembled = back::asm::assemble(&allocation);
    print!("{}", assembled.to_text());
    Ok(())
}

/// Every whitespace-separated integer on stdin, in order, as the VM's
/// `READ` feed.
fn read_stdin_numbers() -> anyhow::Result<Vec<i64>> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
    buf.split_whitespace()
        .map(|tok| tok.parse::<i64>().with_context(|| format!("{tok:?} is not an integer")))
        .collect()
}
