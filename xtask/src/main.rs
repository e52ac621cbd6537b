use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace automation for voxstream")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// fmt, clippy, tests and docs, stopping at the first failure
    Check,
    /// cargo fmt --check
    Fmt,
    /// clippy with warnings denied
    Clippy,
    /// Unit and integration tests
    Test,
    /// Stream and EDT timing loop
    Bench,
    /// rustdoc for the workspace
    Doc,
    /// Short headless simulation through the CLI
    Smoke,
}

/// Run `cargo <args>`, failing with `what` if it exits non-zero.
fn cargo(what: &str, args: &[&str]) -> Result<()> {
    println!("==> cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        bail!("{what} failed ({status})");
    }
    Ok(())
}

fn fmt() -> Result<()> {
    cargo("format check", &["fmt", "--all", "--", "--check"])
}

fn clippy() -> Result<()> {
    cargo(
        "clippy",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    )
}

fn test() -> Result<()> {
    cargo("tests", &["test", "--workspace"])
}

fn doc() -> Result<()> {
    cargo("rustdoc", &["doc", "--workspace", "--no-deps"])
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            fmt()?;
            clippy()?;
            test()?;
            doc()?;
        }
        Commands::Fmt => fmt()?,
        Commands::Clippy => clippy()?,
        Commands::Test => test()?,
        Commands::Doc => doc()?,
        Commands::Bench => cargo(
            "bench",
            &["bench", "-p", "voxstream-stream", "--bench", "bench_stream"],
        )?,
        Commands::Smoke => cargo(
            "smoke run",
            &[
                "run", "-p", "voxstream-cli", "--release", "--", "simulate", "--ticks", "20",
                "--edit-every", "5",
            ],
        )?,
    }

    Ok(())
}
