use std::io::{stdin, stdout, BufWriter};

use anyhow::{Context, Error};
use clap::{Parser, Subcommand};

use gfc_datastore::{ChunkStore, FilterConfig, GitRepo};
use git_fastcdc::FilterDriver;

#[derive(Parser)]
#[command(
    name = "git-fastcdc",
    version,
    about = "Deduplicating clean/smudge filter storing large files as content-defined chunks"
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the long-lived filter process (git invokes this through
    /// `filter.fastcdc.process`).
    Process,
}

fn run_filter_process() -> Result<(), Error> {
    let repo = GitRepo::open(".").context("git-fastcdc must run inside a repository")?;
    let config = FilterConfig::load(&repo)?;
    let tmp_dir = repo.tmp_dir().to_path_buf();
    let store = ChunkStore::open(repo)?;

    // both streams stay binary; stderr is the only diagnostics channel
    let input = stdin().lock();
    let output = BufWriter::new(stdout().lock());

    FilterDriver::new(input, output, store, &config, tmp_dir)?.run()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        CliCommand::Process => run_filter_process(),
    };

    if let Err(err) = result {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
