use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use log::LevelFilter;

use z80_callgraph::analysis::{analyze, AnalysisConfig};
use z80_callgraph::decoder::Z80Decoder;
use z80_callgraph::format::OutputFormat;
use z80_callgraph::image::load_file;
use z80_callgraph::strategy::{Strategy, WorkOrder};
use z80_callgraph::{parse_address, Address};

#[derive(Parser, Debug)]
#[command(name = "z80cg")]
#[command(about = "Z80 disassembler with subroutine call-graph analysis")]
#[command(version)]
struct Cli {
    /// Input image (raw memory dump or AMSDOS binary)
    input: PathBuf,

    /// Load address (e.g. 0x4000, &4000); forces a raw load
    #[arg(short, long, value_parser = parse_address)]
    base: Option<Address>,

    /// Entry point; repeat for several. Defaults to the AMSDOS entry or the base
    #[arg(short, long = "seed", value_parser = parse_address)]
    seeds: Vec<Address>,

    /// Flow-recovery strategy
    #[arg(long, value_enum, default_value_t)]
    strategy: Strategy,

    /// Worklist order for recursive descent
    #[arg(long, value_enum, default_value_t)]
    order: WorkOrder,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    format: OutputFormat,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Treat RST as a call that returns
    #[arg(long)]
    restart_returns: bool,

    /// Re-decode every recovered instruction and report mismatches
    #[arg(long)]
    verify: bool,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let loaded = load_file(&cli.input, cli.base)
        .with_context(|| format!("Failed to load {}", cli.input.display()))?;

    let seeds = if cli.seeds.is_empty() {
        loaded.entry_point.into_iter().collect()
    } else {
        cli.seeds
    };
    let config = AnalysisConfig {
        seeds,
        strategy: cli.strategy,
        order: cli.order,
        restart_returns: cli.restart_returns,
        verify: cli.verify,
        ..AnalysisConfig::default()
    };

    let analysis = analyze(&loaded.image, &Z80Decoder::new(), &config)
        .with_context(|| format!("Analysis of {} failed", cli.input.display()))?;

    let rendered = cli
        .format
        .get_formatter()
        .format(&analysis, &loaded.image)
        .context("Failed to format output")?;

    match &cli.output {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => print!("{}", rendered),
    }
    Ok(())
}
