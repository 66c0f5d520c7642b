//! dso - run and inspect an in-process distributed shared-object node.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dso_node::{DsoNode, load_config, run_demo};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(
    name = "dso",
    version,
    about = "Distributed shared-object runtime node",
    long_about = "Runs a managed object store, its distributed garbage collector and\n\
                  client object managers in one process.\n\n\
                  Run the workload:   dso demo\n\
                  Print statistics:   dso dump\n\
                  Force a DGC pass:   dso gc --young"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Share, read and collect a list across two clients
    Demo {
        /// List cells to share
        #[arg(long, default_value_t = 100)]
        length: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print node statistics after the demo workload
    Dump {
        /// List cells to share
        #[arg(long, default_value_t = 100)]
        length: usize,
    },

    /// Run the demo workload, then one more DGC pass
    Gc {
        /// Young-generation pass instead of a full one
        #[arg(long)]
        young: bool,

        /// List cells to share
        #[arg(long, default_value_t = 100)]
        length: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Commands::Gc { young: true, .. } = cli.command {
        config.server.young_gen_enabled = true;
    }
    let node = DsoNode::start(config)?;

    let outcome = run(&node, cli.command);
    node.shutdown();
    outcome
}

fn run(node: &DsoNode, command: Commands) -> Result<()> {
    match command {
        Commands::Demo { length, json } => {
            let report = run_demo(node, length)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("DSO demo");
                println!("========");
                println!();
                println!("List length:     {}", report.list_length);
                println!("Reader sum:      {}", report.reader_sum);
                println!("Map hits/misses: {}/{}", report.map_hits, report.map_misses);
                println!("Collected:       {}", report.collected);
                println!(
                    "Tombstoned:      {}",
                    if report.reader_sees_tombstone { "yes" } else { "no" }
                );
            }
        }
        Commands::Dump { length } => {
            run_demo(node, length)?;
            println!("{}", node.dump().to_json()?);
        }
        Commands::Gc { young, length } => {
            run_demo(node, length)?;
            let result = if young { node.gc_young()? } else { node.gc()? };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
