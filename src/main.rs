mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use dotenv::dotenv;
use packrat::config::{self, AppConfig};
use packrat::storage::Store;
use packrat::CrawlEngine;
use std::io::{self, Write};
use std::process;
use tracing::error;

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let _guard = packrat::logging::init_logger();

    let config = match config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    match args.command {
        Some(Commands::Maintain) | None => {
            let engine = CrawlEngine::new(&config);
            if let Err(err) = engine.run(config.root_paths.clone()) {
                // The sink has already been flushed; exiting is the only
                // safe reaction to a structural failure.
                error!("Maintenance terminated: {}", err);
                process::exit(1);
            }
        }
        Some(Commands::Status) => run_status(&config)?,
        Some(Commands::PrintConfig) => {
            println!("Configuration: {config:?}");
        }
        Some(Commands::TruncateDb) => {
            match prompt_confirm("Are you SURE you want to COMPLETELY DELETE the catalog?")? {
                true => {
                    let store = Store::open(&config.store_path)?;
                    store.truncate_all()?;
                    println!("All tables truncated");
                }
                false => println!("Aborted"),
            }
        }
    }

    Ok(())
}

fn run_status(config: &AppConfig) -> anyhow::Result<()> {
    let store = Store::open(&config.store_path)?;
    let summary = store.status_summary()?;
    if summary.is_empty() {
        println!("Catalog is empty");
    }
    for row in summary {
        println!(
            "{:>18} {:>10}: {:>10} entries, {:>14} bytes",
            row.kind.as_str(),
            row.status.as_str(),
            row.entries,
            row.bytes
        );
    }
    let (pairs, wasted) = store.equality_summary()?;
    println!("duplicate candidates: {pairs} pairs, ~{wasted} bytes reclaimable");
    println!("pending writes: {}", store.pending_depth());
    Ok(())
}

fn prompt_confirm(question: &str) -> io::Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}
