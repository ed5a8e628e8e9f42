use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "packrat")]
#[command(about = "Idle-time filesystem catalog maintenance", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the maintenance engine over the configured roots
    Maintain,
    /// Print catalog entry counts, duplicate candidates and space usage
    Status,
    /// Print configuration values
    PrintConfig,
    /// Truncate all catalog tables
    TruncateDb,
}
