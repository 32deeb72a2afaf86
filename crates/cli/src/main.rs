mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pgstep::{ConfigError, MigrateConfig};

use commands::*;
use logging::LogFormat;

#[derive(Parser)]
#[command(name = "pgstep")]
#[command(about = "Step-wise PostgreSQL migrations from named SQL script blocks", version)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a migration script into steps and print them
    Parse {
        /// Path to the migration script
        script: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply the pending steps of a migration script
    Run {
        /// Path to the migration script
        script: PathBuf,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// List the steps recorded in the ledger table
    Status {
        #[command(flatten)]
        target: TargetArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Where migrations are applied
#[derive(Args, Debug, Default)]
struct TargetArgs {
    /// Ledger table name (defaults to PGSTEP_LEDGER_TABLE or "migrations")
    #[arg(long)]
    table: Option<String>,

    /// PostgreSQL connection URL (defaults to DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

impl TargetArgs {
    /// Overlay the flags on the environment configuration
    fn apply(self, mut config: MigrateConfig) -> Result<MigrateConfig, ConfigError> {
        if let Some(table) = self.table {
            config.ledger_table = table;
        }
        if let Some(url) = self.database_url {
            config.database_url = Some(url);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = MigrateConfig::from_env()?;
    logging::init(&config.log_level, cli.log_format)?;

    match cli.command {
        Commands::Parse { script, json } => {
            parse::run(&script, json)?;
        }
        Commands::Run { script, target } => {
            migrate::run(&script, target.apply(config)?).await?;
        }
        Commands::Status { target, json } => {
            status::run(target.apply(config)?, json).await?;
        }
    }

    Ok(())
}
