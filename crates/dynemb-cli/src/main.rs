//! Dynemb CLI - train and inspect dynamic embedding tables.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dynemb_cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("dynemb=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(cmd) => {
            let summary = cmd.run()?;
            info!(
                final_step = summary.final_step,
                table_size = summary.table_size,
                "Done"
            );
        }
        Commands::Inspect(cmd) => {
            cmd.run()?;
        }
    }
    Ok(())
}
