//! Flush idle database files.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use trustchain_storage::Environment;

#[derive(Args)]
pub struct FlushArgs {
    /// Shut the environment down once everything is flushed
    #[arg(long)]
    pub shutdown: bool,
}

pub fn run(env: &Arc<Environment>, args: FlushArgs) -> Result<()> {
    env.flush_all(args.shutdown);

    println!("{}  Flushed idle files", "✓".green().bold());
    if args.shutdown {
        if env.is_open() {
            println!("{}  Files still in use, environment left open", "!".yellow().bold());
        } else {
            println!("{}  Environment shut down", "✓".green().bold());
        }
    }
    Ok(())
}
