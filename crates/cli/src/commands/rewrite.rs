//! Compact a database file.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use trustchain_storage::{Compactor, Environment, RecordKey, BLOCK_INDEX_FILE};

#[derive(Args)]
pub struct RewriteArgs {
    /// Logical file to rewrite
    #[arg(default_value = BLOCK_INDEX_FILE)]
    file: String,

    /// Drop every record with this tag (e.g. "tx")
    #[arg(long)]
    skip: Option<String>,
}

pub fn run(env: &Arc<Environment>, args: RewriteArgs) -> Result<()> {
    let skip = args.skip.as_deref().map(RecordKey::tag_prefix);

    println!("{} {}", "Rewriting".bold().cyan(), args.file.bold());
    Compactor::new(env)
        .rewrite(&args.file, skip.as_deref())
        .with_context(|| format!("Failed to rewrite {}", args.file))?;

    println!("{}  Rewrite of {} complete", "✓".green().bold(), args.file);
    if let Some(tag) = &args.skip {
        println!("    Dropped records tagged {}", tag.bright_yellow());
    }
    Ok(())
}
