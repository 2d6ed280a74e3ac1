//! Load the peer address snapshot.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use trustchain_storage::{AddrDb, Environment};

#[derive(Args)]
pub struct AddressesArgs {
    /// Write the loaded set back as a snapshot
    #[arg(long)]
    save: bool,
}

pub fn run(env: &Arc<Environment>, args: AddressesArgs) -> Result<()> {
    let store = AddrDb::open(env).context("Failed to open address file")?;
    let addrman = store
        .load_addresses()
        .context("Failed to load peer addresses")?;

    println!(
        "{}  {} known peer addresses",
        "✓".green().bold(),
        addrman.len().to_string().bright_cyan()
    );

    if args.save {
        store
            .write_addrman(&addrman)
            .context("Failed to write address snapshot")?;
        println!("{}  Snapshot written", "✓".green().bold());
    }
    Ok(())
}
