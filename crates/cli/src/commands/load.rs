//! Rebuild and verify the block index.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use std::sync::Arc;
use trustchain_chain::{ChainIndexLoader, ForkSelection, VerifyConfig};
use trustchain_core::Hash;
use trustchain_storage::{BlockStore, Environment, TxDb};

#[derive(Args)]
pub struct LoadArgs {
    /// Number of recent blocks to verify
    #[arg(long, default_value = "100")]
    checkblocks: u32,

    /// Verification thoroughness (0-6)
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(0..=6))]
    checklevel: u8,

    /// Which failure decides the fork point when several are found
    #[arg(long, value_enum, default_value_t = ForkArg::Lowest)]
    fork_selection: ForkArg,

    /// Expected genesis block hash (hex)
    #[arg(long)]
    genesis: Option<String>,

    /// Print the owner balance ledger
    #[arg(long)]
    balances: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ForkArg {
    Lowest,
    Highest,
}

impl From<ForkArg> for ForkSelection {
    fn from(arg: ForkArg) -> Self {
        match arg {
            ForkArg::Lowest => ForkSelection::Lowest,
            ForkArg::Highest => ForkSelection::Highest,
        }
    }
}

pub fn run(env: &Arc<Environment>, args: LoadArgs) -> Result<()> {
    let genesis_hash = args
        .genesis
        .as_deref()
        .map(Hash::from_hex)
        .transpose()
        .context("Invalid genesis hash")?;
    let config = VerifyConfig {
        check_depth: args.checkblocks,
        check_level: args.checklevel,
        fork_selection: args.fork_selection.into(),
        genesis_hash,
    };

    println!("{}", "Loading block index...".bold().cyan());
    let txdb = TxDb::open(env, "r+").context("Failed to open block index")?;
    let blocks = BlockStore::open(env).context("Failed to open block file")?;

    let mut loader = ChainIndexLoader::new(&txdb, &blocks, config);
    let report = loader.load().context("Failed to load block index")?;

    if report.cancelled {
        println!("{}", "Load interrupted by shutdown".yellow().bold());
        return Ok(());
    }
    let Some(best) = report.best_hash else {
        println!("{}  Block index is empty", "✓".green().bold());
        return Ok(());
    };

    println!("{}  Loaded {} blocks", "✓".green().bold(), loader.index().len());
    println!("    Best:      {}", best.to_hex().bright_yellow());
    println!("    Height:    {}", report.best_height.to_string().bright_cyan());
    println!("    Trust:     {}", report.best_trust);
    if report.best_invalid_trust > 0 {
        println!("    Invalid:   {}", report.best_invalid_trust);
    }
    println!("    Verified:  {}", report.verified_blocks);

    if let Some(fork) = report.fork_point {
        println!();
        println!(
            "{}  Best chain moved back to {}",
            "!".yellow().bold(),
            fork.to_hex().bright_yellow()
        );
    }

    if args.balances {
        println!();
        println!("{}", "Balances:".bold());
        for (owner, balance) in &report.balances {
            println!("  {}  {}", owner.short().bright_black(), balance);
        }
    }
    Ok(())
}
