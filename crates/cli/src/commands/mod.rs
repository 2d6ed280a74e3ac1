//! CLI commands module.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use trustchain_storage::{EnvConfig, Environment};

mod addresses;
mod flush;
mod load;
mod rewrite;

/// Storage options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    /// Node data directory
    #[arg(long, global = true, default_value = "./data")]
    pub datadir: PathBuf,

    /// Database cache size in megabytes
    #[arg(long, global = true, default_value = "25")]
    pub dbcache: u64,

    /// Log volume in megabytes that triggers a checkpoint on close
    #[arg(long, global = true, default_value = "100")]
    pub dblogsize: u64,

    /// Detach every idle file on flush, including the block index
    #[arg(long, global = true)]
    pub detachdb: bool,

    /// Treat the node as being in its initial block download
    #[arg(long, global = true)]
    pub initial_sync: bool,
}

impl DbArgs {
    pub fn env_config(&self) -> EnvConfig {
        EnvConfig {
            data_dir: self.datadir.clone(),
            cache_size_mb: self.dbcache,
            log_size_mb: self.dblogsize,
            force_detach: self.detachdb,
            temporary: false,
        }
    }

    fn open_env(&self) -> Result<Arc<Environment>> {
        let env = Environment::open(self.env_config()).with_context(|| {
            format!("Failed to open database environment in {:?}", self.datadir)
        })?;
        env.set_initial_sync(self.initial_sync);
        debug!(datadir = ?self.datadir, cache_mb = self.dbcache, "environment ready");
        Ok(env)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rebuild and verify the block index
    Load(load::LoadArgs),
    /// Compact a database file
    Rewrite(rewrite::RewriteArgs),
    /// Flush idle database files
    Flush(flush::FlushArgs),
    /// Load the peer address snapshot
    Addresses(addresses::AddressesArgs),
}

pub fn run(cmd: Commands, db: &DbArgs) -> Result<()> {
    let env = db.open_env()?;
    match cmd {
        Commands::Load(args) => load::run(&env, args),
        Commands::Rewrite(args) => rewrite::run(&env, args),
        Commands::Flush(args) => flush::run(&env, args),
        Commands::Addresses(args) => addresses::run(&env, args),
    }
}
