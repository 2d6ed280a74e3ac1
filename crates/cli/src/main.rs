//! trustchain CLI entry point.

use clap::Parser;

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "trustchain")]
#[command(about = "Block index storage tools", long_about = None)]
struct Cli {
    #[command(flatten)]
    db: commands::DbArgs,

    #[command(subcommand)]
    command: Option<commands::Commands>,
}

fn main() {
    let cli = Cli::parse();
    logging::init_logging(logging::DEFAULT_FILTER);

    match cli.command {
        Some(cmd) => {
            if let Err(e) = commands::run(cmd, &cli.db) {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("trustchain - block index storage tools");
            println!("Run 'trustchain --help' for usage information.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commands::Commands;

    #[test]
    fn test_parse_global_db_options() {
        let cli = Cli::try_parse_from([
            "trustchain",
            "--datadir",
            "/tmp/node",
            "--dbcache",
            "64",
            "--detachdb",
            "flush",
            "--shutdown",
        ])
        .unwrap();

        let config = cli.db.env_config();
        assert_eq!(config.data_dir, std::path::PathBuf::from("/tmp/node"));
        assert_eq!(config.cache_size_mb, 64);
        assert_eq!(config.log_size_mb, 100);
        assert!(config.force_detach);
        assert!(matches!(cli.command, Some(Commands::Flush(args)) if args.shutdown));
    }

    #[test]
    fn test_check_level_is_bounded() {
        assert!(Cli::try_parse_from(["trustchain", "load", "--checklevel", "6"]).is_ok());
        assert!(Cli::try_parse_from(["trustchain", "load", "--checklevel", "7"]).is_err());
    }

    #[test]
    fn test_commands_run_against_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let datadir = dir.path().to_str().unwrap();

        for args in [
            vec!["trustchain", "--datadir", datadir, "load"],
            vec!["trustchain", "--datadir", datadir, "addresses", "--save"],
            vec!["trustchain", "--datadir", datadir, "rewrite", "addr.dat"],
            vec!["trustchain", "--datadir", datadir, "flush", "--shutdown"],
        ] {
            let cli = Cli::try_parse_from(args).unwrap();
            commands::run(cli.command.unwrap(), &cli.db).unwrap();
        }
    }
}
