//! dedup - command-line access to a dedup-store backing file
//!
//! Attaches like any other process would, so it can run alongside the
//! tools that fill the store.

use clap::{Parser, Subcommand};
use console::style;
use dedup_store::{
    InsertOutcome, Store, StoreConfig, StoreError, DEFAULT_LOCK_NAME, DEFAULT_PATH,
    DEFAULT_REGION_PAGES,
};
use inquire::Confirm;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dedup")]
#[command(about = "Inspect and fill a shared dedup store", long_about = None)]
struct Cli {
    /// Backing file
    #[arg(short, long, env = "DEDUP_STORE_FILE", default_value = DEFAULT_PATH)]
    file: PathBuf,

    /// Named lock shared by every process using the file
    #[arg(short, long, env = "DEDUP_STORE_LOCK", default_value = DEFAULT_LOCK_NAME)]
    lock: String,

    /// Region size in pages, used when the file is created
    #[arg(short, long, env = "DEDUP_STORE_PAGES", default_value_t = DEFAULT_REGION_PAGES)]
    pages: usize,

    /// Log more (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append items, duplicates included
    Insert {
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Exit 0 if the item is stored, 1 otherwise
    Contains { item: String },

    /// Append items that are not stored yet
    Add {
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Print every item in insertion order
    Dump,

    /// Print header counters
    Stats,

    /// Delete the backing file and the named lock
    Remove {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = StoreConfig::new(&cli.file, cli.lock.as_str()).with_pages(cli.pages);
    debug!(?config, "resolved configuration");

    match run(cli.command, config) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {}", style("error:").red().bold(), err);
            ExitCode::from(2)
        }
    }
}

fn run(command: Commands, config: StoreConfig) -> Result<ExitCode, StoreError> {
    match command {
        Commands::Insert { items } => with_store(config, |store| {
            for item in &items {
                store.insert(item)?;
            }
            println!("{} {} item(s)", style("inserted").green(), items.len());
            Ok(ExitCode::SUCCESS)
        }),
        Commands::Contains { item } => with_store(config, |store| {
            if store.contains(&item)? {
                println!("{}", style("present").green());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{}", style("absent").yellow());
                Ok(ExitCode::from(1))
            }
        }),
        Commands::Add { items } => with_store(config, |store| {
            for item in &items {
                let outcome = match store.insert_if_absent(item)? {
                    InsertOutcome::Inserted => style("inserted").green(),
                    InsertOutcome::AlreadyPresent => style("present").dim(),
                };
                println!("{outcome:>9}  {item}");
            }
            Ok(ExitCode::SUCCESS)
        }),
        Commands::Dump => with_store(config, |store| {
            for entry in store.entries()? {
                println!("{}", String::from_utf8_lossy(&entry));
            }
            Ok(ExitCode::SUCCESS)
        }),
        Commands::Stats => with_store(config, |store| {
            let stats = store.stats()?;
            let config = store.config();
            println!("file:      {}", style(config.path.display()).cyan());
            println!("lock:      {}", style(&config.lock_name).cyan());
            println!("items:     {}", style(stats.count).green());
            println!(
                "arena:     {} / {} bytes ({:.1}%)",
                stats.length,
                stats.capacity,
                stats.length as f64 * 100.0 / stats.capacity as f64
            );
            println!("region:    {} bytes", stats.region_size);
            Ok(ExitCode::SUCCESS)
        }),
        Commands::Remove { yes } => remove(&config, yes),
    }
}

/// Attach, run `f`, detach. The store is detached even when `f` fails.
fn with_store(
    config: StoreConfig,
    f: impl FnOnce(&Store) -> Result<ExitCode, StoreError>,
) -> Result<ExitCode, StoreError> {
    let store = Store::attach(config)?;
    let code = f(&store);
    let detached = store.detach();
    let code = code?;
    detached?;
    Ok(code)
}

fn remove(config: &StoreConfig, yes: bool) -> Result<ExitCode, StoreError> {
    if !yes {
        let prompt = format!(
            "Delete {} and lock {}?",
            config.path.display(),
            config.lock_name
        );
        let confirmed = Confirm::new(&prompt)
            .with_default(false)
            .with_help_message("processes still attached keep their mapping")
            .prompt()
            .unwrap_or(false);
        if !confirmed {
            println!("{}", style("cancelled").red());
            return Ok(ExitCode::from(1));
        }
    }

    Store::remove(config)?;
    println!("{} {}", style("removed").green(), config.path.display());
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir, tag: &str) -> StoreConfig {
        let lock = format!("/dedup_cli_{}_{}", tag, std::process::id());
        StoreConfig::new(dir.path().join("store"), lock.as_str()).with_pages(1)
    }

    fn exit_code(result: Result<ExitCode, StoreError>) -> String {
        format!("{:?}", result.unwrap())
    }

    #[test]
    fn test_commands_attach_and_detach() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, "cmds");
        let items = vec!["struct foo".to_string(), "struct foo".to_string()];

        let success = format!("{:?}", ExitCode::SUCCESS);
        let absent = format!("{:?}", ExitCode::from(1));

        assert_eq!(exit_code(run(Commands::Add { items }, config.clone())), success);
        let code = run(Commands::Contains { item: "struct foo".into() }, config.clone());
        assert_eq!(exit_code(code), success);
        let code = run(Commands::Contains { item: "struct bar".into() }, config.clone());
        assert_eq!(exit_code(code), absent);
        assert_eq!(exit_code(run(Commands::Dump, config.clone())), success);

        let store = Store::attach(config.clone()).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        store.detach().unwrap();

        Store::remove(&config).unwrap();
    }

    #[test]
    fn test_remove_does_not_attach() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, "rm");

        let code = run(Commands::Remove { yes: true }, config.clone());
        assert_eq!(exit_code(code), format!("{:?}", ExitCode::SUCCESS));
        assert!(!config.path.exists());
    }
}
