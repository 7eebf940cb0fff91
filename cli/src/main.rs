//! Command-line front-end for an off-heap map file: open or create one and
//! run a single operation against it.
//!
//! Keys and values are treated as UTF-8 strings (`StringCodec`); binary
//! payloads aren't exposed here.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use offheap_map::{EngineParams, MapBuilder, MapEngine, StringCodec};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "offheap-map", version, about = "Inspect and drive an off-heap map file")]
struct Cli {
    /// Path to the backing map file.
    #[arg(short, long)]
    file: PathBuf,

    /// Number of segments (power of two). Only used with `create`.
    #[arg(long, default_value_t = 16)]
    segments: u32,

    /// Entries per segment (multiple of 8). Only used with `create`.
    #[arg(long, default_value_t = 4096)]
    entries_per_segment: u32,

    /// Entry size in bytes. Only used with `create`.
    #[arg(long, default_value_t = 128)]
    entry_size: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new, empty map file.
    Create,
    /// Insert or overwrite a key.
    Put { key: String, value: String },
    /// Insert a key only if it is absent.
    PutIfAbsent { key: String, value: String },
    /// Print a key's value, if present.
    Get { key: String },
    /// Check whether a key is present.
    Contains { key: String },
    /// Remove a key, printing its prior value if it existed.
    Remove { key: String },
    /// Print every key/value pair.
    Iterate,
    /// Print the number of live entries.
    Size,
    /// Run the segment consistency check.
    CheckConsistency,
}

fn params(cli: &Cli) -> EngineParams {
    EngineParams {
        segments: cli.segments,
        entries_per_segment: cli.entries_per_segment,
        entry_size: cli.entry_size,
        meta_data_bytes: 0,
        lock_timeout: Duration::from_secs(2),
    }
}

type Engine = MapEngine<String, String, StringCodec, StringCodec>;

fn open(cli: &Cli) -> Result<Engine> {
    MapBuilder::new()
        .segments(cli.segments)
        .entries_per_segment(cli.entries_per_segment)
        .entry_size(cli.entry_size)
        .open(&cli.file)
        .with_context(|| format!("opening {}", cli.file.display()))
}

fn run(cli: Cli) -> Result<()> {
    if matches!(cli.command, Command::Create) {
        let p = params(&cli);
        MapBuilder::<String, String, StringCodec, StringCodec>::new()
            .segments(p.segments)
            .entries_per_segment(p.entries_per_segment)
            .entry_size(p.entry_size)
            .create(&cli.file)
            .with_context(|| format!("creating {}", cli.file.display()))?;
        tracing::info!(path = %cli.file.display(), "created map file");
        return Ok(());
    }

    let mut engine = open(&cli)?;

    match cli.command {
        Command::Create => unreachable!(),
        Command::Put { key, value } => {
            let prev = engine.put(&key, &value, &offheap_map::NoopListener)?;
            match prev {
                Some(old) => println!("replaced {old:?}"),
                None => println!("inserted"),
            }
        }
        Command::PutIfAbsent { key, value } => {
            let prev = engine.put_if_absent(&key, &value, &offheap_map::NoopListener)?;
            match prev {
                Some(old) => println!("already present: {old:?}"),
                None => println!("inserted"),
            }
        }
        Command::Get { key } => match engine.get(&key)? {
            Some(value) => println!("{value}"),
            None => bail!("key not found"),
        },
        Command::Contains { key } => {
            println!("{}", engine.contains_key(&key)?);
        }
        Command::Remove { key } => match engine.remove(&key)? {
            Some(old) => println!("removed {old:?}"),
            None => bail!("key not found"),
        },
        Command::Iterate => {
            let mut it = engine.entry_iterator();
            while let Some((key, value)) = it.next()? {
                println!("{key}\t{value}");
            }
        }
        Command::Size => {
            println!("{}", engine.long_size());
        }
        Command::CheckConsistency => {
            engine.check_consistency()?;
            println!("ok");
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    run(cli)
}
