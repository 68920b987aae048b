//! raidp
//!
//! Command-line front end for file-backed parity volumes.
//!
//! A volume lives in one directory: `volume.json` holds its configuration
//! and chunk states, `chunk<N>.img` its chunk devices.
//!
//! ```text
//! raidp --dir ./vol0 create --level raid5 --chunks 4 --strip-size 65536 --chunk-size 67108864
//! raidp --dir ./vol0 write --offset 0 --pattern 0xaa --length 4096
//! raidp --dir ./vol0 read --offset 0 --length 4096
//! raidp --dir ./vol0 set-chunk-state --chunk 1 --state offline
//! raidp --dir ./vol0 rebuild --chunk 1
//! raidp --dir ./vol0 status
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use raidp::adapters::{FileChunkStore, JsonConfigStore};
use raidp::raid::config::{DEFAULT_MAX_TRANSFER, DEFAULT_POOL_SIZE};
use raidp::raid::geometry::{BLOCK_SHIFT, DEFAULT_DATA_OFFSET_BLOCKS};
use raidp::{ChunkState, ConfigStore, RaidLevel, Volume, VolumeConfig, VolumeState};

const CONFIG_FILE: &str = "volume.json";

// =============================================================================
// CLI Arguments
// =============================================================================

/// raidp - RAID-4/RAID-5 software parity engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Volume directory
    #[arg(long, env = "RAIDP_DIR", default_value = ".", global = true)]
    dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new volume and its chunk images
    Create {
        /// Volume name
        #[arg(long, default_value = "raidp")]
        name: String,

        /// raid4 or raid5
        #[arg(long, default_value = "raid5")]
        level: RaidLevel,

        /// Number of chunks, parity included
        #[arg(long)]
        chunks: usize,

        /// Strip size in bytes (power of two)
        #[arg(long, default_value = "65536")]
        strip_size: u64,

        /// Data area per chunk in bytes
        #[arg(long)]
        chunk_size: u64,

        /// Reserved blocks at the start of each chunk
        #[arg(long, default_value_t = DEFAULT_DATA_OFFSET_BLOCKS)]
        data_offset_blocks: u64,

        /// Work-unit pool size
        #[arg(long, default_value_t = DEFAULT_POOL_SIZE)]
        pool_size: usize,

        /// Largest request in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_TRANSFER)]
        max_transfer: usize,
    },

    /// Write to the volume
    Write {
        /// First logical block
        #[arg(long)]
        offset: u64,

        /// File whose contents are written
        #[arg(long, conflicts_with = "pattern")]
        input: Option<PathBuf>,

        /// Fill byte, e.g. 0xaa
        #[arg(long, value_parser = parse_byte, requires = "length")]
        pattern: Option<u8>,

        /// Bytes to write with --pattern
        #[arg(long)]
        length: Option<usize>,
    },

    /// Read from the volume
    Read {
        /// First logical block
        #[arg(long)]
        offset: u64,

        /// Bytes to read
        #[arg(long)]
        length: usize,

        /// Write the data here instead of printing a hex dump
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Change a chunk's state
    SetChunkState {
        #[arg(long)]
        chunk: usize,

        /// online, offline, scrubbing or rebuilding
        #[arg(long)]
        state: ChunkState,
    },

    /// Rebuild an offline chunk
    Rebuild {
        #[arg(long)]
        chunk: usize,
    },

    /// Show volume and chunk states
    Status {
        /// Also print engine metrics
        #[arg(long)]
        metrics: bool,
    },
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte {s:?}: {e}"))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    match args.command {
        Command::Create {
            name,
            level,
            chunks,
            strip_size,
            chunk_size,
            data_offset_blocks,
            pool_size,
            max_transfer,
        } => {
            let config = VolumeConfig::new(name, level, chunks, strip_size, chunk_size)
                .with_data_offset_blocks(data_offset_blocks)
                .with_pool_size(pool_size)
                .with_max_transfer(max_transfer);
            create(&args.dir, config).await
        }
        Command::Write {
            offset,
            input,
            pattern,
            length,
        } => {
            let data = match (input, pattern, length) {
                (Some(path), _, _) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, Some(byte), Some(length)) => vec![byte; length],
                _ => bail!("either --input or --pattern with --length is required"),
            };
            let (volume, store) = open(&args.dir)?;
            let len = data.len();
            volume.write(offset, data).await?;
            info!(offset, len, "write complete");
            store.flush().await?;
            Ok(())
        }
        Command::Read {
            offset,
            length,
            output,
        } => {
            let (volume, store) = open(&args.dir)?;
            let data = volume.read(offset, length).await?;
            match output {
                Some(path) => std::fs::write(&path, &data)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => print_hex(offset, &data),
            }
            store.flush().await?;
            Ok(())
        }
        Command::SetChunkState { chunk, state } => {
            let (volume, store) = open(&args.dir)?;
            let current = volume
                .chunk_state(chunk)
                .with_context(|| format!("no chunk {chunk}"))?;
            if !current.can_transition_to(state) {
                bail!("chunk {chunk} cannot go from {current} to {state}");
            }
            let mut states = volume.chunk_states();
            states[chunk] = state;
            let (from, to) = (volume.volume_state(), VolumeState::from_chunks(&states));
            if !from.can_transition_to(to) {
                bail!("volume cannot go from {from} to {to}");
            }
            let transition = volume.set_chunk_state(chunk, state)?;
            println!(
                "chunk {}: {} -> {} (volume {} -> {})",
                transition.chunk,
                transition.from,
                transition.to,
                transition.volume_from,
                transition.volume_to
            );
            store.flush().await?;
            Ok(())
        }
        Command::Rebuild { chunk } => {
            let (volume, store) = open(&args.dir)?;
            let result = volume.rebuild_chunk(chunk).await;
            // Chunk states are persisted whether or not the rebuild succeeded.
            store.flush().await?;
            result?;
            println!("chunk {chunk} rebuilt, volume {}", volume.volume_state());
            Ok(())
        }
        Command::Status { metrics } => {
            let (volume, _) = open(&args.dir)?;
            print_status(&volume);
            if metrics {
                print!("{}", volume.metrics().gather_text()?);
            }
            Ok(())
        }
    }
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn create(dir: &Path, config: VolumeConfig) -> anyhow::Result<()> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    config.validate()?;
    let geometry = config.geometry()?;

    FileChunkStore::open(dir, geometry.chunk_count(), geometry.chunk_device_size())
        .with_context(|| format!("creating chunk images in {}", dir.display()))?;

    let store = JsonConfigStore::spawn(&path);
    store.persist(config.clone());
    store.flush().await?;

    info!(
        volume = %config.name,
        id = %config.id,
        capacity = geometry.capacity(),
        "created volume"
    );
    println!(
        "created {} volume {} ({} chunks, {} bytes)",
        config.level,
        config.name,
        config.chunk_count,
        geometry.capacity()
    );
    Ok(())
}

fn open(dir: &Path) -> anyhow::Result<(Arc<Volume>, JsonConfigStore)> {
    let path = dir.join(CONFIG_FILE);
    let config = VolumeConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let geometry = config.geometry()?;

    let chunks = FileChunkStore::open(dir, geometry.chunk_count(), geometry.chunk_device_size())
        .with_context(|| format!("opening chunk images in {}", dir.display()))?;
    let store = JsonConfigStore::spawn(&path);
    let volume = Volume::attach(config, Arc::new(chunks), Arc::new(store.clone()))?;

    let state = volume.volume_state();
    if state != VolumeState::Online {
        warn!(volume = %volume.name(), %state, "volume is not fully redundant");
    }
    Ok((volume, store))
}

fn print_status(volume: &Volume) {
    let config = volume.config();
    let geometry = volume.geometry();
    println!("volume:     {} ({})", config.name, config.id);
    println!("level:      {}", geometry.level());
    println!("state:      {}", volume.volume_state());
    println!("capacity:   {} bytes", geometry.capacity());
    println!("strip size: {} bytes", geometry.strip_size());
    println!("rows:       {}", geometry.rows());
    println!("requests:   {} concurrent", volume.max_concurrent_requests());
    println!("updated:    {} (change {})", config.updated_at.to_rfc3339(), config.sequence);
    for (index, state) in config.chunk_states.iter().enumerate() {
        println!("chunk {index}:    {state}");
    }
}

fn print_hex(lba: u64, data: &[u8]) {
    let base = lba << BLOCK_SHIFT;
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:010x}  {}", base + (i * 16) as u64, hex.join(" "));
    }
}
