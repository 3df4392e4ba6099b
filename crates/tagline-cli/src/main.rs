#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tagline_bus::{BusConfig, DEFAULT_SERVER_ADDR, DEFAULT_SERVER_PORT};
use tagline_driver::{DriverConfig, TaglineDriver};
use tagline_types::{TagBlock, TagId};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "tagline",
    about = "Mirrored tagline block storage over a remote RAID array"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Exercise a live RAID server: write, verify, rewrite, poll, close.
    Smoke {
        /// RAID server address.
        #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
        addr: String,
        /// RAID server port.
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
        /// Number of taglines to exercise.
        #[arg(long, default_value_t = 4)]
        tags: u32,
        /// Blocks written per tagline.
        #[arg(long, default_value_t = 8)]
        blocks: u32,
        /// Pin the disk-selection RNG.
        #[arg(long)]
        seed: Option<u64>,
        /// Output the summary in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct SmokeSummary {
    tags: u32,
    blocks_per_tag: u32,
    cache_inserts: u64,
    cache_gets: u64,
    cache_hits: u64,
    cache_misses: u64,
    cache_hit_ratio: f64,
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Smoke {
            addr,
            port,
            tags,
            blocks,
            seed,
            json,
        } => smoke(addr, port, tags, blocks, seed, json),
    }
}

/// Deterministic fill byte for one position of the workload.
fn pattern(tag: u32, block: u32, byte: usize) -> u8 {
    (tag.wrapping_mul(31) ^ block.wrapping_mul(7) ^ byte as u32) as u8
}

fn smoke(addr: String, port: u16, tags: u32, blocks: u32, seed: Option<u64>, json: bool) -> Result<()> {
    let mut config = DriverConfig::new(tags);
    config.bus = BusConfig { addr, port };
    config.seed = seed;
    if tags == 0 || blocks == 0 {
        bail!("--tags and --blocks must be non-zero");
    }
    if blocks > 255 || blocks > config.geometry.max_tag_blocks {
        bail!(
            "--blocks must be at most 255 and within the tagline limit of {}",
            config.geometry.max_tag_blocks
        );
    }
    let block_size = config.geometry.block_size;

    let mut driver = TaglineDriver::connect(config).context("connecting to the RAID server")?;

    let mut buffer = vec![0_u8; blocks as usize * block_size];
    for tag in 0..tags {
        for block in 0..blocks {
            for byte in 0..block_size {
                buffer[block as usize * block_size + byte] = pattern(tag, block, byte);
            }
        }
        driver
            .write(TagId(tag), TagBlock(0), &buffer)
            .with_context(|| format!("writing tagline {tag}"))?;
    }

    let mut out = vec![0_u8; blocks as usize * block_size];
    for tag in 0..tags {
        driver
            .read(TagId(tag), TagBlock(0), &mut out)
            .with_context(|| format!("reading tagline {tag}"))?;
        for block in 0..blocks {
            for byte in 0..block_size {
                let expected = pattern(tag, block, byte);
                let actual = out[block as usize * block_size + byte];
                if actual != expected {
                    bail!(
                        "verification failed: tag {tag} block {block} byte {byte}: \
                         expected {expected:#04x}, got {actual:#04x}"
                    );
                }
            }
        }
    }

    // Overwrite the middle block of tagline 0 and check it sticks.
    let middle = blocks / 2;
    let rewrite = vec![0xD6_u8; block_size];
    driver
        .write(TagId(0), TagBlock(middle), &rewrite)
        .context("rewriting the middle block")?;
    let mut single = vec![0_u8; block_size];
    driver
        .read(TagId(0), TagBlock(middle), &mut single)
        .context("reading the rewritten block")?;
    if single != rewrite {
        bail!("rewritten block did not read back");
    }

    driver.status_poll().context("status poll")?;

    let stats = driver.cache_stats();
    driver.close().context("closing the driver")?;

    let summary = SmokeSummary {
        tags,
        blocks_per_tag: blocks,
        cache_inserts: stats.inserts,
        cache_gets: stats.gets,
        cache_hits: stats.hits,
        cache_misses: stats.misses,
        cache_hit_ratio: stats.hit_ratio(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "smoke ok: {} tagline(s) x {} block(s); cache {}/{} hits ({:.1}%)",
            summary.tags,
            summary.blocks_per_tag,
            summary.cache_hits,
            summary.cache_hits + summary.cache_misses,
            summary.cache_hit_ratio * 100.0
        );
    }
    Ok(())
}
