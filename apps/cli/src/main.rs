use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dbi_core::protocol::HEADER_SIZE;
use dbi_core::{CancelToken, Server, ServerConfig, TracingObserver};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "DBI USB install backend (Pure Rust)", long_about = None)]
struct Args {
    /// Directory with NSP/NSZ/XCI/XCZ files to serve
    #[arg(short = 'd', long = "rom-dir")]
    rom_dir: Option<PathBuf>,

    /// TOML config file; command line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// USB vendor id (hex)
    #[arg(long, value_parser = parse_hex)]
    vid: Option<u16>,

    /// USB product id (hex)
    #[arg(long, value_parser = parse_hex)]
    pid: Option<u16>,

    /// Transfer window in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Refuse receivers that skip the handshake
    #[arg(long)]
    strict_handshake: bool,

    /// Serve every matching device at once
    #[arg(long)]
    all_devices: bool,

    /// Wait for the next device after a session ends
    #[arg(long)]
    keep_serving: bool,

    /// Write the effective config as TOML and exit
    #[arg(long, value_name = "FILE")]
    dump_config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "debug", alias = "verbose")]
    debug: bool,
}

fn parse_hex(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{s}': {e}"))
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from_file(path)?,
        None => ServerConfig::default(),
    };

    match &args.rom_dir {
        Some(dir) => config.root = dir.clone(),
        None if args.config.is_none() => bail!("--rom-dir is required without a config file"),
        None => {}
    }
    if let Some(vid) = args.vid {
        config.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.product_id = pid;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
        config.max_frame_size = config.max_frame_size.max(chunk_size + HEADER_SIZE);
    }
    config.strict_handshake |= args.strict_handshake;
    config.all_devices |= args.all_devices;
    config.keep_serving |= args.keep_serving;

    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = build_config(args)?;

    if let Some(path) = &args.dump_config {
        config
            .save_to_file(path)
            .with_context(|| format!("writing config {}", path.display()))?;
        info!(path = %path.display(), "Config written");
        return Ok(());
    }

    let server = Server::new(config, Arc::new(TracingObserver), CancelToken::new())?;
    let outcome = server.run()?;
    info!(
        sessions = outcome.sessions,
        failed = outcome.failed,
        bytes = outcome.bytes_sent,
        "Done"
    );
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.debug {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting DBI backend (nusb backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
