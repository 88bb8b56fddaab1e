//! FumbleChain daemon.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use fumblechain_core::{BlockChain, ChainConfig};
use fumblechain_network::{Node, MAX_PEERS};

/// Environment variable overriding the default chain file location.
const BLOCKCHAIN_PATH_ENV: &str = "FUMBLECHAIN_BLOCKCHAIN_PATH";
const DEFAULT_BLOCKCHAIN_PATH: &str = "bc.json";
const GENESIS_PATH: &str = "genesis.json";

#[derive(Parser)]
#[command(name = "fumbled")]
#[command(about = "FumbleChain node daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full node
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Port to listen on for peers
    #[arg(short = 'p', long, default_value_t = 2222)]
    port: u16,

    /// Peer to connect to (host:port), repeatable
    #[arg(short = 'P', long = "peer")]
    peers: Vec<String>,

    /// Port to listen on for the client API
    #[arg(long, default_value_t = 1337)]
    api_port: u16,

    /// Blockchain magic value
    #[arg(long, default_value_t = 0xabcdef12)]
    magic: u32,

    /// Path to a blockchain file to resume from
    #[arg(long)]
    file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => start(args).await,
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Parses `host:port` (or a bare port, meaning localhost).
fn parse_peer(s: &str) -> Option<(String, u16)> {
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let host = if host.is_empty() { "127.0.0.1" } else { host };
            Some((host.to_string(), port.parse().ok()?))
        }
        None => Some(("127.0.0.1".to_string(), s.parse().ok()?)),
    }
}

/// Loads the chain: an explicit file wins, then an existing chain file,
/// then the genesis document, then a fresh chain.
fn load_chain(args: &StartArgs, default_path: &Path) -> fumblechain_core::Result<BlockChain> {
    if let Some(file) = &args.file {
        debug!("loading blockchain from file: {}", file.display());
        return BlockChain::load_from_file(file);
    }
    if default_path.exists() {
        debug!("loading blockchain from file: {}", default_path.display());
        return BlockChain::load_from_file(default_path);
    }
    if let Some(parent) = default_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if Path::new(GENESIS_PATH).exists() {
        debug!("loading genesis from {GENESIS_PATH}");
        return BlockChain::load_from_file(GENESIS_PATH);
    }
    info!("no chain file or genesis found, starting a fresh chain");
    Ok(BlockChain::new(ChainConfig::from_env()))
}

async fn start(args: StartArgs) -> ExitCode {
    init_tracing(args.verbose);

    let default_path = PathBuf::from(
        std::env::var(BLOCKCHAIN_PATH_ENV).unwrap_or_else(|_| DEFAULT_BLOCKCHAIN_PATH.into()),
    );

    let mut chain = match load_chain(&args, &default_path) {
        Ok(chain) => chain,
        Err(e) => {
            error!("failed to load blockchain: {e}");
            return ExitCode::FAILURE;
        }
    };
    chain.magic = args.magic;
    chain.set_ctf_wallets(ChainConfig::from_env().ctf_wallets);

    let mut peers = Vec::new();
    for value in &args.peers {
        match parse_peer(value) {
            Some(peer) => peers.push(peer),
            None => {
                error!("invalid peer address: {value}");
                return ExitCode::FAILURE;
            }
        }
    }

    let chain_path = args.file.clone().unwrap_or(default_path);
    let node = Arc::new(Node::new(chain, args.port, MAX_PEERS, chain_path));
    let manager = node.manager();

    info!("starting p2p node");
    let exit = tokio::select! {
        result = node.run(peers) => {
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("p2p node failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        result = fumblechain_rpc::serve(manager, args.api_port) => {
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("client api failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            ExitCode::SUCCESS
        }
    };

    node.save();
    exit
}

#[cfg(test)]
mod tests {
    use super::parse_peer;

    #[test]
    fn peer_specs_parse() {
        assert_eq!(parse_peer("10.0.0.1:2222"), Some(("10.0.0.1".into(), 2222)));
        assert_eq!(parse_peer("2222"), Some(("127.0.0.1".into(), 2222)));
        assert_eq!(parse_peer(":2222"), Some(("127.0.0.1".into(), 2222)));
        assert_eq!(parse_peer("host:notaport"), None);
    }
}
