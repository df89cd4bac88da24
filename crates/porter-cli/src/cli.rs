use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "porter")]
#[command(about = "Backup transfer client: discover servers, fetch files and lists")]
#[command(after_help = "Run '<command> --help' for detailed options on each command.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe the local network for transfer servers
    Discover(DiscoverArgs),
    /// Download a file, resuming and verifying checkpoints
    Fetch(FetchArgs),
    /// Retrieve the entry list of a server
    List(ListArgs),
}

#[derive(Args, Clone, Debug)]
pub struct DiscoverArgs {
    /// UDP port the servers listen on
    #[arg(long, default_value_t = porter_core::protocol::UDP_PORT)]
    pub udp_port: u16,
    /// Seconds to wait for replies
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Additional addresses to probe directly
    #[arg(long = "hint", value_name = "IPV4")]
    pub hints: Vec<std::net::Ipv4Addr>,
}

#[derive(Args, Clone, Debug)]
pub struct FetchArgs {
    /// Server address (host or host:port)
    pub server: String,
    /// Remote file name, e.g. a path below the served root or a session key
    pub remote_name: String,
    /// Local output file
    pub output: PathBuf,
    /// Identity string presented to the server
    #[arg(long, default_value = "porter-cli")]
    pub identity: String,
    /// Protocol version to speak (0, 1 or 2)
    #[arg(long, default_value_t = porter_core::protocol::PROTOCOL_VERSION)]
    pub protocol_version: u8,
    /// Disable checkpoint hashing (drops to protocol version 1)
    #[arg(long)]
    pub no_hash: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ListArgs {
    /// Server address (host or host:port)
    pub server: String,
    /// Identity string presented to the server
    #[arg(long, default_value = "porter-cli")]
    pub identity: String,
}
