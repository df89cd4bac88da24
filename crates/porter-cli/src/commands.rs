use crate::cli::{DiscoverArgs, FetchArgs, ListArgs};
use eyre::{bail, Context, Result};
use log::info;
use porter_core::client::TransferClient;
use porter_core::errors::TransferStatus;
use porter_core::protocol::{PROTOCOL_VERSION, TCP_PORT};
use std::fs::File;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Resolve `host` or `host:port` to a transfer server address.
fn parse_server_addr(server: &str, default_port: u16) -> Result<SocketAddr> {
    let candidate = if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:{default_port}")
    };
    candidate
        .to_socket_addrs()
        .with_context(|| format!("resolving server address '{server}'"))?
        .next()
        .ok_or_else(|| eyre::eyre!("server address '{server}' resolved to nothing"))
}

pub fn run_discover(args: &DiscoverArgs) -> Result<()> {
    let mut client = TransferClient::with_discovery(PROTOCOL_VERSION, "porter-cli")
        .context("setting up discovery sockets")?;
    client.set_target_ports(TCP_PORT, args.udp_port);
    if let Some(secs) = args.timeout {
        client.set_discovery_timeout(Duration::from_secs(secs));
    }

    client.poll_servers(true, &args.hints);
    loop {
        match client.poll_servers(false, &args.hints) {
            TransferStatus::Continue => continue,
            TransferStatus::Timeout => break,
            other => bail!("discovery failed: {other}"),
        }
    }

    if client.servers().is_empty() && client.wrong_version_servers().is_empty() {
        println!("no servers found");
        return Ok(());
    }
    for (addr, name) in client.servers().iter().zip(client.server_names()) {
        println!("{addr}  {name}");
    }
    for addr in client.wrong_version_servers() {
        println!("{addr}  (incompatible protocol version)");
    }
    Ok(())
}

pub fn run_fetch(args: &FetchArgs) -> Result<()> {
    let addr = parse_server_addr(&args.server, TCP_PORT)?;
    let mut client = TransferClient::new(args.protocol_version, args.identity.clone());
    if client.connect(addr) != TransferStatus::Connected {
        bail!("could not connect to {addr}");
    }

    let mut output = File::create(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;

    let status = client.get_file(&args.remote_name, &mut output, !args.no_hash);
    if !status.is_success() {
        bail!("download of '{}' failed: {status}", args.remote_name);
    }
    info!(
        "received {} bytes over the wire",
        client.transferred_bytes()
    );
    println!(
        "fetched '{}' to {}",
        args.remote_name,
        args.output.display()
    );
    Ok(())
}

pub fn run_list(args: &ListArgs) -> Result<()> {
    let addr = parse_server_addr(&args.server, TCP_PORT)?;
    let mut client = TransferClient::new(PROTOCOL_VERSION, args.identity.clone());
    if client.connect(addr) != TransferStatus::Connected {
        bail!("could not connect to {addr}");
    }

    let entries = match client.get_list() {
        Ok(entries) => entries,
        Err(status) => bail!("list retrieval failed: {status}"),
    };
    if entries.is_empty() {
        println!("server has no entries");
        return Ok(());
    }
    for entry in entries {
        println!("{}  ({} metadata bytes)", entry.name, entry.data.len());
    }
    Ok(())
}
