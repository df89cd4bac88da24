mod runtime;

use crate::runtime::{load_runtime, DaemonArgs, DaemonRuntime};
use clap::Parser;
use eyre::{Context, Result};
use log::{info, warn};
use porter_core::server::{DiscoveryResponder, FileServer};
use porter_core::session::SessionRegistry;
use porter_core::tar::TarMember;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = DaemonArgs::parse();
    let runtime = load_runtime(&args)?;
    let DaemonRuntime {
        bind_host,
        tcp_port,
        udp_port,
        name,
        root,
        no_discovery,
        pipes,
        warnings,
    } = runtime;

    for warning in &warnings {
        eprintln!("[warn] {warning}");
    }

    let sessions = Arc::new(SessionRegistry::new());
    for pipe in &pipes {
        let fn_random = rand::random::<u32>() as i64;
        let member = TarMember::open(&pipe.command, pipe.backupnum, fn_random, pipe.output.clone())
            .with_context(|| format!("starting pipe '{}'", pipe.output))?;
        let report = member.drain_and_report(&sessions, None);
        info!(
            "pipe '{}' announced, {} report bytes, {} sessions registered",
            pipe.output,
            report.len(),
            sessions.len()
        );
    }

    if !no_discovery {
        let addr: SocketAddr = format!("{bind_host}:{udp_port}")
            .parse()
            .with_context(|| format!("invalid discovery bind address {bind_host}:{udp_port}"))?;
        match DiscoveryResponder::bind(addr, name.clone()) {
            Ok(responder) => {
                thread::spawn(move || {
                    if let Err(e) = responder.run() {
                        warn!("discovery responder stopped: {e}");
                    }
                });
            }
            Err(e) => warn!("discovery disabled: {e}"),
        }
    }

    let server = FileServer::bind(
        format!("{bind_host}:{tcp_port}"),
        root,
        Arc::clone(&sessions),
        None,
    )?;
    println!("porterd '{name}' listening on {}", server.local_addr()?);
    server.run()
}
