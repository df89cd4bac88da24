use clap::Parser;
use eyre::{Context, Result};
use porter_core::protocol::{TCP_PORT, UDP_PORT};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// One archive pipe exposed through the session registry.
#[derive(Debug, Clone)]
pub(crate) struct PipeSpec {
    pub(crate) output: String,
    pub(crate) command: String,
    pub(crate) backupnum: i32,
}

#[derive(Debug)]
pub(crate) struct DaemonRuntime {
    pub(crate) bind_host: String,
    pub(crate) tcp_port: u16,
    pub(crate) udp_port: u16,
    pub(crate) name: String,
    pub(crate) root: Option<PathBuf>,
    pub(crate) no_discovery: bool,
    pub(crate) pipes: Vec<PipeSpec>,
    pub(crate) warnings: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(name = "porterd", about = "Backup transfer server: files, pipe sessions, discovery")]
pub(crate) struct DaemonArgs {
    /// Path to the daemon configuration file (TOML)
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    /// Host/IP address to bind (overrides config file)
    #[arg(long)]
    pub(crate) bind: Option<String>,
    /// Transfer port to bind (overrides config file)
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Discovery UDP port to bind (overrides config file)
    #[arg(long)]
    pub(crate) udp_port: Option<u16>,
    /// Served root directory
    #[arg(long)]
    pub(crate) root: Option<PathBuf>,
    /// Server name announced to discovery probes
    #[arg(long)]
    pub(crate) name: Option<String>,
    /// Do not answer discovery probes
    #[arg(long)]
    pub(crate) no_discovery: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    daemon: RawDaemonSection,
    #[serde(default, rename = "pipe")]
    pipes: Vec<RawPipe>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDaemonSection {
    bind: Option<String>,
    port: Option<u16>,
    udp_port: Option<u16>,
    name: Option<String>,
    root: Option<PathBuf>,
    no_discovery: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawPipe {
    output: String,
    command: String,
    #[serde(default)]
    backupnum: i32,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "porter".to_string())
}

pub(crate) fn load_runtime(args: &DaemonArgs) -> Result<DaemonRuntime> {
    let mut warnings = Vec::new();

    let raw = match &args.config {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<RawConfig>(&content)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => RawConfig::default(),
    };

    let root = args.root.clone().or(raw.daemon.root);
    if let Some(root) = &root {
        if !root.is_dir() {
            warnings.push(format!(
                "served root {} is not a directory; file requests will fail",
                root.display()
            ));
        }
    }

    let pipes: Vec<PipeSpec> = raw
        .pipes
        .into_iter()
        .map(|pipe| PipeSpec {
            output: pipe.output,
            command: pipe.command,
            backupnum: pipe.backupnum,
        })
        .collect();
    if root.is_none() && pipes.is_empty() {
        warnings.push("neither a root directory nor pipes are configured".to_string());
    }

    Ok(DaemonRuntime {
        bind_host: args
            .bind
            .clone()
            .or(raw.daemon.bind)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        tcp_port: args.port.or(raw.daemon.port).unwrap_or(TCP_PORT),
        udp_port: args.udp_port.or(raw.daemon.udp_port).unwrap_or(UDP_PORT),
        name: args
            .name
            .clone()
            .or(raw.daemon.name)
            .unwrap_or_else(default_name),
        root,
        no_discovery: args.no_discovery || raw.daemon.no_discovery.unwrap_or(false),
        pipes,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args_with_config(path: Option<PathBuf>) -> DaemonArgs {
        DaemonArgs {
            config: path,
            bind: None,
            port: None,
            udp_port: None,
            root: None,
            name: None,
            no_discovery: false,
        }
    }

    #[test]
    fn test_defaults_without_config() {
        let runtime = load_runtime(&args_with_config(None)).unwrap();
        assert_eq!(runtime.bind_host, "0.0.0.0");
        assert_eq!(runtime.tcp_port, TCP_PORT);
        assert_eq!(runtime.udp_port, UDP_PORT);
        assert!(!runtime.no_discovery);
        assert!(runtime.pipes.is_empty());
        // Nothing to serve yet: the runtime should say so.
        assert!(!runtime.warnings.is_empty());
    }

    #[test]
    fn test_config_file_with_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[daemon]
bind = "127.0.0.1"
port = 45000
name = "vault"

[[pipe]]
output = "nightly.tar"
command = "tar -c /data"
backupnum = 4
"#
        )
        .unwrap();

        let mut args = args_with_config(Some(file.path().to_path_buf()));
        args.port = Some(45999);
        let runtime = load_runtime(&args).unwrap();

        assert_eq!(runtime.bind_host, "127.0.0.1");
        assert_eq!(runtime.tcp_port, 45999, "flags beat the config file");
        assert_eq!(runtime.name, "vault");
        assert_eq!(runtime.pipes.len(), 1);
        assert_eq!(runtime.pipes[0].output, "nightly.tar");
        assert_eq!(runtime.pipes[0].backupnum, 4);
    }
}
