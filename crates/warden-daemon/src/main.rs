//! wardend: assembles the tunnel engine for local use.
//!
//! Loads a TOML config, compiles the filter selection into a block-set,
//! brings up the tunnel operator and keeper, and logs every lifecycle
//! transition. The virtual device descriptor is handed in by the launcher
//! (the way a platform VPN service passes one down); wardend never creates
//! TUN devices itself.

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use serde::Deserialize;
use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_bus::Command;
use warden_filters::{CompilerConfig, Filter, FilterCompiler, FilterSource, HostFetcher};
use warden_tunnel::{
    tunnel_operator, DeviceHandle, EngineConfig, Endpoint, KeeperConfig, PermissionTicket,
    Platform, PrivateKey, PublicKey, PumpConfig, PumpEvent, TunnelDeps, TunnelKeeper,
};

/// On-disk daemon configuration.
#[derive(Debug, Deserialize)]
struct DaemonConfig {
    tunnel: TunnelSection,
    #[serde(default)]
    filters: FilterSection,
}

#[derive(Debug, Deserialize)]
struct TunnelSection {
    gateway_id: String,
    gateway_ip: String,
    gateway_port: u16,
    private_key: String,
    peer_public_key: String,
    dns: Option<String>,
    device_fd: RawFd,
    #[serde(default)]
    power_saving: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FilterSection {
    #[serde(default)]
    blocklists: Vec<PathBuf>,
    #[serde(default)]
    allowlists: Vec<PathBuf>,
    #[serde(default)]
    blocked_hosts: Vec<String>,
}

/// Platform backed by a descriptor the launcher already opened. Permission
/// was settled before we were handed the descriptor.
struct HandedFdPlatform {
    fd: RawFd,
}

impl Platform for HandedFdPlatform {
    fn has_permission(&self) -> bool {
        true
    }

    fn request_permission(&self) -> PermissionTicket {
        PermissionTicket::resolved(true)
    }

    fn open_device(&self, config: &EngineConfig) -> io::Result<DeviceHandle> {
        // The pump owns and closes its descriptor, so hand out a duplicate
        // and keep the original for restarts.
        let fd = unsafe { libc::dup(self.fd) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        info!(device = %config.device_tag, fd, "device descriptor duplicated");
        Ok(DeviceHandle::new(fd))
    }

    fn shutdown_device(&self) {}
}

/// Reads host lists from disk; remote list sources are not available here.
struct LocalFetcher;

impl HostFetcher for LocalFetcher {
    fn fetch(&self, source: &FilterSource) -> Result<String> {
        match source {
            FilterSource::File { path } => std::fs::read_to_string(path)
                .with_context(|| format!("reading host list {}", path.display())),
            other => anyhow::bail!("source {other} needs the app's downloader"),
        }
    }
}

fn build_filters(section: &FilterSection) -> Vec<Filter> {
    let mut filters = Vec::new();
    for (i, path) in section.blocklists.iter().enumerate() {
        filters.push(
            Filter::new(
                format!("blocklist-{i}"),
                FilterSource::File { path: path.clone() },
            )
            .active(true),
        );
    }
    for (i, path) in section.allowlists.iter().enumerate() {
        filters.push(
            Filter::new(
                format!("allowlist-{i}"),
                FilterSource::File { path: path.clone() },
            )
            .active(true)
            .whitelist(true),
        );
    }
    for host in &section.blocked_hosts {
        filters.push(
            Filter::new(
                format!("host-{host}"),
                FilterSource::Single { host: host.clone() },
            )
            .active(true),
        );
    }
    filters
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "warden.toml".to_string());
    info!(path = %config_path, "wardend starting");

    let text = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading config {config_path}"))?;
    let config: DaemonConfig = toml::from_str(&text).context("parsing config")?;

    let engine_config = EngineConfig {
        gateway_id: config.tunnel.gateway_id.clone(),
        endpoint: Endpoint::new(
            config.tunnel.gateway_ip.parse().context("gateway_ip")?,
            config.tunnel.gateway_port,
        ),
        private_key: PrivateKey::from_base64(&config.tunnel.private_key)
            .context("private_key")?,
        peer_public_key: PublicKey::from_base64(&config.tunnel.peer_public_key)
            .context("peer_public_key")?,
        dns: config
            .tunnel
            .dns
            .as_deref()
            .unwrap_or("10.0.0.1")
            .parse()
            .context("dns")?,
        device_tag: "warden0".into(),
        keepalive: Some(25),
        power_saving: config.tunnel.power_saving,
    };
    engine_config.validate()?;

    // Compile the filter selection. A failed list read is logged and left
    // for the next refresh; the engine still comes up with what it has.
    let mut compiler = FilterCompiler::new(Arc::new(LocalFetcher), CompilerConfig::default());
    compiler.set_filters(build_filters(&config.filters));
    if let Err(e) = compiler.refresh(true) {
        warn!(error = %e, "filter compile incomplete, continuing with previous set");
    }
    info!(hosts = compiler.block_set().len(), "block-set ready");

    let (events_tx, events_rx) = unbounded();
    let tunnel = Arc::new(tunnel_operator(TunnelDeps {
        platform: Arc::new(HandedFdPlatform {
            fd: config.tunnel.device_fd,
        }),
        config: engine_config,
        blocked: compiler.handle(),
        pump: PumpConfig::default(),
        events: events_tx,
    }));

    // Log out-of-band pump events as they come.
    std::thread::spawn(move || {
        for event in events_rx.iter() {
            match event {
                PumpEvent::PowerSaving => {
                    warn!("pump reports repeated permission loss under power saving")
                }
                PumpEvent::Stopped => info!("pump stopped"),
            }
        }
    });

    let (_monitor_id, monitor) = tunnel.monitor();
    let keeper = TunnelKeeper::new(tunnel, KeeperConfig::default());
    keeper.send(Command::On).wait().ok();

    // Stay up, narrating every lifecycle transition.
    while let Some(msg) = monitor.recv() {
        if let Some(state) = msg.state() {
            info!(%state, "tunnel state");
        }
    }

    info!("wardend shutting down");
    Ok(())
}
