mod supervisor;

#[cfg(not(target_os = "linux"))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("homestead serves raw DHCP frames and requires Linux packet sockets");
}

#[cfg(target_os = "linux")]
use std::path::{Path, PathBuf};
#[cfg(target_os = "linux")]
use std::sync::Arc;

#[cfg(target_os = "linux")]
use hs_dhcp::DhcpServer;
#[cfg(target_os = "linux")]
use hs_dhcp::clock::SystemClock;
#[cfg(target_os = "linux")]
use hs_dhcp::device::{NoopChecker, PacketCaptureManager};
#[cfg(target_os = "linux")]
use signal_hook::consts::SIGHUP;
#[cfg(target_os = "linux")]
use signal_hook_tokio::Signals;
#[cfg(target_os = "linux")]
use supervisor::{ServicePriority, spawn_supervised};
#[cfg(target_os = "linux")]
use tokio_stream::StreamExt;
#[cfg(target_os = "linux")]
use tracing::{error, info};

/// Service configuration document. The `dhcp` block is ours; sibling blocks
/// belong to the other subsystems sharing the file.
#[cfg(target_os = "linux")]
#[derive(serde::Deserialize, Default)]
struct ServiceConfig {
    #[serde(default)]
    dhcp: hs_dhcp::DhcpConfig,
}

#[cfg(target_os = "linux")]
impl ServiceConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            info!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

#[cfg(target_os = "linux")]
fn build_server(config_path: &Path) -> anyhow::Result<DhcpServer> {
    let conf = ServiceConfig::load(config_path)?;
    let server = DhcpServer::new(&conf.dhcp, Arc::new(SystemClock), Arc::new(NoopChecker))?;
    info!(
        "DHCP {} ({} interface(s) configured)",
        if server.enabled() { "enabled" } else { "disabled" },
        conf.dhcp.interfaces.len()
    );
    Ok(server)
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,homestead=debug".parse().unwrap()),
        )
        .init();

    info!("Homestead starting...");

    let config_path = std::env::var("HOMESTEAD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/homestead/config.json"));

    let manager = Arc::new(PacketCaptureManager);
    let mut signals = Signals::new([SIGHUP])?;

    let mut server = Arc::new(build_server(&config_path)?);

    'run: loop {
        let handle = {
            let server = server.clone();
            let manager = manager.clone();
            spawn_supervised("dhcpv4", ServicePriority::Critical, move || {
                let server = server.clone();
                let manager = manager.clone();
                async move {
                    server.serve(manager.as_ref()).await?;
                    Ok(())
                }
            })
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    server.shutdown().await;
                    let _ = handle.await;
                    info!("Homestead stopped");
                    return Ok(());
                }
                signal = signals.next() => {
                    if signal != Some(SIGHUP) {
                        continue;
                    }
                    info!("Received SIGHUP, reloading configuration...");
                    match build_server(&config_path) {
                        Ok(reborn) => {
                            server.shutdown().await;
                            let _ = handle.await;
                            server = Arc::new(reborn);
                            continue 'run;
                        }
                        Err(e) => {
                            error!("Config reload failed, keeping the running service: {e:#}");
                        }
                    }
                }
            }
        }
    }
}
