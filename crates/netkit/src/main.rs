use std::sync::Arc;

use anyhow::Context;
use nk_common::EventBus;
use nk_common::config::EnvConfig;
use nk_dhcp::{DhcpConfig, DhcpModule};
use nk_runtime::{ModuleHandle, ModuleRegistry};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,netkit=debug")),
        )
        .init();

    info!("netkit starting...");

    let env = EnvConfig::load(None).context("Failed to load environment config")?;

    let bus = Arc::new(EventBus::new());
    let registry = ModuleRegistry::new();
    spawn_event_logger(&bus)?;

    // ── DHCP server ────────────────────────────────────────────────────

    if env.dhcp_enabled {
        let mut config = match &env.dhcp_config_path {
            Some(path) => DhcpConfig::load(path)?,
            None => {
                info!("No DHCP config file, using defaults");
                DhcpConfig::default()
            }
        };
        config.address = env.dhcp_address;
        config.port = env.dhcp_port;

        let dhcp = Arc::new(ModuleHandle::new("dhcp", DhcpModule::new(), Arc::clone(&bus)));
        config.apply(&dhcp)?;
        registry.register(Arc::clone(&dhcp))?;
        dhcp.start()?;
        info!(
            "DHCP server on {}:{}, range {:?}",
            config.address,
            config.port,
            config.range()
        );
    } else {
        info!("DHCP server disabled");
    }

    // Wait for shutdown signal
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    if let Some(signal) = signals.forever().next() {
        info!("Received signal {signal}, shutting down...");
    }

    registry.stop_all();
    for status in registry.statuses() {
        debug!("{}", serde_json::to_string(&status)?);
    }
    info!("netkit stopped");
    Ok(())
}

/// Log every bus event from a dedicated thread.
fn spawn_event_logger(bus: &Arc<EventBus>) -> anyhow::Result<()> {
    let mut events = bus.emitter();
    std::thread::Builder::new()
        .name("nk-events".to_string())
        .spawn(move || {
            loop {
                match events.blocking_recv() {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => info!(target: "netkit::events", "{json}"),
                        Err(e) => warn!("Unserializable event {:?}: {e}", event.kind()),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {skipped} events"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
        .context("Failed to spawn event logger")?;
    Ok(())
}
