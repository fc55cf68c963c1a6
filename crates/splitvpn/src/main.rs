//! splitvpn: per-app WireGuard tunnel manager CLI
//!
//! Operator tooling around `splitvpn-core`: config validation, wg-quick
//! rendering, key generation, and a simulated end-to-end session.

mod args;

use anyhow::{bail, Context, Result};
use args::{Args, Command, SimulateArgs};
use clap::Parser;
use serde::Serialize;
use splitvpn_core::sim::{SimulatedBackend, SimulatedHost};
use splitvpn_core::{
    selectable_apps, AppCatalog, AppSelection, BackendLifecycle, CallerError, KeyPair, Settings,
    StaticCatalog, TunnelConfig, TunnelSupervisor,
};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr, so stdout stays machine-readable)
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let settings = match &args.settings {
        Some(path) => Settings::from_toml_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };

    match args.command {
        Command::Check { config } => check(&config),
        Command::Render { config } => render(&config),
        Command::Keygen { endpoint } => keygen(endpoint.as_deref()),
        Command::Apps => apps(&settings),
        Command::Simulate(opts) => simulate(settings, opts).await,
    }
}

/// Read a config blob from a file, or stdin for `-`
fn read_blob(path: &Path) -> Result<Zeroizing<String>> {
    let mut raw = Zeroizing::new(String::new());
    if path.as_os_str() == "-" {
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read config from stdin")?;
    } else {
        *raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
    }
    Ok(raw)
}

fn load_config(path: &Path) -> Result<TunnelConfig> {
    let raw = read_blob(path)?;
    splitvpn_core::parse(&raw).context("Invalid tunnel configuration")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let join = |items: Vec<String>| items.join(", ");

    println!("Configuration OK");
    println!("  Endpoint:    {}", config.peer_endpoint());
    println!("  Peer key:    {}", config.peer_public_key());
    println!("  Address:     {}", config.local_address());
    println!("  Allowed IPs: {}", join(config.allowed_ips().iter().map(ToString::to_string).collect()));
    println!("  DNS:         {}", join(config.dns().iter().map(ToString::to_string).collect()));
    println!("  Keepalive:   {}s", config.persistent_keepalive_secs());
    println!("  MTU:         {}", config.mtu());
    Ok(())
}

fn render(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    print!("{}", config.to_wg_quick().as_str());
    Ok(())
}

fn keygen(endpoint: Option<&str>) -> Result<()> {
    let pair = KeyPair::generate();

    match endpoint {
        Some(endpoint) => {
            // Peer key is generated too, which only makes sense against the simulator
            let peer = KeyPair::generate();
            let blob = Zeroizing::new(
                serde_json::json!({
                    "privateKey": pair.private.to_base64().as_str(),
                    "publicKey": peer.public.to_base64(),
                    "serverEndpoint": endpoint,
                })
                .to_string(),
            );
            splitvpn_core::parse(&blob).context("Generated configuration is invalid")?;
            println!("{}", blob.as_str());
        }
        None => {
            println!("PrivateKey = {}", pair.private.to_base64().as_str());
            println!("PublicKey = {}", pair.public);
        }
    }
    Ok(())
}

fn apps(settings: &Settings) -> Result<()> {
    let apps = StaticCatalog::popular().installed_apps()?;
    print_json(&selectable_apps(apps, &settings.supervisor.self_identifier))
}

async fn simulate(settings: Settings, opts: SimulateArgs) -> Result<()> {
    let raw = read_blob(&opts.config)?;

    let host = Arc::new(SimulatedHost::new());
    host.fail_next_establish(opts.refuse_interface);
    let backend = Arc::new(SimulatedBackend::new());
    backend.stay_down_next(opts.fail_up);

    let supervisor = TunnelSupervisor::builder(host.clone(), BackendLifecycle::shared(backend.clone()))
        .settings(settings)
        .build()?;

    if !supervisor.request_permission().await {
        bail!("VPN permission denied");
    }

    let mut events = supervisor.subscribe();
    let watcher = tokio::spawn(async move {
        while events.changed().await.is_ok() {
            let state = *events.borrow_and_update();
            info!("Session state: {}", state);
        }
    });

    let selection: AppSelection = opts.apps.into_iter().collect();
    let result = supervisor.connect(&raw, selection).await;
    drop(raw);

    match &result {
        Ok(()) => {
            print_json(&supervisor.status().await)?;
            info!("Holding session for {}s (Ctrl-C to stop)", opts.hold_secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(opts.hold_secs)) => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl-C")?;
                    info!("Interrupted");
                }
            }
        }
        Err(e) => {
            error!("Connect failed: {}", e);
            print_json(&CallerError::from(e))?;
        }
    }

    supervisor.disconnect().await;
    print_json(&supervisor.status().await)?;
    watcher.abort();

    info!(
        "Simulation finished: {} interface requests, {} up calls, {} live interfaces",
        host.establish_calls(),
        backend.up_calls(),
        host.live_interfaces()
    );

    if let Err(e) = result {
        bail!("Session failed with {}", e.code());
    }
    Ok(())
}
