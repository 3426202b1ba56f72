//! interpose daemon
//!
//! Runs the interpose engine with the modules listed in a TOML file.
//!
//! This service:
//! - Loads proxy and interceptor modules from `INTERPOSE_CONFIG`
//! - Registers the built-in TCP proxy factory
//! - Starts the core and keeps it running until Ctrl-C
//!
//! The binary is proxy-only: it registers no interceptor factories, so an
//! enabled `[[interceptors_c2s]]` or `[[interceptors_s2c]]` entry is rejected
//! before the core starts. Applications that need interceptors embed
//! `interpose-core` and register their own factories.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use interpose_core::{Core, CoreState, ModuleRegistry};
use interpose_tcp::TcpProxyFactory;

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to INTERPOSE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting interpose daemon");
    info!(
        config_path = %config.config_path.display(),
        proxies = config.modules.proxies.len(),
        interceptors_c2s = config.modules.interceptors_c2s.len(),
        interceptors_s2c = config.modules.interceptors_s2c.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(ModuleRegistry::new());
    registry.register_proxy(Arc::new(TcpProxyFactory::new()));
    config::check_factories(&config.modules, &registry)?;

    let core = Core::new(registry, config.modules);
    if !core.start() {
        bail!("Core is already running");
    }

    let reached = *core
        .subscribe()
        .wait_for(|state| matches!(state, CoreState::Started | CoreState::Stopped))
        .await
        .context("Core state channel closed")?;
    if reached == CoreState::Stopped {
        bail!("Core failed to start, see previous errors");
    }

    info!("Core started, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    core.stop();
    core.wait_for_state(CoreState::Stopped).await;
    info!("Core stopped");

    Ok(())
}
