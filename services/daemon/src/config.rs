//! Daemon configuration (env-driven).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use interpose_core::{CoreModules, ModuleRegistry};

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TOML file listing the proxy and interceptor modules.
    pub config_path: PathBuf,

    /// Modules loaded from `config_path`.
    pub modules: CoreModules,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("INTERPOSE_CONFIG")
            .map(PathBuf::from)
            .context("Missing module config. Set INTERPOSE_CONFIG to a TOML file.")?;

        let modules = load_modules(&config_path)?;

        let log_level = std::env::var("INTERPOSE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            config_path,
            modules,
            log_level,
        })
    }
}

/// Read and parse a module file.
pub fn load_modules(path: &Path) -> Result<CoreModules> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_modules(&text).with_context(|| format!("Invalid module config in {}", path.display()))
}

/// Parse `[[proxies]]`, `[[interceptors_c2s]]` and `[[interceptors_s2c]]` tables.
pub fn parse_modules(text: &str) -> Result<CoreModules> {
    Ok(toml::from_str(text)?)
}

/// Fail early, naming the module, when an enabled module needs a factory the
/// daemon does not ship.
pub fn check_factories(modules: &CoreModules, registry: &ModuleRegistry) -> Result<()> {
    for module in modules.proxies.iter().filter(|m| m.enabled) {
        registry
            .proxy_factory(module)
            .with_context(|| format!("Proxy module '{}' cannot be built", module.code))?;
    }

    let interceptors = modules
        .interceptors_c2s
        .iter()
        .chain(&modules.interceptors_s2c)
        .filter(|m| m.enabled);
    for module in interceptors {
        registry.interceptor_factory(module).with_context(|| {
            format!(
                "Interceptor module '{}' cannot be built, interposed ships no interceptor factories",
                module.code
            )
        })?;
    }
    Ok(())
}
