//! Module configuration and factory lookup.
//!
//! A module is one configured instance of a proxy or interceptor kind. The
//! core keeps three ordered module lists (proxies, C2S interceptors, S2C
//! interceptors); the order of an interceptor list is the chain order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::error::CoreError;
use crate::interceptor::InterceptorFactory;
use crate::proxy::ProxyFactory;

/// One configured module.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleSpec {
    /// Unique code of this module instance.
    pub code: String,

    /// Display name. Defaults to the code.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Code of the registered factory that builds this module.
    pub factory: String,

    /// Disabled modules are never instantiated.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Factory specific settings.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl ModuleSpec {
    pub fn new(code: impl Into<String>, factory: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code,
            description: String::new(),
            factory: factory.into(),
            enabled: true,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Display name, falling back to the code.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.code
        } else {
            &self.name
        }
    }

    /// Deserialize the factory specific settings.
    pub fn parse_config<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.config.is_null() {
            serde_json::from_value(serde_json::Value::Object(Default::default()))
        } else {
            serde_json::from_value(self.config.clone())
        }
    }
}

/// The three ordered module lists of a core.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreModules {
    #[serde(default)]
    pub proxies: Vec<ModuleSpec>,
    #[serde(default)]
    pub interceptors_c2s: Vec<ModuleSpec>,
    #[serde(default)]
    pub interceptors_s2c: Vec<ModuleSpec>,
}

/// Factories available to build modules, keyed by factory code.
#[derive(Default)]
pub struct ModuleRegistry {
    proxies: RwLock<HashMap<String, Arc<dyn ProxyFactory>>>,
    interceptors: RwLock<HashMap<String, Arc<dyn InterceptorFactory>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a proxy factory, replacing any factory with the same code.
    pub fn register_proxy(&self, factory: Arc<dyn ProxyFactory>) {
        self.proxies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(factory.code().to_string(), factory);
    }

    /// Register an interceptor factory, replacing any factory with the same code.
    pub fn register_interceptor(&self, factory: Arc<dyn InterceptorFactory>) {
        self.interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(factory.code().to_string(), factory);
    }

    pub fn proxy_factory(&self, module: &ModuleSpec) -> Result<Arc<dyn ProxyFactory>, CoreError> {
        self.proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&module.factory)
            .cloned()
            .ok_or_else(|| unknown("proxy", module))
    }

    pub fn interceptor_factory(
        &self,
        module: &ModuleSpec,
    ) -> Result<Arc<dyn InterceptorFactory>, CoreError> {
        self.interceptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&module.factory)
            .cloned()
            .ok_or_else(|| unknown("interceptor", module))
    }

    /// Codes of the registered proxy factories, sorted.
    pub fn proxy_codes(&self) -> Vec<String> {
        let mut codes: Vec<_> = self
            .proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        codes.sort();
        codes
    }

    /// Codes of the registered interceptor factories, sorted.
    pub fn interceptor_codes(&self) -> Vec<String> {
        let mut codes: Vec<_> = self
            .interceptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        codes.sort();
        codes
    }
}

fn unknown(kind: &'static str, module: &ModuleSpec) -> CoreError {
    CoreError::UnknownFactory {
        kind,
        factory: module.factory.clone(),
        module: module.code.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[test]
    fn test_module_defaults() {
        let module: ModuleSpec =
            serde_json::from_str(r#"{"code": "tcp-1", "factory": "tcp"}"#).unwrap();
        assert!(module.enabled);
        assert_eq!(module.display_name(), "tcp-1");
        assert!(module.config.is_null());
    }

    #[test]
    fn test_parse_config_from_null() {
        #[derive(Deserialize, Default)]
        struct Settings {
            #[serde(default)]
            port: u16,
        }

        let module = ModuleSpec::new("m", "f");
        let settings: Settings = module.parse_config().unwrap();
        assert_eq!(settings.port, 0);

        let module = module.with_config(serde_json::json!({"port": 8080}));
        let settings: Settings = module.parse_config().unwrap();
        assert_eq!(settings.port, 8080);
    }

    #[test]
    fn test_unknown_factory() {
        let registry = ModuleRegistry::new();
        let module = ModuleSpec::new("m", "missing");

        assert!(matches!(
            registry.proxy_factory(&module),
            Err(CoreError::UnknownFactory { kind: "proxy", .. })
        ));
        assert!(matches!(
            registry.interceptor_factory(&module),
            Err(CoreError::UnknownFactory { kind: "interceptor", .. })
        ));
    }
}
