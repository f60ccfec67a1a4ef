use std::env;
use std::path::{Path, PathBuf};

/// Default runtime home, read by [`BridgeConfig::from_env`].
pub const ENV_PYTHON_HOME: &str = "MT5BRIDGE_PYTHON_HOME";
/// Vendor module override, read by [`BridgeConfig::from_env`].
pub const ENV_VENDOR_MODULE: &str = "MT5BRIDGE_VENDOR_MODULE";
/// Log filter for `env_logger`.
pub const ENV_LOG: &str = "MT5BRIDGE_LOG";

pub const DEFAULT_PROGRAM_NAME: &str = "mt5bridge";
pub const DEFAULT_VENDOR_MODULE: &str = "MetaTrader5";

/// Static configuration of a bridge instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Program identity handed to the embedded runtime.
    pub program_name: String,
    /// Module imported at initialize and used by every dispatched method.
    pub vendor_module: String,
    /// Home directory of a self-contained runtime distribution.
    pub runtime_home: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program_name: DEFAULT_PROGRAM_NAME.to_string(),
            vendor_module: DEFAULT_VENDOR_MODULE.to_string(),
            runtime_home: None,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `MT5BRIDGE_PYTHON_HOME` and `MT5BRIDGE_VENDOR_MODULE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(home) = lookup(ENV_PYTHON_HOME).filter(|v| !v.is_empty()) {
            config.runtime_home = Some(PathBuf::from(home));
        }
        if let Some(module) = lookup(ENV_VENDOR_MODULE).filter(|v| !v.is_empty()) {
            config.vendor_module = module;
        }
        config
    }

    pub fn with_vendor_module(mut self, module: impl Into<String>) -> Self {
        self.vendor_module = module.into();
        self
    }

    pub fn with_runtime_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.runtime_home = Some(home.into());
        self
    }

    /// An explicit home wins over the configured default.
    pub fn resolve_home<'a>(&'a self, explicit: Option<&'a Path>) -> Option<&'a Path> {
        explicit.or(self.runtime_home.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_target_metatrader() {
        let config = BridgeConfig::default();
        assert_eq!(config.program_name, "mt5bridge");
        assert_eq!(config.vendor_module, "MetaTrader5");
        assert_eq!(config.runtime_home, None);
    }

    #[test]
    fn environment_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            (ENV_PYTHON_HOME, "C:\\mt5\\python"),
            (ENV_VENDOR_MODULE, "mock_mt5"),
        ]
        .into_iter()
        .collect();
        let config = BridgeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.vendor_module, "mock_mt5");
        assert_eq!(config.runtime_home, Some(PathBuf::from("C:\\mt5\\python")));
    }

    #[test]
    fn empty_environment_values_are_ignored() {
        let config = BridgeConfig::from_lookup(|_| Some(String::new()));
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn explicit_home_takes_precedence() {
        let config = BridgeConfig::default().with_runtime_home("/opt/python");
        let explicit = PathBuf::from("/srv/python");
        assert_eq!(config.resolve_home(Some(&explicit)), Some(explicit.as_path()));
        assert_eq!(config.resolve_home(None), Some(Path::new("/opt/python")));
    }
}
