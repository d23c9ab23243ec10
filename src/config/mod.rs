//! Application configuration.
//!
//! Configuration loads from an optional file (named on the command line
//! or by `BRIDGE_CONFIG_PATH`) and is overlaid with scalar overrides
//! from `BRIDGE_<SECTION>_<KEY>` environment variables, parsed by value:
//! `true`/`false`, integers, floats, and comma-separated lists.
//!
//! # Example
//!
//! ```no_run
//! use satellite_bridge::config::BridgeConfig;
//!
//! let config = BridgeConfig::load(None).expect("failed to load configuration");
//! config.validate().expect("invalid configuration");
//! println!("upstream at {}", config.companion.url());
//! ```

mod companion;
mod error;
mod observability;
mod server;

pub use companion::{CompanionConfig, DeviceConfig};
pub use error::{ConfigError, ValidationError};
pub use observability::ObservabilityConfig;
pub use server::ServerConfig;

use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "BRIDGE_CONFIG_PATH";

const ENV_PREFIX: &str = "BRIDGE_";
const SECTIONS: &[&str] = &["companion", "server", "observability"];

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub companion: CompanionConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl BridgeConfig {
    /// Loads configuration from the given file (or `BRIDGE_CONFIG_PATH`
    /// when absent), then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let env_path = std::env::var(CONFIG_PATH_VAR).ok();
        let path = path
            .map(|p| p.to_path_buf())
            .or_else(|| env_path.map(std::path::PathBuf::from));

        let base: Value = match path {
            Some(path) => {
                let settings = config::Config::builder()
                    .add_source(config::File::from(path.as_path()))
                    .build()?;
                settings.try_deserialize()?
            }
            None => json!({}),
        };

        let merged = apply_env_overrides(base, std::env::vars());
        Ok(serde_json::from_value(merged)?)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.companion.validate()?;
        self.server.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

/// Overlays `BRIDGE_<SECTION>_<KEY>` variables onto the loaded tree.
fn apply_env_overrides(
    mut base: Value,
    vars: impl Iterator<Item = (String, String)>,
) -> Value {
    if !base.is_object() {
        base = json!({});
    }

    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let Some(section) = SECTIONS
            .iter()
            .find(|s| rest.to_lowercase().starts_with(&format!("{}_", s)))
        else {
            continue;
        };
        let key = rest[section.len() + 1..].to_lowercase();
        if key.is_empty() {
            continue;
        }

        let tree = base.as_object_mut().expect("base normalized to object");
        let section_obj = tree
            .entry(section.to_string())
            .or_insert_with(|| json!({}));
        if let Some(obj) = section_obj.as_object_mut() {
            obj.insert(key, parse_env_value(&raw));
        }
    }
    base
}

/// Parses an override by value: booleans, integers, floats, and
/// comma-separated lists; anything else stays a string.
fn parse_env_value(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return json!(f);
    }
    if raw.contains(',') {
        let items: Vec<Value> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect();
        return Value::Array(items);
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_file_or_env() {
        let config: BridgeConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.companion.port, 16622);
        assert_eq!(config.server.max_clients, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_land_in_their_sections() {
        let vars = vec![
            ("BRIDGE_COMPANION_HOST".to_string(), "10.1.2.3".to_string()),
            ("BRIDGE_COMPANION_RECONNECT_DELAY".to_string(), "2000".to_string()),
            ("BRIDGE_SERVER_REQUIRE_AUTH".to_string(), "true".to_string()),
            (
                "BRIDGE_SERVER_AUTH_TOKENS".to_string(),
                "alpha, beta,gamma".to_string(),
            ),
            ("UNRELATED".to_string(), "x".to_string()),
            ("BRIDGE_CONFIG_PATH".to_string(), "/dev/null".to_string()),
        ];

        let merged = apply_env_overrides(json!({}), vars.into_iter());
        let config: BridgeConfig = serde_json::from_value(merged).unwrap();

        assert_eq!(config.companion.host, "10.1.2.3");
        assert_eq!(config.companion.reconnect_delay, 2_000);
        assert!(config.server.require_auth);
        assert_eq!(
            config.server.auth_tokens,
            vec!["alpha", "beta", "gamma"]
        );
    }

    #[test]
    fn env_overrides_beat_file_values() {
        let base = json!({
            "server": { "port": 9000, "max_clients": 8 }
        });
        let vars = vec![("BRIDGE_SERVER_PORT".to_string(), "9999".to_string())];

        let merged = apply_env_overrides(base, vars.into_iter());
        let config: BridgeConfig = serde_json::from_value(merged).unwrap();

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.max_clients, 8);
    }

    #[test]
    fn values_parse_by_content() {
        assert_eq!(parse_env_value("true"), json!(true));
        assert_eq!(parse_env_value("42"), json!(42));
        assert_eq!(parse_env_value("1.5"), json!(1.5));
        assert_eq!(parse_env_value("a,b"), json!(["a", "b"]));
        assert_eq!(parse_env_value("plain"), json!("plain"));
    }

    #[test]
    fn invalid_section_values_fail_validation() {
        let merged = apply_env_overrides(
            json!({}),
            vec![("BRIDGE_SERVER_RATE_LIMIT_WINDOW".to_string(), "1".to_string())].into_iter(),
        );
        let config: BridgeConfig = serde_json::from_value(merged).unwrap();
        assert!(config.validate().is_err());
    }
}
