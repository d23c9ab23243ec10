//! Upstream Companion Satellite connection configuration.

use serde::Deserialize;

use super::error::ValidationError;

/// Device descriptor announced in the `BEGIN` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_product_name")]
    pub product_name: String,

    #[serde(default = "default_keys_per_row")]
    pub keys_per_row: u32,

    #[serde(default = "default_keys_total")]
    pub keys_total: u32,

    #[serde(default = "default_bitmap_size")]
    pub bitmap_size: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            product_name: default_product_name(),
            keys_per_row: default_keys_per_row(),
            keys_total: default_keys_total(),
            bitmap_size: default_bitmap_size(),
        }
    }
}

/// Upstream adapter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CompanionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(flatten)]
    pub device: DeviceConfig,

    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Base reconnect delay in milliseconds; doubles per attempt up to
    /// the 60 s cap.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,

    /// Zero means unlimited attempts.
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
}

impl CompanionConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.device.device_id.is_empty() {
            return Err(ValidationError::Empty { field: "companion.device_id" });
        }
        if !(100..=600_000).contains(&self.reconnect_delay) {
            return Err(ValidationError::OutOfRange {
                field: "companion.reconnect_delay",
                min: 100,
                max: 600_000,
            });
        }
        if !(1_000..=300_000).contains(&self.heartbeat_interval) {
            return Err(ValidationError::OutOfRange {
                field: "companion.heartbeat_interval",
                min: 1_000,
                max: 300_000,
            });
        }
        if !(1_000..=120_000).contains(&self.connection_timeout) {
            return Err(ValidationError::OutOfRange {
                field: "companion.connection_timeout",
                min: 1_000,
                max: 120_000,
            });
        }
        Ok(())
    }
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            device: DeviceConfig::default(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_attempts: 0,
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    16622
}

fn default_device_id() -> String {
    "bridge-virtual-surface".to_string()
}

fn default_product_name() -> String {
    "Satellite Bridge".to_string()
}

fn default_keys_per_row() -> u32 {
    8
}

fn default_keys_total() -> u32 {
    32
}

fn default_bitmap_size() -> u32 {
    72
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_heartbeat_interval() -> u64 {
    10_000
}

fn default_connection_timeout() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_satellite_port() {
        let config = CompanionConfig::default();
        assert_eq!(config.port, 16622);
        assert_eq!(config.url(), "ws://127.0.0.1:16622");
        assert!(config.auto_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_fails_validation() {
        let config = CompanionConfig {
            port: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err(), ValidationError::InvalidPort);
    }

    #[test]
    fn reconnect_delay_bounds() {
        let config = CompanionConfig {
            reconnect_delay: 50,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn device_fields_flatten_into_the_section() {
        let config: CompanionConfig = serde_json::from_value(serde_json::json!({
            "host": "10.0.0.2",
            "device_id": "desk-left",
            "keys_total": 16
        }))
        .unwrap();
        assert_eq!(config.device.device_id, "desk-left");
        assert_eq!(config.device.keys_total, 16);
        assert_eq!(config.device.keys_per_row, 8);
    }
}
