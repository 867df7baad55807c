use serde::Deserialize;
use std::env;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct Config {
    pub devices: Vec<DeviceEntry>,
    /// Optional product catalog dump; without it every device falls back to
    /// its self-reported type code and the built-in model names.
    pub catalog_file: Option<String>,
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub ip: IpAddr,
    #[serde(default)]
    pub alias: Option<String>,
}

impl DeviceEntry {
    pub fn display_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.ip.to_string())
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let devices = load_devices(&devices_file)?;

        let config = Self {
            devices,
            catalog_file: env_optional("CATALOG_FILE"),
            status_interval_secs: env_or_default("STATUS_INTERVAL_SECS", 30),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.devices.is_empty() {
            return Err("No devices found in devices file".into());
        }
        if self.status_interval_secs == 0 {
            return Err("STATUS_INTERVAL_SECS must be > 0".into());
        }
        Ok(())
    }
}

fn load_devices(path: &str) -> Result<Vec<DeviceEntry>, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read {path}: {e}"))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse {path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_devices_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"[{"ip": "192.168.1.50", "alias": "Light_01"}, {"ip": "192.168.1.51"}]"#,
        )
        .unwrap();

        let devices = load_devices(file.path().to_str().unwrap()).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].display_name(), "Light_01");
        assert_eq!(devices[1].display_name(), "192.168.1.51");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_devices("/nonexistent/devices.json").is_err());
    }
}
