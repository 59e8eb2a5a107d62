use std::env;
use std::path::PathBuf;

use tracing::warn;

use crate::orchestrator::rtc::{RtcConfig, DEFAULT_STUN_SERVER};
use crate::transport::{DeviceClass, TransferConfig};

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8000";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub device_class: DeviceClass,
    pub transfer: TransferConfig,
    /// STUN/TURN urls. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    pub trickle: bool,
    pub download_dir: PathBuf,
}

impl ClientConfig {
    /// Defaults overlaid with `TANDEM_SERVER_URL`, `TANDEM_ICE_SERVERS`
    /// (comma separated), `TANDEM_LOCALHOST_ONLY` and the transfer tuning
    /// variables.
    pub fn from_env(device_class: DeviceClass) -> Self {
        let server_url = env::var("TANDEM_SERVER_URL")
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        let ice_servers = if env_flag("TANDEM_LOCALHOST_ONLY") {
            Vec::new()
        } else {
            match env::var("TANDEM_ICE_SERVERS") {
                Ok(value) => parse_ice_servers(&value),
                Err(_) => vec![DEFAULT_STUN_SERVER.to_string()],
            }
        };

        Self {
            server_url,
            device_class,
            transfer: TransferConfig::from_env(device_class),
            ice_servers,
            trickle: false,
            download_dir: PathBuf::from("."),
        }
    }

    pub fn rtc(&self) -> RtcConfig {
        RtcConfig {
            ice_servers: self.ice_servers.clone(),
            trickle: self.trickle,
            ..RtcConfig::default()
        }
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "" | "0" | "false" | "no" | "off" => false,
            other => {
                warn!(variable = name, value = other, "unrecognised boolean; treating as false");
                false
            }
        },
        Err(_) => false,
    }
}

fn parse_ice_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_server_list_is_trimmed() {
        assert_eq!(
            parse_ice_servers(" stun:a.example:3478, ,turn:b.example "),
            vec!["stun:a.example:3478".to_string(), "turn:b.example".to_string()]
        );
        assert!(parse_ice_servers("").is_empty());
    }

    #[test]
    fn rtc_config_carries_servers_and_trickle() {
        let config = ClientConfig {
            server_url: DEFAULT_SERVER_URL.into(),
            device_class: DeviceClass::Desktop,
            transfer: TransferConfig::default(),
            ice_servers: vec!["stun:example.org:3478".into()],
            trickle: true,
            download_dir: PathBuf::from("."),
        };
        let rtc = config.rtc();
        assert_eq!(rtc.ice_servers, vec!["stun:example.org:3478".to_string()]);
        assert!(rtc.trickle);
        assert_eq!(rtc.data_channel_label, RtcConfig::default().data_channel_label);
    }
}
