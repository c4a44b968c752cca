use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::{MAX_LOG_BUFFER_SIZE, UPDATE_INTERVAL};
use crate::decoder::ExportFormat;
use crate::error::{Error, Result};
use crate::network::{ListenerConfig, DEFAULT_PORT};

/// What ends up in the log.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Every non-blank payload, with timestamp and addresses.
    #[default]
    Raw,
    /// Only the first marker match in each payload.
    Pattern,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Application the exporter filters on. Not interpreted here.
    pub target_app: String,
    pub mode: Mode,
    pub start_marker: String,
    pub end_marker: String,
    pub forward_url: Option<String>,
    pub update_interval_ms: u64,
    pub max_log_buffer: usize,
    pub export_format: ExportFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            target_app: String::new(),
            mode: Mode::Raw,
            start_marker: "GZ00".to_string(),
            end_marker: "GZ00".to_string(),
            forward_url: None,
            update_interval_ms: UPDATE_INTERVAL.as_millis() as u64,
            max_log_buffer: MAX_LOG_BUFFER_SIZE,
            export_format: ExportFormat::Pcap,
        }
    }
}

impl Config {
    /// Read a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_interval_ms == 0 {
            return Err(Error::Config("update interval must be non-zero".to_string()));
        }
        if self.max_log_buffer == 0 {
            return Err(Error::Config("log buffer size must be non-zero".to_string()));
        }
        if self.mode == Mode::Pattern
            && (self.start_marker.is_empty() || self.end_marker.is_empty())
        {
            return Err(Error::Config(
                "pattern mode needs a start and end marker".to_string(),
            ));
        }
        if let Some(url) = &self.forward_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!("forward URL must be http(s): {url}")));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            bind: self.listen_addr(),
            export_format: self.export_format,
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Settings the capture tool must be started with so its exporter
    /// reaches this receiver.
    pub fn exporter_settings(&self) -> Vec<(&'static str, String)> {
        vec![
            ("pcap_dump_mode", "udp_exporter".to_string()),
            ("collector_ip_address", self.bind_address.to_string()),
            ("collector_port", self.port.to_string()),
            ("pcapdroid_trailer", "true".to_string()),
            ("full_payload", "true".to_string()),
            ("app_filter", self.target_app.clone()),
        ]
    }
}
